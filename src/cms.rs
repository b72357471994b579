//! # Concurrent Mark-and-Sweep
//!
//! Collector driver. A cycle runs on the dedicated, unattached GC thread and goes through the
//! following stages.
//!
//! ## Suspension & marking handshake
//! The driver flags that marking is requested for the current epoch and arms the safepoint
//! barrier. A mutator that reaches a safepoint while the flag is up publishes its local
//! allocations, announces itself as marking and waits for the flag to drop. Threads in native
//! code or parked without marking are handled by the driver.
//!
//! ## Root set collection
//! Under the marking lock the driver drops the flag, publishes and enumerates the roots of every
//! thread that is not marking by itself, enumerates the global roots, and wakes the waiting
//! mutators. From then on the driver and the marking mutators drain the same [`MarkQueue`].
//!
//! ## Full suspension
//! Marking mutators park once their part of the queue is exhausted. The driver waits until every
//! thread is parked or in native code: at that point marking is complete.
//!
//! ## Sweeping
//! Sidecar records are swept first while mutators are still stopped. The driver then takes the
//! object store lock, resumes the mutators and sweeps the store. Objects allocated after
//! resumption sit in unpublished thread queues and cannot be published before the sweep lets go
//! of the lock, so a cycle never reclaims what was allocated after its marking.
//!
//! ## Finalization
//! Unreachable objects that need finalization are handed to the finalizer thread, in epoch
//! order, after the cycle is recorded as finished.
use std::{
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use atomic::Atomic;
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::{
    gc_state::{Epoch, GCHandle},
    heap::HeapInner,
    mark_queue::MarkQueue,
    marking::{mark, DefaultMarkTraits, MarkTraits},
    mutator::{SuspensionState, ThreadData},
    roots::{collect_root_set, collect_root_set_for_thread},
    sweeper::{sweep, sweep_extra_objects, DefaultSweepTraits, SweepTraits},
};

/// Whether mutators trace their own roots when they stop for a cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MarkingBehavior {
    MarkOwnStack,
    DoNotMark,
}

impl Default for MarkingBehavior {
    fn default() -> Self {
        Self::MarkOwnStack
    }
}

pub struct ConcurrentMarkAndSweep<
    M: MarkTraits = DefaultMarkTraits,
    S: SweepTraits = DefaultSweepTraits,
> {
    marking_mutex: Mutex<()>,
    marking_cond: Condvar,
    marking_requested: AtomicBool,
    marking_epoch: AtomicU64,
    marking_behavior: Atomic<MarkingBehavior>,
    mark_queue: MarkQueue,
    traits: PhantomData<fn() -> (M, S)>,
}

impl<M: MarkTraits, S: SweepTraits> ConcurrentMarkAndSweep<M, S> {
    pub fn new(marking_behavior: MarkingBehavior) -> Self {
        Self {
            marking_mutex: Mutex::new(()),
            marking_cond: Condvar::new(),
            marking_requested: AtomicBool::new(false),
            marking_epoch: AtomicU64::new(0),
            marking_behavior: Atomic::new(marking_behavior),
            mark_queue: MarkQueue::new(),
            traits: PhantomData,
        }
    }

    pub fn marking_behavior(&self) -> MarkingBehavior {
        self.marking_behavior.load(Ordering::Relaxed)
    }

    pub fn set_marking_behavior_for_tests(&self, behavior: MarkingBehavior) {
        self.marking_behavior.store(behavior, Ordering::Relaxed);
    }

    pub fn is_marking_requested(&self) -> bool {
        self.marking_requested.load(Ordering::Acquire)
    }

    fn set_marking_requested(&self, epoch: Epoch) {
        let _guard = self.marking_mutex.lock();
        self.marking_epoch.store(epoch, Ordering::Release);
        let requested = self.marking_behavior() == MarkingBehavior::MarkOwnStack;
        self.marking_requested.store(requested, Ordering::Release);
    }

    /// Runs on a mutator that hit a safepoint while suspension is requested, before it parks.
    pub(crate) fn on_suspend_for_gc(&self, heap: &HeapInner, thread: &ThreadData) {
        let mut guard = self.marking_mutex.lock();
        if !self.marking_requested.load(Ordering::Acquire) {
            return;
        }
        thread.set_suspension_state(SuspensionState::Marking);
        thread.publish(&heap.objects);
        while self.marking_requested.load(Ordering::Acquire) {
            self.marking_cond.wait(&mut guard);
        }
        drop(guard);

        let epoch = self.marking_epoch.load(Ordering::Acquire);
        let handle = match heap.state.handle(epoch) {
            Some(handle) => handle,
            None => gc_fatal!("[gc][epoch {}] marking without a running cycle", epoch),
        };
        log::trace!(
            "[gc][epoch {}] parallel marking in thread {}",
            epoch,
            thread.id()
        );
        collect_root_set_for_thread::<M>(&handle, &self.mark_queue, thread);
        mark::<M>(&handle, &self.mark_queue);
        thread.set_suspension_state(SuspensionState::SuspensionPending);
    }

    fn wait_for_threads_ready_to_mark(&self, heap: &HeapInner) {
        let backoff = Backoff::new();
        while !heap
            .safepoint
            .all_threads(|t| t.is_suspended_or_native() || t.is_marking())
        {
            backoff.snooze();
        }
    }

    fn collect_root_set_and_start_marking(&self, heap: &HeapInner, handle: &GCHandle) {
        let _guard = self.marking_mutex.lock();
        self.marking_requested.store(false, Ordering::Release);
        let threads = heap.safepoint.threads();
        for thread in threads.iter().filter(|t| !t.is_marking()) {
            thread.publish(&heap.objects);
        }
        collect_root_set::<M>(
            handle,
            &self.mark_queue,
            &threads,
            &heap.global_roots,
            |thread| !thread.is_marking(),
        );
        self.marking_cond.notify_all();
    }

    /// One full collection cycle for `handle`'s epoch. Must run on an unattached thread.
    pub(crate) fn run_gc(&self, heap: &HeapInner, handle: &GCHandle) {
        self.set_marking_requested(handle.epoch());
        if !heap.safepoint.request_threads_suspension() {
            gc_fatal!(
                "[gc][epoch {}] thread suspension was already requested",
                handle.epoch()
            );
        }
        handle.suspension_requested();
        if heap.safepoint.is_current_thread_registered() {
            gc_fatal!("concurrent GC must run on an unregistered thread");
        }

        self.wait_for_threads_ready_to_mark(heap);
        handle.threads_are_suspended();

        handle.started();
        self.collect_root_set_and_start_marking(heap, handle);
        handle.marking();
        mark::<M>(handle, &self.mark_queue);

        heap.safepoint.wait_for_threads_suspension();
        debug_assert!(self.mark_queue.is_empty());
        debug_assert_eq!(self.mark_queue.pending(), 0);
        handle.marking_done();

        sweep_extra_objects::<S>(handle, &heap.extra_objects);

        let mut objects = heap.objects.lock_for_iter();
        heap.safepoint.resume_threads();
        handle.threads_are_resumed();
        #[cfg(test)]
        heap.run_sweep_hook();

        handle.sweeping();
        let finalizer_queue = sweep::<S>(handle, &mut objects, heap.extra_objects.clone());
        drop(objects);

        handle.finalizers_scheduled(finalizer_queue.len());
        heap.on_cycle_swept(handle);
        heap.state.cycle_finished(handle);
        heap.finalizer_processor
            .schedule_tasks(finalizer_queue, handle.epoch());
    }
}
