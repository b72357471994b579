use std::{
    marker::PhantomData,
    sync::Arc,
    thread::{self, JoinHandle, ThreadId},
};

use atomic::{Atomic, Ordering};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    extra_object::WeakRef,
    gc_state::Epoch,
    gcref::GcRef,
    heap::HeapRef,
    object_store::{ObjectFactory, ThreadQueue},
    roots::{GlobalRoot, Root, RootTable},
    type_info::TypeInfo,
};

/// Local allocations are published at the next safepoint poll once they exceed this size.
const PUBLISH_THRESHOLD: u64 = 256 * 1024;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Running managed code. Must poll safepoints.
    Runnable,
    /// Outside managed code. Roots and objects are left untouched.
    Native,
}

/// Progress of a thread through a suspension request.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SuspensionState {
    Running,
    SuspensionPending,
    /// Tracing its own roots on behalf of the collector.
    Marking,
    Suspended,
}

/// Collector-visible record of an attached thread.
pub struct ThreadData {
    id: usize,
    os_thread: ThreadId,
    state: Atomic<ThreadState>,
    suspension: Atomic<SuspensionState>,
    roots: RootTable,
    allocator: Mutex<ThreadQueue>,
}

impl ThreadData {
    pub(crate) fn new(id: usize, os_thread: ThreadId) -> Self {
        Self {
            id,
            os_thread,
            state: Atomic::new(ThreadState::Native),
            suspension: Atomic::new(SuspensionState::Running),
            roots: RootTable::new(),
            allocator: Mutex::new(ThreadQueue::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn os_thread(&self) -> ThreadId {
        self.os_thread
    }

    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, state: ThreadState) -> ThreadState {
        self.state.swap(state, Ordering::SeqCst)
    }

    pub fn suspension_state(&self) -> SuspensionState {
        self.suspension.load(Ordering::SeqCst)
    }

    pub(crate) fn set_suspension_state(&self, state: SuspensionState) {
        self.suspension.store(state, Ordering::SeqCst);
    }

    pub fn is_marking(&self) -> bool {
        self.suspension_state() == SuspensionState::Marking
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension_state() == SuspensionState::Suspended
    }

    pub fn is_suspended_or_native(&self) -> bool {
        self.state() == ThreadState::Native || self.is_suspended()
    }

    pub fn roots(&self) -> &RootTable {
        &self.roots
    }

    pub(crate) fn allocator(&self) -> MutexGuard<'_, ThreadQueue> {
        self.allocator.lock()
    }

    /// Publishes the local allocation queue. Returns the published heap size afterwards.
    pub(crate) fn publish(&self, objects: &ObjectFactory) -> u64 {
        self.allocator.lock().publish(objects)
    }
}

/// Handle of a thread attached to a heap. Dropping it detaches the thread.
pub struct Mutator {
    heap: HeapRef,
    thread: Arc<ThreadData>,
    _not_send: PhantomData<*mut ()>,
}

impl Mutator {
    pub(crate) fn attach(heap: HeapRef) -> Self {
        let safepoint = &heap.inner().safepoint;
        if safepoint.is_current_thread_registered() {
            gc_fatal!(
                "thread {:?} is already attached to this heap",
                thread::current().id()
            );
        }
        let thread = safepoint.register_current_thread();
        let mutator = Self {
            heap,
            thread,
            _not_send: PhantomData,
        };
        mutator.switch_state(ThreadState::Runnable);
        log::trace!("attached mutator {}", mutator.thread.id());
        mutator
    }

    pub fn heap(&self) -> &HeapRef {
        &self.heap
    }

    pub fn thread(&self) -> &ThreadData {
        &self.thread
    }

    #[inline(always)]
    fn assert_runnable(&self) {
        debug_assert_eq!(
            self.thread.state(),
            ThreadState::Runnable,
            "mutator {} touched the heap from native state",
            self.thread.id()
        );
    }

    /// Allocates an object with `type_info.ref_fields` null slots. The result is unrooted.
    pub fn allocate(&self, type_info: &'static TypeInfo) -> GcRef {
        self.assert_runnable();
        self.thread.allocator().allocate_object(type_info)
    }

    /// Allocates an array of `len` null references. The result is unrooted.
    pub fn allocate_array(&self, type_info: &'static TypeInfo, len: usize) -> GcRef {
        self.assert_runnable();
        self.thread.allocator().allocate_array(type_info, len)
    }

    /// Roots `object` on this thread's shadow stack until the returned slot is dropped.
    pub fn root(&self, object: impl Into<Option<GcRef>>) -> Root<'_> {
        Root::new(&self.thread.roots, object.into())
    }

    pub fn global_root(&self, object: impl Into<Option<GcRef>>) -> GlobalRoot {
        self.heap.add_global_root(object)
    }

    pub fn create_weak(&self, object: GcRef) -> WeakRef {
        self.assert_runnable();
        self.heap.inner().extra_objects.weak_reference_for(object)
    }

    /// Cooperative suspension point. Unrooted references must not be held across it.
    #[inline]
    pub fn safepoint(&self) {
        self.assert_runnable();
        if self.thread.allocator().pending_bytes() >= PUBLISH_THRESHOLD {
            self.publish();
        }
        if self.heap.inner().safepoint.is_suspension_requested() {
            self.safepoint_slow();
        }
    }

    #[cold]
    #[inline(never)]
    fn safepoint_slow(&self) {
        let heap = self.heap.inner();
        heap.safepoint.suspend_if_requested(&self.thread, || {
            heap.gc.on_suspend_for_gc(heap, &self.thread)
        });
    }

    /// Hands local allocations over to the object store.
    pub fn publish(&self) {
        let heap = self.heap.inner();
        let heap_bytes = self.thread.publish(&heap.objects);
        heap.scheduler.on_allocation(heap_bytes);
    }

    fn switch_state(&self, state: ThreadState) -> ThreadState {
        let previous = self.thread.set_state(state);
        if previous != state {
            let safepoint = &self.heap.inner().safepoint;
            match state {
                ThreadState::Native => safepoint.notify_state_changed(),
                ThreadState::Runnable => {
                    if safepoint.is_suspension_requested() {
                        self.safepoint_slow();
                    }
                }
            }
        }
        previous
    }

    /// Leaves managed code until the returned scope is dropped. The collector runs without
    /// waiting for this thread meanwhile.
    pub fn enter_native(&self) -> NativeScope<'_> {
        NativeScope {
            mutator: self,
            previous: self.switch_state(ThreadState::Native),
        }
    }

    pub fn schedule(&self) -> Epoch {
        self.heap.schedule()
    }

    /// Schedules a cycle and waits for it to finish.
    pub fn collect(&self) -> Epoch {
        let epoch = self.schedule();
        self.wait_finished(epoch);
        epoch
    }

    pub fn wait_finished(&self, epoch: Epoch) {
        let _native = self.enter_native();
        self.heap.wait_finished(epoch);
    }

    pub fn wait_finalizers(&self, epoch: Epoch) {
        let _native = self.enter_native();
        self.heap.wait_finalizers(epoch);
    }

    /// Starts a thread attached to the same heap.
    pub fn spawn_mutator<F, R>(&self, closure: F) -> JoinHandle<R>
    where
        F: FnOnce(&Mutator) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.heap.spawn_mutator(closure)
    }

    /// Joins `handle` from native state so a cycle can proceed while waiting.
    pub fn join<R>(&self, handle: JoinHandle<R>) -> thread::Result<R> {
        let _native = self.enter_native();
        handle.join()
    }

    /// Frees every unpublished allocation of this thread.
    pub fn clear_for_tests(&self) {
        self.thread.allocator().clear_for_tests();
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        if self.thread.is_marking() {
            gc_fatal!("mutator {} detached while marking", self.thread.id());
        }
        self.switch_state(ThreadState::Native);
        let heap = self.heap.inner();
        self.thread.publish(&heap.objects);
        heap.safepoint.unregister(&self.thread);
        log::trace!("detached mutator {}", self.thread.id());
    }
}

/// Restores the previous thread state when dropped.
pub struct NativeScope<'a> {
    mutator: &'a Mutator,
    previous: ThreadState,
}

impl Drop for NativeScope<'_> {
    fn drop(&mut self) {
        self.mutator.switch_state(self.previous);
    }
}
