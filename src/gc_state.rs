//! Epoch bookkeeping.
//!
//! Every call to [`GCStateHolder::schedule`] opens a new epoch and the GC thread runs exactly
//! one cycle per epoch, in order. Each epoch owns a [`GCHandle`] that records the phase the
//! cycle is in, when it got there, and what it did. Waiting for an epoch is waiting on its
//! handle. Handles are dropped from the holder once the epoch's finalizers are done.
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::statistics::CycleStatistics;

pub type Epoch = u64;

/// Lifecycle of a collection cycle. Phases only ever move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GCPhase {
    /// Epoch opened, cycle not started yet.
    Scheduled,
    SuspensionRequested,
    ThreadsSuspended,
    RootSetCollecting,
    Marking,
    MarkingDone,
    ThreadsResumed,
    Sweeping,
    FinalizersScheduled,
    Finished,
    FinalizersDone,
}

#[derive(Default)]
struct CycleCounters {
    root_set_size: AtomicU64,
    marked_objects: AtomicU64,
    marked_bytes: AtomicU64,
    swept_objects: AtomicU64,
    swept_bytes: AtomicU64,
    kept_objects: AtomicU64,
    kept_bytes: AtomicU64,
    weak_references_cleared: AtomicU64,
    finalizers_scheduled: AtomicU64,
}

struct PhaseLog {
    phase: GCPhase,
    scheduled_at: Instant,
    suspension_requested_at: Option<Instant>,
    threads_resumed_at: Option<Instant>,
    finished_at: Option<Instant>,
}

struct GCRecord {
    epoch: Epoch,
    log: Mutex<PhaseLog>,
    cv: Condvar,
    counters: CycleCounters,
}

/// Observability record of one epoch.
#[derive(Clone)]
pub struct GCHandle {
    record: Arc<GCRecord>,
}

impl GCHandle {
    pub(crate) fn new(epoch: Epoch) -> Self {
        Self {
            record: Arc::new(GCRecord {
                epoch,
                log: Mutex::new(PhaseLog {
                    phase: GCPhase::Scheduled,
                    scheduled_at: Instant::now(),
                    suspension_requested_at: None,
                    threads_resumed_at: None,
                    finished_at: None,
                }),
                cv: Condvar::new(),
                counters: CycleCounters::default(),
            }),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.record.epoch
    }

    pub fn phase(&self) -> GCPhase {
        self.record.log.lock().phase
    }

    fn transition(&self, phase: GCPhase) {
        let mut log = self.record.log.lock();
        assert!(
            phase > log.phase,
            "[gc][epoch {}] phase cannot move from {:?} to {:?}",
            self.record.epoch,
            log.phase,
            phase
        );
        log.phase = phase;
        let now = Instant::now();
        match phase {
            GCPhase::SuspensionRequested => log.suspension_requested_at = Some(now),
            GCPhase::ThreadsResumed => log.threads_resumed_at = Some(now),
            GCPhase::Finished => log.finished_at = Some(now),
            _ => (),
        }
        self.record.cv.notify_all();
    }

    pub(crate) fn suspension_requested(&self) {
        self.transition(GCPhase::SuspensionRequested);
        log::debug!("[gc][epoch {}] requested thread suspension", self.epoch());
    }

    pub(crate) fn threads_are_suspended(&self) {
        self.transition(GCPhase::ThreadsSuspended);
        let log = self.record.log.lock();
        if let Some(requested) = log.suspension_requested_at {
            log::debug!(
                "[gc][epoch {}] threads ready for marking after {:?}",
                self.epoch(),
                requested.elapsed()
            );
        }
    }

    pub(crate) fn started(&self) {
        self.transition(GCPhase::RootSetCollecting);
    }

    pub(crate) fn marking(&self) {
        self.transition(GCPhase::Marking);
        log::debug!(
            "[gc][epoch {}] collected {} roots",
            self.epoch(),
            self.record.counters.root_set_size.load(Ordering::Relaxed)
        );
    }

    pub(crate) fn marking_done(&self) {
        self.transition(GCPhase::MarkingDone);
        log::debug!(
            "[gc][epoch {}] marked {} objects",
            self.epoch(),
            self.record.counters.marked_objects.load(Ordering::Relaxed)
        );
    }

    pub(crate) fn threads_are_resumed(&self) {
        self.transition(GCPhase::ThreadsResumed);
        if let Some(pause) = self.pause() {
            log::debug!("[gc][epoch {}] resumed threads, pause {:?}", self.epoch(), pause);
        }
    }

    pub(crate) fn sweeping(&self) {
        self.transition(GCPhase::Sweeping);
    }

    pub(crate) fn finalizers_scheduled(&self, count: usize) {
        self.record
            .counters
            .finalizers_scheduled
            .store(count as u64, Ordering::Relaxed);
        self.transition(GCPhase::FinalizersScheduled);
        log::debug!("[gc][epoch {}] scheduled {} finalizers", self.epoch(), count);
    }

    pub(crate) fn finished(&self) {
        self.transition(GCPhase::Finished);
    }

    pub(crate) fn finalizers_done(&self) {
        self.transition(GCPhase::FinalizersDone);
        log::debug!("[gc][epoch {}] finalizers done", self.epoch());
    }

    pub(crate) fn roots_collected(&self, count: u64) {
        self.record
            .counters
            .root_set_size
            .fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn marked(&self, objects: u64, bytes: u64) {
        let counters = &self.record.counters;
        counters.marked_objects.fetch_add(objects, Ordering::Relaxed);
        counters.marked_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn swept(&self, swept: (u64, u64), kept: (u64, u64)) {
        let counters = &self.record.counters;
        counters.swept_objects.fetch_add(swept.0, Ordering::Relaxed);
        counters.swept_bytes.fetch_add(swept.1, Ordering::Relaxed);
        counters.kept_objects.fetch_add(kept.0, Ordering::Relaxed);
        counters.kept_bytes.fetch_add(kept.1, Ordering::Relaxed);
    }

    pub(crate) fn weak_references_cleared(&self, count: u64) {
        self.record
            .counters
            .weak_references_cleared
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Time the mutators spent stopped, once they have been resumed.
    pub fn pause(&self) -> Option<Duration> {
        let log = self.record.log.lock();
        Some(log.threads_resumed_at? - log.suspension_requested_at?)
    }

    /// Time since the epoch was opened.
    pub fn age(&self) -> Duration {
        self.record.log.lock().scheduled_at.elapsed()
    }

    /// Blocks until the cycle reached `phase`.
    pub fn wait_for(&self, phase: GCPhase) {
        let mut log = self.record.log.lock();
        while log.phase < phase {
            self.record.cv.wait(&mut log);
        }
    }

    pub fn statistics(&self) -> CycleStatistics {
        let counters = &self.record.counters;
        let log = self.record.log.lock();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CycleStatistics {
            epoch: self.record.epoch,
            root_set_size: load(&counters.root_set_size),
            marked_objects: load(&counters.marked_objects),
            marked_bytes: load(&counters.marked_bytes),
            swept_objects: load(&counters.swept_objects),
            swept_bytes: load(&counters.swept_bytes),
            kept_objects: load(&counters.kept_objects),
            kept_bytes: load(&counters.kept_bytes),
            weak_references_cleared: load(&counters.weak_references_cleared),
            finalizers_scheduled: load(&counters.finalizers_scheduled),
            pause: log
                .threads_resumed_at
                .zip(log.suspension_requested_at)
                .map(|(resumed, requested)| resumed - requested),
            duration: log
                .finished_at
                .zip(log.suspension_requested_at)
                .map(|(finished, requested)| finished - requested),
        }
    }
}

struct StateInner {
    scheduled: Epoch,
    started: Epoch,
    finished: Epoch,
    finalized: Epoch,
    handles: BTreeMap<Epoch, GCHandle>,
    shutdown: bool,
}

/// Scheduling state shared by the GC thread, the scheduler and waiting threads.
pub struct GCStateHolder {
    inner: Mutex<StateInner>,
    cv: Condvar,
}

impl Default for GCStateHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl GCStateHolder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                scheduled: 0,
                started: 0,
                finished: 0,
                finalized: 0,
                handles: BTreeMap::new(),
                shutdown: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Opens a new epoch. Epochs are strictly increasing and each one gets its own cycle.
    pub fn schedule(&self) -> Epoch {
        let mut inner = self.inner.lock();
        self.open_epoch(&mut inner)
    }

    /// Opens a new epoch unless a scheduled one has not finished yet.
    pub fn schedule_if_idle(&self) -> Option<Epoch> {
        let mut inner = self.inner.lock();
        if inner.scheduled > inner.finished {
            return None;
        }
        Some(self.open_epoch(&mut inner))
    }

    fn open_epoch(&self, inner: &mut StateInner) -> Epoch {
        inner.scheduled += 1;
        let epoch = inner.scheduled;
        if inner.shutdown {
            // Never run. Waiters return as soon as they see no handle.
            log::warn!("[gc][epoch {}] scheduled after shutdown", epoch);
            return epoch;
        }
        inner.handles.insert(epoch, GCHandle::new(epoch));
        self.cv.notify_all();
        log::debug!("[gc][epoch {}] scheduled", epoch);
        epoch
    }

    /// Blocks the GC thread until an epoch is waiting to be run. Returns `None` once shut down
    /// with nothing left to run.
    pub(crate) fn next_scheduled(&self) -> Option<GCHandle> {
        let mut inner = self.inner.lock();
        loop {
            if inner.started < inner.scheduled {
                inner.started += 1;
                let epoch = inner.started;
                match inner.handles.get(&epoch) {
                    Some(handle) => return Some(handle.clone()),
                    None if inner.shutdown => return None,
                    None => gc_fatal!("[gc][epoch {}] scheduled epoch has no handle", epoch),
                }
            }
            if inner.shutdown {
                return None;
            }
            self.cv.wait(&mut inner);
        }
    }

    pub(crate) fn cycle_finished(&self, handle: &GCHandle) {
        let mut inner = self.inner.lock();
        handle.finished();
        inner.finished = inner.finished.max(handle.epoch());
        self.cv.notify_all();
    }

    /// Called by the finalizer processor once every finalizer of `epoch` ran.
    pub(crate) fn finalizers_done(&self, epoch: Epoch) {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.handles.remove(&epoch) {
            handle.finalizers_done();
        }
        inner.finalized = inner.finalized.max(epoch);
        self.cv.notify_all();
    }

    pub(crate) fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.cv.notify_all();
    }

    /// Handle of an epoch whose finalizers are not done yet.
    pub fn handle(&self, epoch: Epoch) -> Option<GCHandle> {
        self.inner.lock().handles.get(&epoch).cloned()
    }

    fn wait_epoch(&self, epoch: Epoch, phase: GCPhase) {
        let handle = {
            let mut inner = self.inner.lock();
            loop {
                let watermark = match phase {
                    GCPhase::FinalizersDone => inner.finalized,
                    _ => inner.finished,
                };
                if epoch <= watermark {
                    return;
                }
                if let Some(handle) = inner.handles.get(&epoch) {
                    break handle.clone();
                }
                if inner.shutdown {
                    return;
                }
                self.cv.wait(&mut inner);
            }
        };
        handle.wait_for(phase);
    }

    /// Blocks until the cycle of `epoch` is finished. Waiting on an epoch that is not scheduled
    /// yet waits for it to be scheduled first.
    pub fn wait_epoch_finished(&self, epoch: Epoch) {
        self.wait_epoch(epoch, GCPhase::Finished);
    }

    /// Blocks until the finalizers of `epoch` ran.
    pub fn wait_epoch_finalized(&self, epoch: Epoch) {
        self.wait_epoch(epoch, GCPhase::FinalizersDone);
    }

    /// `true` while some scheduled epoch has not finished its cycle.
    pub fn is_cycle_pending(&self) -> bool {
        let inner = self.inner.lock();
        inner.scheduled > inner.finished
    }

    pub fn last_scheduled_epoch(&self) -> Epoch {
        self.inner.lock().scheduled
    }

    pub fn last_finished_epoch(&self) -> Epoch {
        self.inner.lock().finished
    }
}
