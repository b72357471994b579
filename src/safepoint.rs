use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use parking_lot::{Condvar, Mutex};

use crate::mutator::{SuspensionState, ThreadData};

/// Used to bring all threads with heap access to a safepoint such that e.g. a
/// garbage collection can be performed.
///
/// Owns the registry of attached threads. A single driver arms the barrier, mutators notice it
/// at their next safepoint poll or when they leave native code, and park until it is disarmed.
pub struct GlobalSafepoint {
    threads: Mutex<Vec<Arc<ThreadData>>>,
    next_thread_id: AtomicUsize,
    suspension_requested: AtomicBool,
    barrier: Barrier,
}

struct Barrier {
    mutex: Mutex<()>,
    cv_resume: Condvar,
    cv_stopped: Condvar,
}

impl Default for GlobalSafepoint {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            next_thread_id: AtomicUsize::new(1),
            suspension_requested: AtomicBool::new(false),
            barrier: Barrier {
                mutex: Mutex::new(()),
                cv_resume: Condvar::new(),
                cv_stopped: Condvar::new(),
            },
        }
    }

    /// Registers the calling thread. It starts out in native state.
    pub(crate) fn register_current_thread(&self) -> Arc<ThreadData> {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(ThreadData::new(id, thread::current().id()));
        self.threads.lock().push(thread.clone());
        thread
    }

    pub(crate) fn unregister(&self, thread: &ThreadData) {
        self.threads.lock().retain(|t| t.id() != thread.id());
        self.notify_state_changed();
    }

    /// Snapshot of the attached threads.
    pub fn threads(&self) -> Vec<Arc<ThreadData>> {
        self.threads.lock().clone()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn current_thread(&self) -> Option<Arc<ThreadData>> {
        let current = thread::current().id();
        self.threads
            .lock()
            .iter()
            .find(|t| t.os_thread() == current)
            .cloned()
    }

    pub fn is_current_thread_registered(&self) -> bool {
        self.current_thread().is_some()
    }

    /// Checks `predicate` for every attached thread except the calling one.
    pub(crate) fn all_threads(&self, predicate: impl Fn(&ThreadData) -> bool) -> bool {
        let current = thread::current().id();
        self.threads
            .lock()
            .iter()
            .filter(|t| t.os_thread() != current)
            .all(|t| predicate(t))
    }

    #[inline(always)]
    pub fn is_suspension_requested(&self) -> bool {
        self.suspension_requested.load(Ordering::SeqCst)
    }

    /// Arms the barrier. Returns `false` if another driver already did.
    pub(crate) fn request_threads_suspension(&self) -> bool {
        let _guard = self.barrier.mutex.lock();
        self.suspension_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Blocks until every other attached thread is parked or in native code.
    pub(crate) fn wait_for_threads_suspension(&self) {
        let mut guard = self.barrier.mutex.lock();
        while !self.all_threads(|t| t.is_suspended_or_native()) {
            self.barrier.cv_stopped.wait(&mut guard);
        }
    }

    pub(crate) fn resume_threads(&self) {
        let _guard = self.barrier.mutex.lock();
        self.suspension_requested.store(false, Ordering::SeqCst);
        self.barrier.cv_resume.notify_all();
    }

    /// Wakes a driver waiting for suspension after a thread moved to native or detached.
    pub(crate) fn notify_state_changed(&self) {
        let _guard = self.barrier.mutex.lock();
        self.barrier.cv_stopped.notify_all();
    }

    /// Parks `thread` until the barrier is disarmed. `on_suspend` runs first, before the
    /// thread counts as suspended.
    pub(crate) fn suspend_if_requested(&self, thread: &ThreadData, on_suspend: impl FnOnce()) {
        if !self.is_suspension_requested() {
            return;
        }
        thread.set_suspension_state(SuspensionState::SuspensionPending);
        on_suspend();

        let mut guard = self.barrier.mutex.lock();
        thread.set_suspension_state(SuspensionState::Suspended);
        self.barrier.cv_stopped.notify_all();
        while self.suspension_requested.load(Ordering::SeqCst) {
            self.barrier.cv_resume.wait(&mut guard);
        }
        thread.set_suspension_state(SuspensionState::Running);
    }
}
