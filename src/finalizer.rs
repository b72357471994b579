use std::{
    collections::VecDeque,
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex};

use crate::{gc_state::Epoch, sweeper::FinalizerQueue};

type EpochDoneCallback = Box<dyn Fn(Epoch) + Send + Sync>;

struct Tasks {
    queue: VecDeque<(FinalizerQueue, Epoch)>,
    shutdown: bool,
    running: bool,
}

struct Shared {
    tasks: Mutex<Tasks>,
    cv: Condvar,
    epoch_done: EpochDoneCallback,
}

/// Runs finalizers on a dedicated thread, one epoch at a time and in scheduling order.
pub struct FinalizerProcessor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FinalizerProcessor {
    /// `epoch_done` is called once every finalizer of an epoch ran.
    pub fn new(epoch_done: impl Fn(Epoch) + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                tasks: Mutex::new(Tasks {
                    queue: VecDeque::new(),
                    shutdown: false,
                    running: false,
                }),
                cv: Condvar::new(),
                epoch_done: Box::new(epoch_done),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn schedule_tasks(&self, tasks: FinalizerQueue, epoch: Epoch) {
        let mut state = self.shared.tasks.lock();
        if tasks.is_empty() && !state.running {
            // Nothing in flight can be older than this epoch.
            drop(state);
            (self.shared.epoch_done)(epoch);
            return;
        }
        state.queue.push_back((tasks, epoch));
        self.shared.cv.notify_all();
        drop(state);
        self.start_if_needed();
    }

    /// Starts the finalizer thread if it is not running, and waits for it to initialize.
    pub fn start_if_needed(&self) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }
        self.shared.tasks.lock().shutdown = false;
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("cmsgc-finalizer".to_string())
            .spawn(move || Self::run(&shared))
            .unwrap_or_else(|error| gc_fatal!("failed to start finalizer thread: {}", error));
        let mut state = self.shared.tasks.lock();
        while !state.running {
            self.shared.cv.wait(&mut state);
        }
        *thread = Some(handle);
        log::debug!("finalizer thread started");
    }

    /// Lets queued finalizers complete, then stops the thread. Does nothing if it is not
    /// running.
    pub fn stop_if_running(&self) {
        let mut thread = self.thread.lock();
        let Some(handle) = thread.take() else {
            return;
        };
        self.shared.tasks.lock().shutdown = true;
        self.shared.cv.notify_all();
        if handle.join().is_err() {
            gc_fatal!("finalizer thread panicked");
        }
        log::debug!("finalizer thread stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.tasks.lock().running
    }

    fn run(shared: &Shared) {
        let mut state = shared.tasks.lock();
        state.running = true;
        shared.cv.notify_all();
        loop {
            if let Some((tasks, epoch)) = state.queue.pop_front() {
                drop(state);
                let count = tasks.finalize_all();
                log::trace!("[gc][epoch {}] ran {} finalizers", epoch, count);
                (shared.epoch_done)(epoch);
                state = shared.tasks.lock();
                continue;
            }
            if state.shutdown {
                break;
            }
            shared.cv.wait(&mut state);
        }
        state.running = false;
        shared.cv.notify_all();
    }
}

impl Drop for FinalizerProcessor {
    fn drop(&mut self) {
        self.stop_if_running();
    }
}
