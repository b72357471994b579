use std::{
    ops::Deref,
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;

use crate::{
    cms::{ConcurrentMarkAndSweep, MarkingBehavior},
    error::ConfigError,
    extra_object::ExtraObjectDataFactory,
    finalizer::FinalizerProcessor,
    gc_state::{Epoch, GCHandle, GCStateHolder},
    gcref::GcRef,
    mutator::{Mutator, ThreadState},
    object_store::ObjectFactory,
    roots::{GlobalRoot, RootTable},
    safepoint::GlobalSafepoint,
    scheduler::{GCScheduler, GCSchedulerConfig, RepeatedTimer, SchedulerType},
    statistics::HeapStatistics,
    util::formatted_size,
    Config,
};

#[cfg(test)]
type SweepHook = Box<dyn Fn() + Send + Sync>;

/// State shared by the mutators, the GC thread and the finalizer thread.
pub struct HeapInner {
    pub(crate) config: Config,
    pub(crate) safepoint: GlobalSafepoint,
    pub(crate) objects: ObjectFactory,
    pub(crate) extra_objects: Arc<ExtraObjectDataFactory>,
    pub(crate) global_roots: Arc<RootTable>,
    pub(crate) gc: ConcurrentMarkAndSweep,
    pub(crate) state: Arc<GCStateHolder>,
    pub(crate) scheduler: Arc<GCScheduler>,
    pub(crate) finalizer_processor: FinalizerProcessor,
    statistics: Mutex<HeapStatistics>,
    #[cfg(test)]
    sweep_hook: Mutex<Option<SweepHook>>,
}

impl HeapInner {
    /// Runs between the sweep of the store and the cycle being marked finished.
    /// Live bytes are what the sweep kept. Objects published since the store lock was released
    /// are not part of them.
    pub(crate) fn on_cycle_swept(&self, handle: &GCHandle) {
        let cycle = handle.statistics();
        let live = cycle.kept_bytes;
        let target = self.scheduler.on_gc_finished(handle.epoch(), live);
        gc_log!(
            self.config.verbose,
            "[gc][epoch {}] {}, live {}, target {}",
            handle.epoch(),
            cycle,
            formatted_size(live),
            formatted_size(target)
        );
        self.statistics.lock().record_cycle(cycle, live, target);
    }

    #[cfg(test)]
    pub(crate) fn run_sweep_hook(&self) {
        if let Some(hook) = &*self.sweep_hook.lock() {
            hook();
        }
    }
}

/// Shared handle to a heap. Cheap to clone, used by mutators to reach the collector.
#[derive(Clone)]
pub struct HeapRef {
    inner: Arc<HeapInner>,
}

impl HeapRef {
    pub(crate) fn inner(&self) -> &HeapInner {
        &self.inner
    }

    /// Attaches the calling thread as a mutator. Aborts if it is already attached.
    pub fn attach_current_thread(&self) -> Mutator {
        Mutator::attach(self.clone())
    }

    /// Starts a thread that runs `closure` as a mutator of this heap.
    pub fn spawn_mutator<F, R>(&self, closure: F) -> JoinHandle<R>
    where
        F: FnOnce(&Mutator) -> R + Send + 'static,
        R: Send + 'static,
    {
        let heap = self.clone();
        thread::Builder::new()
            .name("cmsgc-mutator".to_string())
            .spawn(move || {
                let mutator = heap.attach_current_thread();
                closure(&mutator)
            })
            .unwrap_or_else(|error| gc_fatal!("failed to start mutator thread: {}", error))
    }

    /// Opens a new epoch and returns it. The cycle itself runs on the GC thread.
    pub fn schedule(&self) -> Epoch {
        self.inner.scheduler.schedule()
    }

    fn check_can_block(&self) {
        if let Some(thread) = self.inner.safepoint.current_thread() {
            if thread.state() == ThreadState::Runnable {
                gc_fatal!(
                    "mutator {} waits for a cycle while runnable",
                    thread.id()
                );
            }
        }
    }

    /// Blocks until the cycle of `epoch` finished. Attached threads must be in native state,
    /// which [`Mutator::wait_finished`] takes care of.
    pub fn wait_finished(&self, epoch: Epoch) {
        self.check_can_block();
        self.inner.state.wait_epoch_finished(epoch);
    }

    /// Blocks until the finalizers of `epoch` ran.
    pub fn wait_finalizers(&self, epoch: Epoch) {
        self.check_can_block();
        self.inner.state.wait_epoch_finalized(epoch);
    }

    /// Schedules a cycle and waits for it to finish.
    pub fn collect(&self) -> Epoch {
        let epoch = self.schedule();
        self.wait_finished(epoch);
        epoch
    }

    pub fn add_global_root(&self, object: impl Into<Option<GcRef>>) -> GlobalRoot {
        GlobalRoot::new(self.inner.global_roots.clone(), object.into())
    }

    /// Record of `epoch`, available until its finalizers are done.
    pub fn gc_handle(&self, epoch: Epoch) -> Option<GCHandle> {
        self.inner.state.handle(epoch)
    }

    pub fn last_finished_epoch(&self) -> Epoch {
        self.inner.state.last_finished_epoch()
    }

    pub fn statistics(&self) -> HeapStatistics {
        self.inner.statistics.lock().clone()
    }

    pub fn scheduler_config(&self) -> GCSchedulerConfig {
        self.inner.scheduler.config()
    }

    pub fn set_scheduler_config(&self, config: GCSchedulerConfig) -> Result<(), ConfigError> {
        self.inner.scheduler.set_config(config)
    }

    pub fn start_finalizer_thread_if_needed(&self) {
        self.inner.finalizer_processor.start_if_needed();
    }

    pub fn stop_finalizer_thread_if_running(&self) {
        self.inner.finalizer_processor.stop_if_running();
    }

    pub fn finalizers_thread_is_running(&self) -> bool {
        self.inner.finalizer_processor.is_running()
    }

    pub fn marking_behavior(&self) -> MarkingBehavior {
        self.inner.gc.marking_behavior()
    }

    pub fn set_marking_behavior_for_tests(&self, behavior: MarkingBehavior) {
        self.inner.gc.set_marking_behavior_for_tests(behavior);
    }

    /// Bytes of published objects.
    pub fn total_heap_objects_size_bytes(&self) -> u64 {
        self.inner.objects.total_objects_size_bytes()
    }

    /// Bytes `object` accounts for in the heap size.
    pub fn allocated_heap_size(&self, object: GcRef) -> usize {
        object.allocation_size()
    }

    pub fn object_count(&self) -> usize {
        self.inner.objects.len()
    }

    pub fn extra_object_count(&self) -> usize {
        self.inner.extra_objects.len()
    }

    pub fn is_marked(&self, object: GcRef) -> bool {
        object.is_marked()
    }

    /// Stops the finalizer thread and frees every published object and sidecar. No cycle may
    /// be running.
    pub fn clear_for_tests(&self) {
        self.stop_finalizer_thread_if_running();
        self.inner.extra_objects.clear_for_tests();
        self.inner.objects.clear_for_tests();
    }

    #[cfg(test)]
    pub(crate) fn set_sweep_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.sweep_hook.lock() = Some(Box::new(hook));
    }
}

/// Owner of a heap and of its GC and timer threads. Dropping it shuts the collector down;
/// every mutator must be detached by then.
pub struct Heap {
    heap: HeapRef,
    gc_thread: Option<JoinHandle<()>>,
    timer: Option<RepeatedTimer>,
}

impl Heap {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.scheduler.validate()?;
        let state = Arc::new(GCStateHolder::new());
        let scheduler = Arc::new(GCScheduler::new(
            config.scheduler_type,
            config.scheduler,
            state.clone(),
        ));
        let finalizer_processor = {
            let state = state.clone();
            FinalizerProcessor::new(move |epoch| state.finalizers_done(epoch))
        };
        let inner = Arc::new(HeapInner {
            config,
            safepoint: GlobalSafepoint::new(),
            objects: ObjectFactory::new(),
            extra_objects: Arc::new(ExtraObjectDataFactory::new()),
            global_roots: Arc::new(RootTable::new()),
            gc: ConcurrentMarkAndSweep::new(config.marking_behavior),
            state,
            scheduler: scheduler.clone(),
            finalizer_processor,
            statistics: Mutex::new(HeapStatistics::default()),
            #[cfg(test)]
            sweep_hook: Mutex::new(None),
        });

        if config.start_finalizer_thread {
            inner.finalizer_processor.start_if_needed();
        }

        let gc_thread = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("cmsgc-gc".to_string())
                .spawn(move || {
                    while let Some(handle) = inner.state.next_scheduled() {
                        inner.gc.run_gc(&inner, &handle);
                    }
                    log::debug!("GC thread stopped");
                })
                .unwrap_or_else(|error| gc_fatal!("failed to start GC thread: {}", error))
        };

        let timer = match config.scheduler_type {
            SchedulerType::Manual => None,
            SchedulerType::WithTimer => {
                let interval = scheduler.clone();
                Some(RepeatedTimer::new(
                    "cmsgc-timer",
                    move || interval.regular_gc_interval(),
                    move || {
                        scheduler.on_timer();
                    },
                ))
            }
        };

        log::debug!(
            "heap created, target heap size {}",
            formatted_size(config.scheduler.target_heap_bytes)
        );
        Ok(Self {
            heap: HeapRef { inner },
            gc_thread: Some(gc_thread),
            timer,
        })
    }

    pub fn heap_ref(&self) -> HeapRef {
        self.heap.clone()
    }
}

impl Deref for Heap {
    type Target = HeapRef;

    fn deref(&self) -> &HeapRef {
        &self.heap
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
        let inner = self.heap.inner();
        let attached = inner.safepoint.thread_count();
        if attached != 0 {
            gc_fatal!("heap dropped with {} attached mutators", attached);
        }
        inner.state.shutdown();
        if let Some(gc_thread) = self.gc_thread.take() {
            if gc_thread.join().is_err() {
                gc_fatal!("GC thread panicked");
            }
        }
        inner.finalizer_processor.stop_if_running();
        if inner.config.verbose {
            log::info!("{}", inner.statistics.lock());
        }
    }
}
