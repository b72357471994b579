//! Decides when cycles run.
//!
//! Two triggers open epochs on their own: the published heap growing past the target size, and
//! a timer that makes sure a cycle happens at least every other regular interval. After every
//! cycle the target is re-derived from the live heap when auto-tuning is on.
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    error::ConfigError,
    gc_state::{Epoch, GCStateHolder},
    util::formatted_size,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GCSchedulerConfig {
    pub auto_tune: bool,
    pub regular_gc_interval: Duration,
    pub target_heap_bytes: u64,
    /// Fraction of the heap expected to be live after a cycle, in (0, 1].
    pub target_heap_utilization: f64,
    pub min_heap_bytes: u64,
    pub max_heap_bytes: u64,
}

impl Default for GCSchedulerConfig {
    fn default() -> Self {
        Self {
            auto_tune: true,
            regular_gc_interval: Duration::from_secs(10),
            target_heap_bytes: 1024 * 1024,
            target_heap_utilization: 0.5,
            min_heap_bytes: 1024 * 1024,
            max_heap_bytes: u64::MAX,
        }
    }
}

impl GCSchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let utilization = self.target_heap_utilization;
        if !(utilization > 0.0 && utilization <= 1.0) {
            return Err(ConfigError::InvalidUtilization(utilization));
        }
        if self.min_heap_bytes > self.max_heap_bytes {
            return Err(ConfigError::HeapBoundsInverted {
                min: self.min_heap_bytes,
                max: self.max_heap_bytes,
            });
        }
        if self.regular_gc_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }

    /// Target heap size for a live heap of `live_bytes`, clamped to the configured bounds.
    /// The maximum wins over the minimum on configs that fail validation.
    pub fn autotuned_target_heap_bytes(&self, live_bytes: u64) -> u64 {
        let target = (live_bytes as f64 / self.target_heap_utilization) as u64;
        target.max(self.min_heap_bytes).min(self.max_heap_bytes)
    }

    /// Takes over the fields auto-tuning is allowed to change. A no-op unless auto-tuning
    /// is on.
    pub fn merge_autotuned_config(&mut self, tuned: &GCSchedulerConfig) {
        if !self.auto_tune {
            return;
        }
        self.target_heap_bytes = tuned.target_heap_bytes;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerType {
    /// Cycles run only when explicitly scheduled.
    Manual,
    /// Allocation-driven and regular-interval triggers are active.
    WithTimer,
}

pub struct GCScheduler {
    scheduler_type: SchedulerType,
    config: Mutex<GCSchedulerConfig>,
    last_gc: Mutex<Instant>,
    state: Arc<GCStateHolder>,
}

impl GCScheduler {
    pub(crate) fn new(
        scheduler_type: SchedulerType,
        config: GCSchedulerConfig,
        state: Arc<GCStateHolder>,
    ) -> Self {
        Self {
            scheduler_type,
            config: Mutex::new(config),
            last_gc: Mutex::new(Instant::now()),
            state,
        }
    }

    pub fn scheduler_type(&self) -> SchedulerType {
        self.scheduler_type
    }

    pub fn config(&self) -> GCSchedulerConfig {
        *self.config.lock()
    }

    /// Replaces the configuration. Rejected while auto-tuning owns it.
    pub fn set_config(&self, config: GCSchedulerConfig) -> Result<(), ConfigError> {
        let mut current = self.config.lock();
        if current.auto_tune {
            return Err(ConfigError::AutoTuneEnabled);
        }
        config.validate()?;
        *current = config;
        Ok(())
    }

    pub fn regular_gc_interval(&self) -> Duration {
        self.config.lock().regular_gc_interval
    }

    pub fn schedule(&self) -> Epoch {
        self.state.schedule()
    }

    fn schedule_if_idle(&self, reason: &str) -> Option<Epoch> {
        if self.scheduler_type == SchedulerType::Manual {
            return None;
        }
        let epoch = self.state.schedule_if_idle()?;
        log::debug!("[gc][epoch {}] triggered by {}", epoch, reason);
        Some(epoch)
    }

    /// Called after a thread published allocations, with the resulting published heap size.
    /// Fires once the heap exceeds the target.
    pub(crate) fn on_allocation(&self, heap_bytes: u64) -> Option<Epoch> {
        if heap_bytes <= self.config.lock().target_heap_bytes {
            return None;
        }
        self.schedule_if_idle("allocation")
    }

    pub(crate) fn on_timer(&self) -> Option<Epoch> {
        let interval = self.regular_gc_interval();
        if self.last_gc.lock().elapsed() < interval {
            return None;
        }
        self.schedule_if_idle("timer")
    }

    /// Records the end of a cycle and retunes the target. Returns the target now in effect.
    pub(crate) fn on_gc_finished(&self, epoch: Epoch, live_bytes: u64) -> u64 {
        *self.last_gc.lock() = Instant::now();
        let mut config = self.config.lock();
        let tuned = GCSchedulerConfig {
            target_heap_bytes: config.autotuned_target_heap_bytes(live_bytes),
            ..*config
        };
        config.merge_autotuned_config(&tuned);
        if config.auto_tune {
            log::debug!(
                "[gc][epoch {}] live heap {}, new target {}",
                epoch,
                formatted_size(live_bytes),
                formatted_size(config.target_heap_bytes)
            );
        }
        config.target_heap_bytes
    }
}

/// Calls back on a fixed period until stopped. The period is re-read before every wait.
pub struct RepeatedTimer {
    shared: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl RepeatedTimer {
    pub fn new(
        name: &str,
        interval: impl Fn() -> Duration + Send + 'static,
        mut callback: impl FnMut() + Send + 'static,
    ) -> Self {
        let shared = Arc::new((Mutex::new(false), Condvar::new()));
        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    let (lock, cv) = &*shared;
                    let mut stopped = lock.lock();
                    loop {
                        let deadline = Instant::now() + interval();
                        while !*stopped {
                            if cv.wait_until(&mut stopped, deadline).timed_out() {
                                break;
                            }
                        }
                        if *stopped {
                            break;
                        }
                        MutexGuard::unlocked(&mut stopped, &mut callback);
                    }
                })
                .unwrap_or_else(|error| gc_fatal!("failed to start {} thread: {}", name, error))
        };
        Self {
            shared,
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let (lock, cv) = &*self.shared;
        *lock.lock() = true;
        cv.notify_all();
        if thread.join().is_err() {
            gc_fatal!("timer thread panicked");
        }
    }
}

impl Drop for RepeatedTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
