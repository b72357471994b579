//! Concurrent mark & sweep garbage collector.
//!
//! Mutator threads attach to a [`Heap`], allocate into thread-local queues and poll
//! safepoints. Collection cycles run on a dedicated GC thread: mutators are brought to a
//! safepoint, optionally trace their own roots in parallel with the collector, and are resumed
//! before the object store is swept. Objects whose type has a finalizer, or that carry a
//! sidecar, are finalized on a separate thread after the cycle finished.
//!
//! ```no_run
//! use cmsgc::{Config, Heap, TypeInfo};
//!
//! static NODE: TypeInfo = TypeInfo::new("Node").with_ref_fields(2);
//!
//! let heap = Heap::new(Config::default()).unwrap();
//! let mutator = heap.attach_current_thread();
//! let root = mutator.root(mutator.allocate(&NODE));
//! mutator.safepoint();
//! mutator.collect();
//! assert!(root.get().is_some());
//! ```

/// Aborts the process with a message and a backtrace. For broken runtime contracts only.
macro_rules! gc_fatal {
    ($($arg:tt)*) => {
        $crate::util::fatal(format_args!($($arg)*))
    };
}

/// Logs at info level when `$verbose` is set, at debug level otherwise.
macro_rules! gc_log {
    ($verbose: expr, $($arg:tt)*) => {
        if $verbose {
            log::info!($($arg)*);
        } else {
            log::debug!($($arg)*);
        }
    };
}

pub mod cms;
pub mod error;
pub mod extra_object;
pub mod finalizer;
pub mod gc_state;
pub mod gcref;
pub mod header;
pub mod heap;
pub mod mark_queue;
pub mod marking;
pub mod mutator;
pub mod object_store;
pub mod roots;
pub mod safepoint;
pub mod scheduler;
pub mod statistics;
pub mod sweeper;
pub mod type_info;
pub mod util;

#[cfg(test)]
mod tests;

pub use cms::MarkingBehavior;
pub use error::ConfigError;
pub use extra_object::WeakRef;
pub use gc_state::{Epoch, GCHandle, GCPhase};
pub use gcref::GcRef;
pub use heap::{Heap, HeapRef};
pub use mutator::{Mutator, NativeScope, ThreadState};
pub use roots::{GlobalRoot, Root};
pub use scheduler::{GCSchedulerConfig, SchedulerType};
pub use statistics::{CycleStatistics, HeapStatistics};
pub use type_info::{FinalizerCallback, TypeInfo};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Config {
    /// Logs a summary of every cycle at info level, and the heap statistics on drop
    pub verbose: bool,
    /// Whether mutators trace their own roots during a cycle
    pub marking_behavior: MarkingBehavior,
    /// `Manual` disables the allocation and timer triggers
    pub scheduler_type: SchedulerType,
    pub scheduler: GCSchedulerConfig,
    /// Start the finalizer thread with the heap instead of on the first finalizable garbage
    pub start_finalizer_thread: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: false,
            marking_behavior: MarkingBehavior::MarkOwnStack,
            scheduler_type: SchedulerType::WithTimer,
            scheduler: GCSchedulerConfig::default(),
            start_finalizer_thread: true,
        }
    }
}
