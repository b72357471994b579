use std::{fmt, time::Duration};

use crate::{gc_state::Epoch, util::formatted_size};

/// Snapshot of what a single collection cycle did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleStatistics {
    pub epoch: Epoch,
    pub root_set_size: u64,
    pub marked_objects: u64,
    pub marked_bytes: u64,
    pub swept_objects: u64,
    pub swept_bytes: u64,
    pub kept_objects: u64,
    pub kept_bytes: u64,
    pub weak_references_cleared: u64,
    pub finalizers_scheduled: u64,
    /// From suspension request to resumption of the mutators.
    pub pause: Option<Duration>,
    /// From suspension request to the cycle being finished.
    pub duration: Option<Duration>,
}

/// Totals over the lifetime of a heap.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeapStatistics {
    pub total_gc_cycles_count: u64,
    pub total_swept_objects: u64,
    pub total_swept_bytes: u64,
    pub total_finalizers_scheduled: u64,
    pub total_pause: Duration,
    pub live_bytes: u64,
    pub target_heap_bytes: u64,
    pub last_cycle: Option<CycleStatistics>,
}

impl HeapStatistics {
    pub(crate) fn record_cycle(&mut self, cycle: CycleStatistics, live_bytes: u64, target: u64) {
        self.total_gc_cycles_count += 1;
        self.total_swept_objects += cycle.swept_objects;
        self.total_swept_bytes += cycle.swept_bytes;
        self.total_finalizers_scheduled += cycle.finalizers_scheduled;
        self.total_pause += cycle.pause.unwrap_or_default();
        self.live_bytes = live_bytes;
        self.target_heap_bytes = target;
        self.last_cycle = Some(cycle);
    }
}

impl fmt::Display for CycleStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "roots {}, marked {} objects ({}), swept {} objects ({}), kept {} objects ({}), {} finalizers",
            self.root_set_size,
            self.marked_objects,
            formatted_size(self.marked_bytes),
            self.swept_objects,
            formatted_size(self.swept_bytes),
            self.kept_objects,
            formatted_size(self.kept_bytes),
            self.finalizers_scheduled
        )?;
        if let Some(pause) = self.pause {
            write!(f, ", pause {:.3}ms", pause.as_secs_f64() * 1000.0)?;
        }
        Ok(())
    }
}

impl fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(f, "  GC cycles: {}", self.total_gc_cycles_count)?;
        writeln!(
            f,
            "  Swept: {} objects ({})",
            self.total_swept_objects,
            formatted_size(self.total_swept_bytes)
        )?;
        writeln!(
            f,
            "  Finalizers scheduled: {}",
            self.total_finalizers_scheduled
        )?;
        writeln!(
            f,
            "  Total pause: {:.3}ms",
            self.total_pause.as_secs_f64() * 1000.0
        )?;
        writeln!(
            f,
            "  Live heap: {} (target {})",
            formatted_size(self.live_bytes),
            formatted_size(self.target_heap_bytes)
        )?;
        if let Some(cycle) = &self.last_cycle {
            writeln!(f, "  Last cycle (epoch {}): {}", cycle.epoch, cycle)?;
        }
        Ok(())
    }
}
