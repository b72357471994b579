use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use crossbeam_utils::{Backoff, CachePadded};

use crate::gcref::GcRef;

/// Shared work queue of references awaiting tracing.
///
/// Any number of threads push and drain concurrently. `pending` counts references that were
/// pushed but whose processing has not completed yet. A reference is accounted for before it
/// becomes visible in the queue and released only after every child it produced was pushed,
/// so `pending == 0` means no participant can still produce work.
pub struct MarkQueue {
    queue: SegQueue<GcRef>,
    pending: CachePadded<AtomicUsize>,
}

impl Default for MarkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkQueue {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            pending: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn push(&self, object: GcRef) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.queue.push(object);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// References pushed and not yet fully processed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Pops and processes references until the queue is empty and no other participant is
    /// still processing. `process` may push new references.
    pub fn drain(&self, mut process: impl FnMut(GcRef)) {
        let backoff = Backoff::new();
        loop {
            if let Some(object) = self.queue.pop() {
                process(object);
                let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(previous > 0);
                backoff.reset();
            } else if self.pending.load(Ordering::Acquire) == 0 {
                break;
            } else {
                backoff.snooze();
            }
        }
    }
}
