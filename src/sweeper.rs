use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use crate::{
    extra_object::{ExtraObjectData, ExtraObjectDataFactory},
    gc_state::GCHandle,
    gcref::GcRef,
    object_store::Iterable,
};

/// Hooks used by the sweeper. Supplied as a type parameter to the collector.
pub trait SweepTraits {
    fn is_marked_by_extra_object(extra: &ExtraObjectData) -> bool;

    /// Clears the mark of a surviving object. Returns `false` for unmarked objects.
    fn try_reset_mark(object: GcRef) -> bool;
}

pub struct DefaultSweepTraits;

impl SweepTraits for DefaultSweepTraits {
    fn is_marked_by_extra_object(extra: &ExtraObjectData) -> bool {
        // A sidecar without a base belongs to an object that is already being released.
        match extra.base_object() {
            Some(base) => base.header().data().marked(),
            None => true,
        }
    }

    #[inline(always)]
    fn try_reset_mark(object: GcRef) -> bool {
        object.header().data().try_reset_mark()
    }
}

/// Unreachable objects waiting for their finalizers, owned by the queue until then.
pub struct FinalizerQueue {
    objects: Vec<GcRef>,
    extra_objects: Arc<ExtraObjectDataFactory>,
}

impl FinalizerQueue {
    pub fn new(extra_objects: Arc<ExtraObjectDataFactory>) -> Self {
        Self {
            objects: Vec::new(),
            extra_objects,
        }
    }

    pub(crate) fn push(&mut self, object: GcRef) {
        self.objects.push(object);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = GcRef> + '_ {
        self.objects.iter().copied()
    }

    /// Runs every finalizer in queue order and releases the objects.
    pub(crate) fn finalize_all(mut self) -> usize {
        let objects = std::mem::take(&mut self.objects);
        let count = objects.len();
        for object in objects {
            if let Some(finalizer) = object.type_info().finalizer {
                if catch_unwind(AssertUnwindSafe(|| finalizer(object))).is_err() {
                    gc_fatal!(
                        "finalizer of {} object {:p} panicked",
                        object.type_info().name,
                        object
                    );
                }
            }
            self.release(object);
        }
        count
    }

    fn release(&self, object: GcRef) {
        self.extra_objects
            .destroy_extra_object_data(object.header().extra_object());
        unsafe { object.free() };
    }
}

impl Drop for FinalizerQueue {
    fn drop(&mut self) {
        for object in std::mem::take(&mut self.objects) {
            self.release(object);
        }
    }
}

/// Clears weak references whose referent was not marked. Runs while mutators are stopped.
pub fn sweep_extra_objects<S: SweepTraits>(
    handle: &GCHandle,
    extra_objects: &ExtraObjectDataFactory,
) {
    let iterable = extra_objects.lock_for_iter();
    let mut cleared = 0;
    for extra in iterable.iter() {
        if S::is_marked_by_extra_object(extra) {
            continue;
        }
        if extra.clear_weak_reference() {
            cleared += 1;
        }
    }
    handle.weak_references_cleared(cleared);
}

/// Resets the marks of survivors and unlinks everything else. Objects without finalization
/// needs are released on the spot, the rest are returned for the finalizer thread.
pub fn sweep<S: SweepTraits>(
    handle: &GCHandle,
    objects: &mut Iterable<'_>,
    extra_objects: Arc<ExtraObjectDataFactory>,
) -> FinalizerQueue {
    let mut finalizer_queue = FinalizerQueue::new(extra_objects);
    let mut kept = (0u64, 0u64);
    let mut swept = (0u64, 0u64);
    objects.retain(|object| {
        let size = object.allocation_size() as u64;
        if S::try_reset_mark(object) {
            kept.0 += 1;
            kept.1 += size;
            return true;
        }
        swept.0 += 1;
        swept.1 += size;
        if object.needs_finalization() {
            finalizer_queue.push(object);
        } else {
            unsafe { object.free() };
        }
        false
    });
    handle.swept(swept, kept);
    finalizer_queue
}
