//! Global object store and the per-thread allocation queues that feed it.
//!
//! Mutators allocate into a private [`ThreadQueue`]. Objects become visible to the sweeper
//! only once the queue is published into the [`ObjectFactory`]. Publishing takes the store
//! lock, which the sweeper holds for its whole pass, so nothing allocated after marking can
//! be swept by the cycle that is currently running.
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    gcref::{GcRef, HeapObject},
    type_info::TypeInfo,
};

#[derive(Default)]
pub struct ObjectFactory {
    nodes: Mutex<Vec<GcRef>>,
    total_bytes: AtomicU64,
}

impl ObjectFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the store lock. Publishing blocks until the returned guard is dropped.
    pub fn lock_for_iter(&self) -> Iterable<'_> {
        Iterable {
            factory: self,
            nodes: self.nodes.lock(),
        }
    }

    /// Bytes of published objects.
    pub fn total_objects_size_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, nodes: &mut Vec<GcRef>, bytes: u64) -> u64 {
        let mut store = self.nodes.lock();
        store.append(nodes);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub(crate) fn clear_for_tests(&self) {
        let mut store = self.nodes.lock();
        for node in store.drain(..) {
            unsafe { node.free() };
        }
        self.total_bytes.store(0, Ordering::Relaxed);
    }
}

impl Drop for ObjectFactory {
    fn drop(&mut self) {
        self.clear_for_tests();
    }
}

/// Exclusive view over the published objects.
pub struct Iterable<'a> {
    factory: &'a ObjectFactory,
    nodes: MutexGuard<'a, Vec<GcRef>>,
}

impl Iterable<'_> {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = GcRef> + '_ {
        self.nodes.iter().copied()
    }

    /// Unlinks every object for which `keep` returns `false`. The callback takes ownership of
    /// unlinked objects and may release them.
    pub fn retain(&mut self, mut keep: impl FnMut(GcRef) -> bool) {
        let mut erased = 0u64;
        self.nodes.retain(|&node| {
            let size = node.allocation_size() as u64;
            if keep(node) {
                true
            } else {
                erased += size;
                false
            }
        });
        self.factory.total_bytes.fetch_sub(erased, Ordering::Relaxed);
    }
}

/// Thread-local producer for the object store.
#[derive(Default)]
pub struct ThreadQueue {
    nodes: Vec<GcRef>,
    bytes: u64,
}

impl ThreadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_object(&mut self, type_info: &'static TypeInfo) -> GcRef {
        self.push(HeapObject::new(type_info, type_info.ref_fields, false))
    }

    pub fn allocate_array(&mut self, type_info: &'static TypeInfo, len: usize) -> GcRef {
        self.push(HeapObject::new(type_info, len, true))
    }

    fn push(&mut self, object: Box<HeapObject>) -> GcRef {
        let object = GcRef::from_box(object);
        self.bytes += object.allocation_size() as u64;
        self.nodes.push(object);
        object
    }

    /// Bytes allocated since the last publish.
    pub fn pending_bytes(&self) -> u64 {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Moves every local object into `factory`. Returns the published heap size afterwards.
    pub fn publish(&mut self, factory: &ObjectFactory) -> u64 {
        let bytes = std::mem::take(&mut self.bytes);
        if self.nodes.is_empty() {
            return factory.total_objects_size_bytes();
        }
        factory.publish(&mut self.nodes, bytes)
    }

    pub fn clear_for_tests(&mut self) {
        for node in self.nodes.drain(..) {
            unsafe { node.free() };
        }
        self.bytes = 0;
    }
}

impl Drop for ThreadQueue {
    fn drop(&mut self) {
        self.clear_for_tests();
    }
}
