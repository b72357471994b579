//! Root slots and root set enumeration.
//!
//! Every mutator owns a [`RootTable`] acting as its shadow stack, and the heap owns one more
//! table for global handles. Tables are locked while enumerated, so a collector reading the
//! roots of a parked thread never races with slot bookkeeping.
use std::{marker::PhantomData, sync::Arc};

use parking_lot::Mutex;

use crate::{
    gc_state::GCHandle, gcref::GcRef, mark_queue::MarkQueue, marking::MarkTraits,
    mutator::ThreadData,
};

struct RootEntry {
    live: bool,
    value: Option<GcRef>,
}

#[derive(Default)]
struct RootSlots {
    entries: Vec<RootEntry>,
    free: Vec<usize>,
}

#[derive(Default)]
pub struct RootTable {
    slots: Mutex<RootSlots>,
}

impl RootTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, value: Option<GcRef>) -> usize {
        let mut slots = self.slots.lock();
        let entry = RootEntry { live: true, value };
        match slots.free.pop() {
            Some(index) => {
                slots.entries[index] = entry;
                index
            }
            None => {
                slots.entries.push(entry);
                slots.entries.len() - 1
            }
        }
    }

    fn remove(&self, index: usize) {
        let mut slots = self.slots.lock();
        slots.entries[index] = RootEntry {
            live: false,
            value: None,
        };
        if index + 1 == slots.entries.len() {
            slots.entries.pop();
            // Trailing dead entries go away with the top of the stack.
            while slots.entries.last().map_or(false, |entry| !entry.live) {
                slots.entries.pop();
            }
            let len = slots.entries.len();
            slots.free.retain(|&free| free < len);
        } else {
            slots.free.push(index);
        }
    }

    fn get(&self, index: usize) -> Option<GcRef> {
        self.slots.lock().entries[index].value
    }

    fn set(&self, index: usize, value: Option<GcRef>) {
        self.slots.lock().entries[index].value = value;
    }

    /// Number of live slots, null or not.
    pub fn len(&self) -> usize {
        self.slots.lock().entries.iter().filter(|e| e.live).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every non-null root while holding the table lock.
    pub fn for_each(&self, mut visitor: impl FnMut(GcRef)) {
        let slots = self.slots.lock();
        for entry in slots.entries.iter().filter(|e| e.live) {
            if let Some(value) = entry.value {
                visitor(value);
            }
        }
    }
}

/// Root slot on a mutator's shadow stack. Bound to the mutator and released on drop.
pub struct Root<'a> {
    table: &'a RootTable,
    index: usize,
    _not_send: PhantomData<*const ()>,
}

impl<'a> Root<'a> {
    pub(crate) fn new(table: &'a RootTable, value: Option<GcRef>) -> Self {
        Self {
            index: table.add(value),
            table,
            _not_send: PhantomData,
        }
    }

    pub fn get(&self) -> Option<GcRef> {
        self.table.get(self.index)
    }

    pub fn set(&self, value: Option<GcRef>) {
        self.table.set(self.index, value)
    }
}

impl Drop for Root<'_> {
    fn drop(&mut self) {
        self.table.remove(self.index);
    }
}

/// Root slot registered with the heap itself. Any thread may own it.
pub struct GlobalRoot {
    table: Arc<RootTable>,
    index: usize,
}

impl GlobalRoot {
    pub(crate) fn new(table: Arc<RootTable>, value: Option<GcRef>) -> Self {
        let index = table.add(value);
        Self { table, index }
    }

    pub fn get(&self) -> Option<GcRef> {
        self.table.get(self.index)
    }

    pub fn set(&self, value: Option<GcRef>) {
        self.table.set(self.index, value)
    }
}

impl Drop for GlobalRoot {
    fn drop(&mut self) {
        self.table.remove(self.index);
    }
}

/// Seeds `queue` with the shadow stack of `thread`.
pub fn collect_root_set_for_thread<T: MarkTraits>(
    handle: &GCHandle,
    queue: &MarkQueue,
    thread: &ThreadData,
) {
    let mut count = 0;
    thread.roots().for_each(|object| {
        T::enqueue(queue, object);
        count += 1;
    });
    handle.roots_collected(count);
    log::trace!(
        "[gc][epoch {}] collected {} roots of thread {}",
        handle.epoch(),
        count,
        thread.id()
    );
}

/// Seeds `queue` with the shadow stacks of the threads selected by `predicate`, then with the
/// global roots.
pub fn collect_root_set<T: MarkTraits>(
    handle: &GCHandle,
    queue: &MarkQueue,
    threads: &[Arc<ThreadData>],
    globals: &RootTable,
    predicate: impl Fn(&ThreadData) -> bool,
) {
    for thread in threads.iter().filter(|thread| predicate(thread)) {
        collect_root_set_for_thread::<T>(handle, queue, thread);
    }
    let mut count = 0;
    globals.for_each(|object| {
        T::enqueue(queue, object);
        count += 1;
    });
    handle.roots_collected(count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{marking::DefaultMarkTraits, object_store::ThreadQueue, type_info::TypeInfo};

    static LEAF: TypeInfo = TypeInfo::new("Leaf");

    #[test]
    fn slots_are_reused_and_trimmed() {
        let mut queue = ThreadQueue::new();
        let a = queue.allocate_object(&LEAF);
        let b = queue.allocate_object(&LEAF);
        let table = RootTable::new();

        let first = Root::new(&table, Some(a));
        let second = Root::new(&table, None);
        let third = Root::new(&table, Some(b));
        assert_eq!(table.len(), 3);

        drop(second);
        assert_eq!(table.len(), 2);
        let reused = Root::new(&table, Some(b));
        assert_eq!(reused.index, 1);

        drop(third);
        drop(reused);
        assert_eq!(table.len(), 1);
        assert_eq!(first.get(), Some(a));
        first.set(None);
        let mut seen = Vec::new();
        table.for_each(|o| seen.push(o));
        assert!(seen.is_empty());
        drop(first);
        assert!(table.is_empty());
        assert!(table.slots.lock().entries.is_empty());
    }

    #[test]
    fn global_roots_are_enumerated_once() {
        let mut queue = ThreadQueue::new();
        let object = queue.allocate_object(&LEAF);
        let globals = Arc::new(RootTable::new());
        let _root = GlobalRoot::new(globals.clone(), Some(object));
        let mark_queue = MarkQueue::new();
        let handle = GCHandle::new(1);
        collect_root_set::<DefaultMarkTraits>(&handle, &mark_queue, &[], &globals, |_| true);
        assert_eq!(mark_queue.pending(), 1);
        assert_eq!(handle.statistics().root_set_size, 1);
    }
}
