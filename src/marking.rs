use crate::{gc_state::GCHandle, gcref::GcRef, mark_queue::MarkQueue};

/// Hooks used by the tracer. Supplied as a type parameter to the collector.
pub trait MarkTraits {
    #[inline(always)]
    fn enqueue(queue: &MarkQueue, object: GcRef) {
        queue.push(object);
    }

    /// Returns `true` only for the first caller to mark `object` in this cycle.
    fn try_mark(object: GcRef) -> bool;

    /// Pushes every reference held by an object that was just marked.
    fn process_in_mark(queue: &MarkQueue, object: GcRef);
}

pub struct DefaultMarkTraits;

impl MarkTraits for DefaultMarkTraits {
    #[inline(always)]
    fn try_mark(object: GcRef) -> bool {
        object.header().data().try_mark()
    }

    #[inline]
    fn process_in_mark(queue: &MarkQueue, object: GcRef) {
        for child in object.references() {
            Self::enqueue(queue, child);
        }
    }
}

/// Drains `queue`, marking everything reachable from its contents. Any number of threads may
/// run this on the same queue at once; each returns when no more work can appear.
pub fn mark<T: MarkTraits>(handle: &GCHandle, queue: &MarkQueue) {
    let mut objects = 0u64;
    let mut bytes = 0u64;
    queue.drain(|object| {
        if !T::try_mark(object) {
            return;
        }
        objects += 1;
        bytes += object.allocation_size() as u64;
        T::process_in_mark(queue, object);
    });
    handle.marked(objects, bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{object_store::ThreadQueue, type_info::TypeInfo};
    use proptest::prelude::*;
    use std::collections::VecDeque;

    static NODE: TypeInfo = TypeInfo::new("GraphNode");

    fn build(queue: &mut ThreadQueue, nodes: usize, edges: &[(usize, usize)]) -> Vec<GcRef> {
        let mut out_edges = vec![Vec::new(); nodes];
        for &(from, to) in edges {
            out_edges[from % nodes].push(to % nodes);
        }
        let objects = out_edges
            .iter()
            .map(|targets| queue.allocate_array(&NODE, targets.len()))
            .collect::<Vec<_>>();
        for (object, targets) in objects.iter().zip(&out_edges) {
            for (slot, &target) in targets.iter().enumerate() {
                object.set(slot, Some(objects[target]));
            }
        }
        objects
    }

    fn reachable(objects: &[GcRef], roots: &[usize]) -> Vec<bool> {
        let mut seen = vec![false; objects.len()];
        let mut work = roots.iter().copied().collect::<VecDeque<_>>();
        while let Some(index) = work.pop_front() {
            if std::mem::replace(&mut seen[index], true) {
                continue;
            }
            for child in objects[index].references() {
                let child = objects.iter().position(|&o| o == child).unwrap();
                work.push_back(child);
            }
        }
        seen
    }

    #[test]
    fn marks_cycle_once() {
        let mut queue = ThreadQueue::new();
        let objects = build(&mut queue, 3, &[(0, 1), (1, 2), (2, 0)]);
        let mark_queue = MarkQueue::new();
        let handle = GCHandle::new(1);
        mark_queue.push(objects[0]);
        mark_queue.push(objects[0]);
        mark::<DefaultMarkTraits>(&handle, &mark_queue);
        assert!(objects.iter().all(|o| o.is_marked()));
        assert_eq!(handle.statistics().marked_objects, 3);
        assert_eq!(mark_queue.pending(), 0);
        assert!(mark_queue.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn parallel_marking_marks_exactly_the_reachable_set(
            nodes in 1usize..120,
            edges in proptest::collection::vec((0usize..1000, 0usize..1000), 0..300),
            roots in proptest::collection::vec(0usize..1000, 0..8),
            workers in 1usize..5,
        ) {
            let mut queue = ThreadQueue::new();
            let objects = build(&mut queue, nodes, &edges);
            let roots = roots.iter().map(|r| r % nodes).collect::<Vec<_>>();
            let expected = reachable(&objects, &roots);

            let mark_queue = MarkQueue::new();
            let handle = GCHandle::new(1);
            std::thread::scope(|scope| {
                for worker in 0..workers {
                    let mark_queue = &mark_queue;
                    let handle = &handle;
                    let objects = &objects;
                    let roots = &roots;
                    scope.spawn(move || {
                        for root in roots.iter().skip(worker).step_by(workers) {
                            DefaultMarkTraits::enqueue(mark_queue, objects[*root]);
                        }
                        mark::<DefaultMarkTraits>(handle, mark_queue);
                    });
                }
            });

            for (object, expected) in objects.iter().zip(&expected) {
                prop_assert_eq!(object.is_marked(), *expected);
            }
            let marked = expected.iter().filter(|m| **m).count() as u64;
            prop_assert_eq!(handle.statistics().marked_objects, marked);
            prop_assert_eq!(mark_queue.pending(), 0);
            prop_assert!(mark_queue.is_empty());
        }
    }
}
