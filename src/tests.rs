use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    error::ConfigError, Config, GCPhase, GCSchedulerConfig, GcRef, Heap, MarkingBehavior,
    Mutator, SchedulerType, TypeInfo,
};

static NODE: TypeInfo = TypeInfo::new("Node").with_ref_fields(2);
static LEAF: TypeInfo = TypeInfo::new("Leaf").with_instance_size(16);
static BLOB: TypeInfo = TypeInfo::new("Blob").with_instance_size(1024);

static FINALIZED: AtomicUsize = AtomicUsize::new(0);
static FINALIZABLE: TypeInfo = TypeInfo::new("Finalizable").with_finalizer(count_finalized);

static LAZILY_FINALIZED: AtomicUsize = AtomicUsize::new(0);
static LAZY_FINALIZABLE: TypeInfo =
    TypeInfo::new("LazyFinalizable").with_finalizer(count_lazily_finalized);

fn count_finalized(_: GcRef) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

fn count_lazily_finalized(_: GcRef) {
    LAZILY_FINALIZED.fetch_add(1, Ordering::SeqCst);
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn manual_config() -> Config {
    Config {
        scheduler_type: SchedulerType::Manual,
        ..Default::default()
    }
}

fn new_heap(config: Config) -> Heap {
    init_logging();
    Heap::new(config).unwrap()
}

fn chain(mutator: &Mutator, head: GcRef, len: usize) {
    let mut tail = head;
    for _ in 0..len {
        let next = mutator.allocate(&NODE);
        tail.set(0, Some(next));
        tail = next;
    }
}

fn chain_len(head: Option<GcRef>) -> usize {
    let mut len = 0;
    let mut current = head;
    while let Some(object) = current {
        assert_eq!(object.type_info().name, "Node");
        len += 1;
        current = object.get(0);
    }
    len
}

#[test]
fn unreachable_objects_are_reclaimed() {
    let heap = new_heap(manual_config());
    let mutator = heap.attach_current_thread();
    let root = mutator.root(mutator.allocate(&NODE));
    chain(&mutator, root.get().unwrap(), 10);
    for _ in 0..100 {
        mutator.allocate(&LEAF);
    }

    mutator.collect();
    assert_eq!(heap.object_count(), 11);
    assert_eq!(chain_len(root.get()), 11);
    let cycle = heap.statistics().last_cycle.unwrap();
    assert_eq!(cycle.marked_objects, 11);
    assert_eq!(cycle.kept_objects, 11);
    assert_eq!(cycle.swept_objects, 100);
    assert_eq!(cycle.root_set_size, 1);
}

#[test]
fn unrooted_referrer_does_not_keep_referent_alive() {
    let heap = new_heap(manual_config());
    let mutator = heap.attach_current_thread();
    let a = mutator.root(mutator.allocate(&NODE));
    let b = mutator.allocate(&NODE);
    let c = mutator.allocate(&LEAF);
    b.set(0, Some(c));

    mutator.collect();
    let cycle = heap.statistics().last_cycle.unwrap();
    assert_eq!((cycle.kept_objects, cycle.swept_objects), (1, 2));
    assert_eq!(heap.object_count(), 1);
    assert!(a.get().is_some());
}

#[test]
fn marks_are_reset_after_sweep() {
    let heap = new_heap(manual_config());
    let mutator = heap.attach_current_thread();
    let root = mutator.root(mutator.allocate(&NODE));
    chain(&mutator, root.get().unwrap(), 3);

    mutator.collect();
    let mut current = root.get();
    while let Some(object) = current {
        assert!(!heap.is_marked(object));
        current = object.get(0);
    }
    // Survivors are marked again in the next cycle.
    mutator.collect();
    assert_eq!(heap.statistics().last_cycle.unwrap().marked_objects, 4);
    assert_eq!(heap.object_count(), 4);
}

#[test]
fn global_roots_keep_objects_alive() {
    let heap = new_heap(manual_config());
    let mutator = heap.attach_current_thread();
    let global = mutator.global_root(mutator.allocate(&NODE));
    chain(&mutator, global.get().unwrap(), 2);
    mutator.allocate(&LEAF);

    mutator.collect();
    assert_eq!(heap.object_count(), 3);
    global.set(None);
    mutator.collect();
    assert_eq!(heap.object_count(), 0);
}

#[test]
fn epochs_increase_and_cycles_finish() {
    let heap = new_heap(manual_config());
    let mutator = heap.attach_current_thread();

    let first = mutator.collect();
    let second = mutator.collect();
    assert!(second > first);
    assert_eq!(heap.last_finished_epoch(), second);
    assert_eq!(heap.statistics().total_gc_cycles_count, 2);

    // The cycle cannot get past suspension while this thread is runnable.
    let epoch = mutator.schedule();
    let handle = heap.gc_handle(epoch).unwrap();
    assert_eq!(handle.epoch(), epoch);
    mutator.wait_finished(epoch);
    assert!(handle.phase() >= GCPhase::Finished);
    assert!(handle.pause().is_some());
    assert_eq!(handle.statistics().epoch, epoch);
}

#[test]
fn finalizers_run_after_cycle() {
    let heap = new_heap(manual_config());
    let mutator = heap.attach_current_thread();
    for _ in 0..5 {
        mutator.allocate(&FINALIZABLE);
    }
    let survivor = mutator.root(mutator.allocate(&FINALIZABLE));

    let epoch = mutator.collect();
    assert_eq!(heap.statistics().last_cycle.unwrap().finalizers_scheduled, 5);
    mutator.wait_finalizers(epoch);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 5);
    assert_eq!(heap.object_count(), 1);
    assert!(survivor.get().is_some());
    assert!(heap.gc_handle(epoch).is_none());
}

#[test]
fn finalizer_thread_starts_on_demand() {
    let heap = new_heap(Config {
        start_finalizer_thread: false,
        ..manual_config()
    });
    let mutator = heap.attach_current_thread();
    assert!(!heap.finalizers_thread_is_running());

    // Nothing to finalize: the epoch completes without a thread.
    let epoch = mutator.collect();
    mutator.wait_finalizers(epoch);
    assert!(!heap.finalizers_thread_is_running());

    mutator.allocate(&LAZY_FINALIZABLE);
    let epoch = mutator.collect();
    mutator.wait_finalizers(epoch);
    assert_eq!(LAZILY_FINALIZED.load(Ordering::SeqCst), 1);
    assert!(heap.finalizers_thread_is_running());

    heap.stop_finalizer_thread_if_running();
    assert!(!heap.finalizers_thread_is_running());
    heap.start_finalizer_thread_if_needed();
    assert!(heap.finalizers_thread_is_running());
}

#[test]
fn autotune_follows_live_heap() {
    let heap = new_heap(Config {
        scheduler: GCSchedulerConfig {
            min_heap_bytes: 1024,
            ..Default::default()
        },
        ..manual_config()
    });
    let mutator = heap.attach_current_thread();
    let roots = (0..64)
        .map(|_| mutator.root(mutator.allocate(&BLOB)))
        .collect::<Vec<_>>();

    mutator.collect();
    let live = heap.total_heap_objects_size_bytes();
    assert_eq!(live, 64 * roots[0].get().unwrap().allocation_size() as u64);
    let expected = (live * 2).max(1024);
    assert_eq!(heap.scheduler_config().target_heap_bytes, expected);
    assert_eq!(heap.statistics().target_heap_bytes, expected);
    assert_eq!(heap.statistics().live_bytes, live);

    assert_eq!(
        heap.set_scheduler_config(GCSchedulerConfig::default()),
        Err(ConfigError::AutoTuneEnabled)
    );
}

#[test]
fn fixed_target_without_autotune() {
    let config = GCSchedulerConfig {
        auto_tune: false,
        target_heap_bytes: 12345,
        ..Default::default()
    };
    let heap = new_heap(Config {
        scheduler: config,
        ..manual_config()
    });
    let mutator = heap.attach_current_thread();
    let _root = mutator.root(mutator.allocate(&BLOB));
    mutator.collect();
    assert_eq!(heap.scheduler_config().target_heap_bytes, 12345);

    let changed = GCSchedulerConfig {
        target_heap_bytes: 4096,
        ..config
    };
    assert_eq!(heap.set_scheduler_config(changed), Ok(()));
    assert_eq!(heap.scheduler_config(), changed);
    let invalid = GCSchedulerConfig {
        target_heap_utilization: 0.0,
        ..config
    };
    assert_eq!(
        heap.set_scheduler_config(invalid),
        Err(ConfigError::InvalidUtilization(0.0))
    );
}

#[test]
fn invalid_config_is_rejected() {
    init_logging();
    let config = Config {
        scheduler: GCSchedulerConfig {
            min_heap_bytes: 2,
            max_heap_bytes: 1,
            ..Default::default()
        },
        ..manual_config()
    };
    assert!(matches!(
        Heap::new(config),
        Err(ConfigError::HeapBoundsInverted { min: 2, max: 1 })
    ));
}

fn run_concurrent_mutators(behavior: MarkingBehavior) {
    let heap = new_heap(Config {
        marking_behavior: behavior,
        ..manual_config()
    });
    assert_eq!(heap.marking_behavior(), behavior);
    let main = heap.attach_current_thread();
    let done = Arc::new(AtomicBool::new(false));

    let workers = (0..4)
        .map(|_| {
            let done = done.clone();
            main.spawn_mutator(move |mutator| {
                let root = mutator.root(None);
                let mut length = 0;
                while !done.load(Ordering::SeqCst) {
                    if length == 1000 {
                        root.set(None);
                        length = 0;
                    }
                    let head = mutator.allocate(&NODE);
                    head.set(0, root.get());
                    root.set(Some(head));
                    length += 1;
                    mutator.allocate(&LEAF);
                    mutator.safepoint();
                }
                assert_eq!(chain_len(root.get()), length);
            })
        })
        .collect::<Vec<_>>();

    for _ in 0..5 {
        main.collect();
    }
    done.store(true, Ordering::SeqCst);
    for worker in workers {
        main.join(worker).unwrap();
    }
    assert_eq!(heap.statistics().total_gc_cycles_count, 5);
}

#[test]
fn concurrent_mutators_mark_own_stack() {
    run_concurrent_mutators(MarkingBehavior::MarkOwnStack);
}

#[test]
fn concurrent_mutators_do_not_mark() {
    run_concurrent_mutators(MarkingBehavior::DoNotMark);
}

#[test]
fn marking_behavior_can_change_between_cycles() {
    let heap = new_heap(manual_config());
    let mutator = heap.attach_current_thread();
    let root = mutator.root(mutator.allocate(&NODE));
    heap.set_marking_behavior_for_tests(MarkingBehavior::DoNotMark);
    mutator.collect();
    heap.set_marking_behavior_for_tests(MarkingBehavior::MarkOwnStack);
    mutator.collect();
    assert!(root.get().is_some());
    assert_eq!(heap.object_count(), 1);
}

#[test]
fn weak_references_are_cleared() {
    let heap = new_heap(manual_config());
    let mutator = heap.attach_current_thread();
    let live = mutator.root(mutator.allocate(&LEAF));
    let live_weak = mutator.create_weak(live.get().unwrap());
    let dead_weak = mutator.create_weak(mutator.allocate(&LEAF));
    assert_eq!(heap.extra_object_count(), 2);

    let epoch = mutator.collect();
    assert_eq!(live_weak.get(), live.get());
    assert_eq!(dead_weak.get(), None);
    assert_eq!(
        heap.statistics().last_cycle.unwrap().weak_references_cleared,
        1
    );

    mutator.wait_finalizers(epoch);
    assert_eq!(heap.extra_object_count(), 1);
    assert_eq!(heap.object_count(), 1);
}

#[test]
fn roots_of_native_threads_are_collected() {
    let heap = new_heap(manual_config());
    let main = heap.attach_current_thread();
    let (ready_tx, ready_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();

    let worker = main.spawn_mutator(move |mutator| {
        let root = mutator.root(mutator.allocate(&NODE));
        root.get().unwrap().set(0, Some(mutator.allocate(&LEAF)));
        {
            let _native = mutator.enter_native();
            ready_tx.send(()).unwrap();
            go_rx.recv().unwrap();
        }
        let object = root.get().unwrap();
        object.get(0).map(|leaf| leaf.type_info().name)
    });

    {
        let _native = main.enter_native();
        ready_rx.recv().unwrap();
    }
    main.collect();
    let cycle = heap.statistics().last_cycle.unwrap();
    assert_eq!(cycle.kept_objects, 2);
    assert_eq!(cycle.swept_objects, 0);

    go_tx.send(()).unwrap();
    assert_eq!(main.join(worker).unwrap(), Some("Leaf"));
}

#[test]
fn allocations_during_sweep_survive_the_cycle() {
    let heap = new_heap(manual_config());
    let main = heap.attach_current_thread();
    let (allocated_tx, allocated_rx) = mpsc::channel::<()>();
    let mut sweep_senders = Vec::new();
    let mut release_senders = Vec::new();
    let mut workers = Vec::new();

    for _ in 0..2 {
        let (sweep_tx, sweep_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        sweep_senders.push(sweep_tx);
        release_senders.push(release_tx);
        let allocated_tx = allocated_tx.clone();
        workers.push(main.spawn_mutator(move |mutator| {
            {
                let _native = mutator.enter_native();
                sweep_rx.recv().unwrap();
            }
            // Mutators are resumed but the store is still being swept.
            let root = mutator.root(mutator.allocate(&LEAF));
            allocated_tx.send(()).unwrap();
            {
                let _native = mutator.enter_native();
                release_rx.recv().unwrap();
            }
            root.get().map(|object| object.type_info().name)
        }));
    }

    let fired = AtomicBool::new(false);
    let sweep_senders = Mutex::new(sweep_senders);
    let allocated_rx = Mutex::new(allocated_rx);
    heap.set_sweep_hook(move || {
        if fired.swap(true, Ordering::SeqCst) {
            return;
        }
        for sender in sweep_senders.lock().iter() {
            sender.send(()).unwrap();
        }
        let allocated_rx = allocated_rx.lock();
        allocated_rx.recv().unwrap();
        allocated_rx.recv().unwrap();
    });

    main.collect();
    assert_eq!(heap.statistics().last_cycle.unwrap().swept_objects, 0);

    // The next cycle sees the new objects and keeps them while they are rooted.
    main.collect();
    let cycle = heap.statistics().last_cycle.unwrap();
    assert_eq!((cycle.kept_objects, cycle.swept_objects), (2, 0));

    for sender in release_senders {
        sender.send(()).unwrap();
    }
    for worker in workers {
        assert_eq!(main.join(worker).unwrap(), Some("Leaf"));
    }
    main.collect();
    assert_eq!(heap.statistics().last_cycle.unwrap().swept_objects, 2);
    assert_eq!(heap.object_count(), 0);
}

#[test]
fn autotune_ignores_objects_published_during_sweep() {
    let heap = new_heap(Config {
        scheduler: GCSchedulerConfig {
            min_heap_bytes: 0,
            ..Default::default()
        },
        ..manual_config()
    });
    let main = heap.attach_current_thread();
    let kept = main.root(main.allocate(&BLOB));
    let blob_size = kept.get().unwrap().allocation_size() as u64;

    let (sweep_tx, sweep_rx) = mpsc::channel::<()>();
    let (allocated_tx, allocated_rx) = mpsc::channel::<()>();
    let (published_tx, published_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let worker = main.spawn_mutator(move |mutator| {
        {
            let _native = mutator.enter_native();
            sweep_rx.recv().unwrap();
        }
        let root = mutator.root(mutator.allocate(&BLOB));
        allocated_tx.send(()).unwrap();
        // Waits for the sweep to release the store.
        mutator.publish();
        published_tx.send(()).unwrap();
        {
            let _native = mutator.enter_native();
            release_rx.recv().unwrap();
        }
        root.get().is_some()
    });

    let fired = AtomicBool::new(false);
    let sweep_tx = Mutex::new(sweep_tx);
    let allocated_rx = Mutex::new(allocated_rx);
    heap.set_sweep_hook(move || {
        if fired.swap(true, Ordering::SeqCst) {
            return;
        }
        sweep_tx.lock().send(()).unwrap();
        allocated_rx.lock().recv().unwrap();
    });

    main.collect();
    {
        let _native = main.enter_native();
        published_rx.recv().unwrap();
    }
    assert_eq!(heap.total_heap_objects_size_bytes(), 2 * blob_size);
    let statistics = heap.statistics();
    assert_eq!(statistics.last_cycle.unwrap().kept_bytes, blob_size);
    assert_eq!(statistics.live_bytes, blob_size);
    assert_eq!(statistics.target_heap_bytes, 2 * blob_size);
    assert_eq!(heap.scheduler_config().target_heap_bytes, 2 * blob_size);

    release_tx.send(()).unwrap();
    assert!(main.join(worker).unwrap());
}

#[test]
fn allocation_triggers_collection() {
    let heap = new_heap(Config {
        scheduler_type: SchedulerType::WithTimer,
        scheduler: GCSchedulerConfig {
            auto_tune: false,
            regular_gc_interval: Duration::from_secs(3600),
            target_heap_bytes: 16 * 1024,
            min_heap_bytes: 0,
            ..Default::default()
        },
        ..manual_config()
    });
    let mutator = heap.attach_current_thread();
    for _ in 0..32 {
        mutator.allocate(&BLOB);
    }
    mutator.publish();
    mutator.wait_finished(1);
    assert!(heap.statistics().total_gc_cycles_count >= 1);
    assert!(heap.object_count() < 32);
}

#[test]
fn timer_triggers_collection() {
    let heap = new_heap(Config {
        scheduler_type: SchedulerType::WithTimer,
        scheduler: GCSchedulerConfig {
            regular_gc_interval: Duration::from_millis(20),
            ..Default::default()
        },
        ..manual_config()
    });
    let mutator = heap.attach_current_thread();
    mutator.allocate(&LEAF);
    // Epoch 1 is not scheduled yet: waiting blocks until the timer opens it.
    mutator.wait_finished(1);
    assert!(heap.last_finished_epoch() >= 1);
}

#[test]
fn clear_for_tests_drops_everything() {
    let heap = new_heap(manual_config());
    let mutator = heap.attach_current_thread();
    let object = mutator.allocate(&LEAF);
    mutator.create_weak(object);
    mutator.publish();
    assert_eq!(heap.object_count(), 1);

    heap.clear_for_tests();
    assert_eq!(heap.object_count(), 0);
    assert_eq!(heap.extra_object_count(), 0);
    assert_eq!(heap.total_heap_objects_size_bytes(), 0);
    assert!(!heap.finalizers_thread_is_running());

    mutator.allocate(&LEAF);
    mutator.clear_for_tests();
}
