//! Several execution contexts sharing one heap

use std::sync::Arc;
use std::thread;

use crossbeam::channel;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use regionheap::{
    config::KB,
    memory::{mark::RootList, object::EncodedSizeModel, space::SpaceKind},
    Address, ClassRef, GcReason, HeapConfig, SharedHeap, TriggerGCType,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> HeapConfig {
    HeapConfig::compact(64 * KB).with_sweeper_threads(0)
}

fn shared() -> SharedHeap {
    init();
    SharedHeap::new(config(), Arc::new(EncodedSizeModel)).unwrap()
}

fn class(size: usize) -> ClassRef {
    EncodedSizeModel::class_with_references(size)
}

#[test]
pub fn test_contexts_allocate_and_collect_concurrently() {
    let shared = shared();
    let workers: Vec<_> = (0..4)
        .map(|n| {
            let shared = shared.clone();
            thread::spawn(move || {
                let mut heap = shared.attach(config()).unwrap();
                let roots = Arc::new(RootList::new());
                heap.set_tracer(roots.clone());

                for i in 0..200 {
                    let _running = heap.running_scope();
                    let obj = heap.allocate_shared_old(class(32)).unwrap();
                    if i % 2 == n % 2 {
                        roots.push(obj);
                    }
                }
                heap.collect_garbage(TriggerGCType::SharedGc, GcReason::External);

                let _running = heap.running_scope();
                for i in 0..roots.len() {
                    let obj = roots.get(i);
                    assert_eq!(shared.space_of(obj), Some(SpaceKind::SharedOld));
                    assert_eq!(unsafe { ClassRef::of(obj) }, class(32));
                }
                roots.len()
            })
        })
        .collect();

    let kept: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert_eq!(kept, 400);
    assert_eq!(shared.context_count(), 0);
    assert!(shared.stats().gc.count(TriggerGCType::SharedGc) >= 1);

    // nothing roots the shared objects once every context detached
    shared.collect_garbage(TriggerGCType::SharedGc, GcReason::External);
    assert_eq!(shared.stats().space(SpaceKind::SharedOld).unwrap().live, 0);
    assert_eq!(shared.verify(), Vec::<String>::new());
}

#[test]
pub fn test_parked_context_sees_compacted_references() {
    let shared = shared();
    let (to_main, from_worker) = channel::bounded(0);
    let (to_worker, from_main) = channel::bounded::<()>(0);

    let worker = {
        let shared = shared.clone();
        thread::spawn(move || {
            let mut heap = shared.attach(config()).unwrap();
            let roots = Arc::new(RootList::new());
            heap.set_tracer(roots.clone());

            let holder = heap.allocate_old(class(16)).unwrap();
            roots.push(holder);
            let target = heap.allocate_shared_old(class(16)).unwrap();
            for _ in 0..20 {
                heap.allocate_shared_old(class(64)).unwrap();
            }
            let slot = holder.offset(8);
            unsafe { slot.store_word(target.as_usize()) };
            heap.record_slot(slot, target);

            // parked until the collection has run
            to_main.send(target).unwrap();
            from_main.recv().unwrap();

            let _running = heap.running_scope();
            let moved = Address::new(unsafe { roots.get(0).offset(8).load_word() });
            assert_ne!(moved, target);
            assert_eq!(shared.space_of(moved), Some(SpaceKind::SharedOld));
            assert_eq!(unsafe { ClassRef::of(moved) }, class(16));
        })
    };

    from_worker.recv().unwrap();
    assert_eq!(shared.context_count(), 1);
    shared.collect_garbage(TriggerGCType::SharedFullGc, GcReason::External);
    assert_eq!(shared.stats().space(SpaceKind::SharedOld).unwrap().live, 16);
    to_worker.send(()).unwrap();
    worker.join().unwrap();
}

#[test]
pub fn test_contexts_come_and_go() {
    let shared = shared();
    for round in 0..5 {
        let heaps: Vec<_> = (0..3).map(|_| shared.attach(config()).unwrap()).collect();
        assert_eq!(shared.context_count(), 3, "round {}", round);
        for heap in &heaps {
            heap.allocate_shared_old(class(32)).unwrap();
        }
        drop(heaps);
        assert_eq!(shared.context_count(), 0);
        shared.collect_garbage(TriggerGCType::SharedGc, GcReason::External);
    }
    assert_eq!(shared.stats().gc.count(TriggerGCType::SharedGc), 5);
    assert_eq!(shared.verify(), Vec::<String>::new());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn shared_allocations_are_aligned(
        sizes in prop::collection::vec(1usize..=64 * 1024, 1..8)
    ) {
        let shared = shared();
        let heap = shared.attach(config()).unwrap();
        let _running = heap.running_scope();
        for size in sizes {
            let obj = heap.allocate_shared_old_raw(size).unwrap();
            prop_assert!(obj.is_aligned_to(8));
            let space = shared.space_of(obj);
            prop_assert!(
                space == Some(SpaceKind::SharedOld) || space == Some(SpaceKind::SharedHuge),
                "unexpected space {:?}", space
            );
        }
    }
}
