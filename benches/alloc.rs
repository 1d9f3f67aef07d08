//! Allocation fast and slow path benchmarks

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use regionheap::{
    config::KB,
    memory::{
        mark::RootList,
        object::{ClassRef, EncodedSizeModel},
    },
    Heap, HeapConfig, SharedHeap,
};

fn bench_config() -> HeapConfig {
    HeapConfig::compact(256 * KB).with_sweeper_threads(0)
}

fn heap() -> Heap {
    let mut heap = Heap::new(bench_config(), Arc::new(EncodedSizeModel)).unwrap();
    heap.set_tracer(Arc::new(RootList::new()));
    heap
}

/// Allocate `count` young objects of one class, collecting whenever
/// the young generation fills
fn alloc_young(heap: &mut Heap, class: ClassRef, count: usize) {
    for _ in 0..count {
        black_box(heap.allocate_young(class).unwrap());
    }
}

fn alloc_old(heap: &mut Heap, class: ClassRef, count: usize) {
    for _ in 0..count {
        black_box(heap.allocate_old(class).unwrap());
    }
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_young");
    for size in [16, 64, 256] {
        let class = EncodedSizeModel::class(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &class, |b, class| {
            let mut heap = heap();
            b.iter(|| alloc_young(&mut heap, *class, 1000))
        });
    }
    group.finish();

    let mut group = c.benchmark_group("alloc_old");
    for size in [16, 64, 256] {
        let class = EncodedSizeModel::class(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &class, |b, class| {
            let mut heap = heap();
            b.iter(|| alloc_old(&mut heap, *class, 1000))
        });
    }
    group.finish();

    c.bench_function("alloc_huge", |b| {
        let mut heap = heap();
        let size = bench_config().max_regular_object_size() + 8;
        b.iter(|| black_box(heap.allocate_huge_raw(size).unwrap()))
    });

    c.bench_function("alloc_shared_old_tlab", |b| {
        let shared = SharedHeap::new(bench_config(), Arc::new(EncodedSizeModel)).unwrap();
        let heap = shared.attach(bench_config()).unwrap();
        let class = EncodedSizeModel::class(32);
        b.iter(|| {
            for _ in 0..1000 {
                black_box(heap.allocate_shared_old(class).unwrap());
            }
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
