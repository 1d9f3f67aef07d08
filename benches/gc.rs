//! GC collection benchmarks
//!
//! Young and old collections with varying survivor ratios, and
//! compaction of a fragmented old space.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use regionheap::{
    config::KB,
    memory::{mark::RootList, object::EncodedSizeModel},
    GcReason, Heap, HeapConfig, TriggerGCType,
};

fn heap() -> (Heap, Arc<RootList>) {
    let config = HeapConfig::compact(256 * KB).with_sweeper_threads(0);
    let mut heap = Heap::new(config, Arc::new(EncodedSizeModel)).unwrap();
    let roots = Arc::new(RootList::new());
    heap.set_tracer(roots.clone());
    (heap, roots)
}

/// Allocate `total` young objects, rooting `pct` percent of them
fn populate_young(heap: &mut Heap, roots: &RootList, total: usize, pct: usize) {
    let class = EncodedSizeModel::class_with_references(32);
    for i in 0..total {
        let obj = heap.allocate_young(class).unwrap();
        if i * 100 < total * pct {
            roots.push(obj);
        }
    }
}

fn populate_old(heap: &mut Heap, roots: &RootList, total: usize, pct: usize) {
    let class = EncodedSizeModel::class_with_references(64);
    for i in 0..total {
        let obj = heap.allocate_old(class).unwrap();
        if i * 100 < total * pct {
            roots.push(obj);
        }
    }
}

/// Benchmark: young collection with varying percentage of survivors
fn bench_young_gc(c: &mut Criterion) {
    let mut group = c.benchmark_group("young_gc_survivors");
    for pct in [0, 25, 50, 100] {
        group.bench_with_input(BenchmarkId::new("pct", pct), &pct, |b, &pct| {
            b.iter(|| {
                let (mut heap, roots) = heap();
                populate_young(&mut heap, &roots, 2048, pct);
                heap.collect_garbage(TriggerGCType::YoungGc, GcReason::External);
            });
        });
    }
    group.finish();
}

/// Benchmark: old collection (mark, collect set, sweep)
fn bench_old_gc(c: &mut Criterion) {
    let mut group = c.benchmark_group("old_gc_survivors");
    for pct in [10, 50, 90] {
        group.bench_with_input(BenchmarkId::new("pct", pct), &pct, |b, &pct| {
            b.iter(|| {
                let (mut heap, roots) = heap();
                populate_old(&mut heap, &roots, 4096, pct);
                heap.collect_garbage(TriggerGCType::OldGc, GcReason::External);
            });
        });
    }
    group.finish();
}

/// Benchmark: full compaction of a sparsely populated old space
fn bench_full_gc(c: &mut Criterion) {
    c.bench_function("full_gc_compaction", |b| {
        b.iter(|| {
            let (mut heap, roots) = heap();
            populate_old(&mut heap, &roots, 4096, 10);
            heap.collect_garbage(TriggerGCType::FullGc, GcReason::External);
        });
    });
}

criterion_group!(benches, bench_young_gc, bench_old_gc, bench_full_gc);
criterion_main!(benches);
