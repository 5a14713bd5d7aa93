//! Throughput benchmarks for the allocator core, replacing the teacher
//! crate's nightly-only `#![feature(test)]` harness with `criterion` now that
//! this crate targets stable std rather than `#[no_std]` embedded targets.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use labcore::alloc::Allocator;

/// Repeated alloc/free of same-size blocks: the steady-state workload where
/// first-fit should find a reusable block immediately instead of extending.
fn bench_alloc_free_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free_cycle");
    for &size in &[16usize, 64, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut allocator = Allocator::new();
            b.iter(|| {
                let ptr = allocator.alloc(black_box(size)).unwrap();
                allocator.free(Some(ptr));
            });
        });
    }
    group.finish();
}

/// Allocates a working set of live blocks before each measured iteration, so
/// `find_fit` has to walk past long-lived allocations rather than hitting an
/// empty heap, approximating steady-state fragmentation pressure.
fn bench_alloc_under_pressure(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_under_pressure");
    for &live_count in &[0usize, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::from_parameter(live_count),
            &live_count,
            |b, &live_count| {
                let mut allocator = Allocator::new();
                let _keep_alive: Vec<_> =
                    (0..live_count).map(|i| allocator.alloc(16 + (i % 64)).unwrap()).collect();
                b.iter(|| {
                    let ptr = allocator.alloc(black_box(48)).unwrap();
                    allocator.free(Some(ptr));
                });
            },
        );
    }
    group.finish();
}

/// Reallocation growth path: in-place absorption of a following free
/// neighbor versus a forced relocation, the two branches spec §4.1 singles
/// out as having different costs.
fn bench_realloc_grow(c: &mut Criterion) {
    let mut group = c.benchmark_group("realloc_grow");
    group.bench_function("in_place_neighbor", |b| {
        b.iter(|| {
            let mut allocator = Allocator::new();
            let x = allocator.alloc(100).unwrap();
            let y = allocator.alloc(100).unwrap();
            allocator.free(Some(y));
            black_box(allocator.realloc(Some(x), 180).unwrap());
        });
    });
    group.bench_function("relocation", |b| {
        b.iter(|| {
            let mut allocator = Allocator::new();
            let x = allocator.alloc(100).unwrap();
            let _y = allocator.alloc(100).unwrap();
            black_box(allocator.realloc(Some(x), 1000).unwrap());
        });
    });
    group.finish();
}

criterion_group!(benches, bench_alloc_free_cycle, bench_alloc_under_pressure, bench_realloc_grow);
criterion_main!(benches);
