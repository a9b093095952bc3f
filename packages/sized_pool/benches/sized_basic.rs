//! Basic benchmarks for the `sized_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::hint::black_box;
use std::iter;
use std::num::NonZero;
use std::time::Instant;

use criterion::{Criterion, criterion_group, criterion_main};
use sized_pool::{FixedCountStrategy, PoolManager};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const REQUEST_SIZE: usize = 48;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("sized_basic");

    group.bench_function("build_empty", |b| {
        b.iter(|| drop(black_box(PoolManager::new())));
    });

    group.bench_function("first_allocation", |b| {
        b.iter_custom(|iters| {
            let managers = iter::repeat_with(PoolManager::new)
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let start = Instant::now();

            for manager in &managers {
                _ = black_box(manager.allocate_bytes(black_box(REQUEST_SIZE)));
            }

            start.elapsed()
        });
    });

    let manager = PoolManager::new();

    // Warm up the pool so that its creation is not measured.
    let warm = manager.allocate_bytes(REQUEST_SIZE).unwrap();
    // SAFETY: The pointer came from this manager and is released once.
    unsafe {
        manager.deallocate(warm);
    }

    group.bench_function("pool_allocate_deallocate", |b| {
        b.iter(|| {
            let ptr = manager.allocate_bytes(black_box(REQUEST_SIZE)).unwrap();

            // SAFETY: The pointer came from this manager and is released once.
            unsafe { black_box(manager.deallocate(ptr)) }
        });
    });

    let oversize = manager.max_supported_size() * 2;

    group.bench_function("fallback_allocate_deallocate", |b| {
        b.iter(|| {
            let ptr = manager.allocate_bytes(black_box(oversize)).unwrap();

            // SAFETY: The pointer came from this manager and is released once.
            unsafe { black_box(manager.deallocate(ptr)) }
        });
    });

    let exhausted = PoolManager::builder()
        .strategy(FixedCountStrategy::new(NonZero::new(1).unwrap()))
        .build();
    let held = exhausted.allocate_bytes(REQUEST_SIZE).unwrap();

    group.bench_function("exhausted_allocate_deallocate", |b| {
        b.iter(|| {
            let ptr = exhausted.allocate_bytes(black_box(REQUEST_SIZE)).unwrap();

            // SAFETY: The pointer came from this manager and is released once.
            unsafe { black_box(exhausted.deallocate(ptr)) }
        });
    });

    // SAFETY: The pointer came from this manager and is released once.
    unsafe {
        exhausted.deallocate(held);
    }

    group.bench_function("system_alloc_dealloc", |b| {
        let layout = Layout::from_size_align(REQUEST_SIZE, 1).unwrap();

        b.iter(|| {
            // SAFETY: The layout has a nonzero size.
            let ptr = unsafe { System.alloc(black_box(layout)) };

            // SAFETY: The pointer came from the same allocator with the same layout.
            unsafe {
                System.dealloc(black_box(ptr), layout);
            }
        });
    });

    group.finish();
}
