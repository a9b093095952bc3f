//! Integration tests for the `sized_pool` package.
//!
//! These exercise the public API the way an application would: mixed request sizes, pool
//! exhaustion, typed helpers and the container adapter.

#![allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same safety rigor as production code"
)]

use std::hash::RandomState;
use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::Arc;

use sized_pool::{
    ByteBudgetStrategy, DropPolicy, ElementAllocator, FixedCountStrategy, ManagedAllocator,
    ManagedBox, ManagedHashMap, ManagedVec, PoolManager, SharedAllocator, SharedHashSet,
    SizeClass, size_category,
};

fn fixed(count: usize) -> FixedCountStrategy {
    FixedCountStrategy::new(NonZero::new(count).unwrap())
}

#[test]
fn mixed_sizes_create_one_pool_per_class() {
    let manager = PoolManager::new();

    let a = manager.allocate_bytes(10).unwrap();
    let b = manager.allocate_bytes(10).unwrap();
    let c = manager.allocate_bytes(2000).unwrap();

    assert_eq!(manager.pool_count(), 2);
    assert!(manager.pool_stats(SizeClass::for_size(16)).is_some());
    assert!(manager.pool_stats(SizeClass::for_size(2048)).is_some());
    assert_eq!(manager.fallback_allocations(), 0);
    assert_eq!(manager.active_allocations(), 3);

    assert_eq!(
        manager.pool_stats(SizeClass::for_size(16)).unwrap().allocated(),
        2
    );

    unsafe {
        assert!(manager.deallocate(a));
        assert!(manager.deallocate(b));
        assert!(manager.deallocate(c));
    }

    assert_eq!(manager.active_allocations(), 0);
}

#[test]
fn every_size_lands_in_smallest_sufficient_class() {
    let manager = PoolManager::builder()
        .max_size_class(16)
        .strategy(fixed(2))
        .build();

    let samples = (1..=manager.max_supported_size())
        .filter(|size| size.is_power_of_two() || size % 97 == 0 || (size + 1).is_power_of_two());

    for size in samples {
        let ptr = manager.allocate_bytes(size).unwrap();

        let expected = size.next_power_of_two();
        assert_eq!(size_category(size), expected);

        let stats = manager.pool_stats(SizeClass::for_size(size)).unwrap();
        assert_eq!(stats.block_size(), expected);
        assert_eq!(stats.allocated(), 1, "size {size} did not land in the {expected}B pool");

        unsafe {
            assert!(manager.deallocate(ptr));
        }
    }

    assert_eq!(manager.fallback_allocations(), 0);
}

#[test]
fn allocate_release_cycles_leave_occupancy_unchanged() {
    const CYCLES: usize = 1000;

    let manager = PoolManager::builder().strategy(fixed(4)).build();

    let held = manager.allocate_bytes(48).unwrap();
    let class = SizeClass::for_size(48);
    let before = manager.pool_stats(class).unwrap();

    for _ in 0..CYCLES {
        let ptr = manager.allocate_bytes(48).unwrap();
        unsafe {
            assert!(manager.deallocate(ptr));
        }
    }

    let after = manager.pool_stats(class).unwrap();
    assert_eq!(after.allocated(), before.allocated());
    assert_eq!(
        after.total_allocations(),
        before.total_allocations() + CYCLES
    );
    assert_eq!(
        after.total_deallocations(),
        before.total_deallocations() + CYCLES
    );
    assert_eq!(manager.total_allocations(), CYCLES + 1);
    assert_eq!(manager.total_deallocations(), CYCLES);
    assert_eq!(manager.fallback_allocations(), 0);

    unsafe {
        manager.deallocate(held);
    }
}

#[test]
fn exhausted_pool_request_is_usable_fallback_memory() {
    const OBJECT_COUNT: usize = 32;

    let manager = PoolManager::builder().strategy(fixed(OBJECT_COUNT)).build();

    let pooled = (0..OBJECT_COUNT)
        .map(|_| manager.allocate_bytes(100).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(manager.fallback_allocations(), 0);

    let overflow = manager.allocate_bytes(100).unwrap();
    assert_eq!(manager.fallback_allocations(), 1);

    // The fallback memory is real memory of the requested size.
    unsafe {
        overflow.as_ptr().write_bytes(0xEE, 100);
        assert_eq!(overflow.as_ptr().add(99).read(), 0xEE);
    }

    // It lies outside of every pooled block.
    assert!(!pooled.contains(&overflow));

    unsafe {
        assert!(manager.deallocate(overflow));

        for ptr in pooled {
            assert!(manager.deallocate(ptr));
        }
    }

    assert_eq!(manager.active_allocations(), 0);
}

#[test]
fn oversize_and_exhausted_fallbacks_are_released_through_fallback() {
    let manager = PoolManager::builder()
        .max_size_class(12)
        .strategy(fixed(1))
        .drop_policy(DropPolicy::MustNotDropActiveAllocations)
        .build();

    let pooled = manager.allocate_bytes(4096).unwrap();
    let exhausted = manager.allocate_bytes(4096).unwrap();
    let oversize = manager.allocate_bytes(4097).unwrap();

    assert_eq!(manager.fallback_allocations(), 2);

    unsafe {
        assert!(manager.deallocate(oversize));
        assert!(manager.deallocate(exhausted));
        assert!(manager.deallocate(pooled));
    }

    let pool = manager.pool_stats(SizeClass::for_size(4096)).unwrap();
    assert_eq!(pool.total_deallocations(), 1);
    assert_eq!(manager.total_deallocations(), 3);

    // The drop policy verifies nothing leaked.
    drop(manager);
}

#[test]
fn constructing_past_capacity_falls_back_for_the_excess() {
    struct Sample {
        id: u64,
        payload: [u8; 24],
    }

    let manager = PoolManager::new();

    let samples = (0..300_u64)
        .map(|id| {
            manager
                .construct(Sample {
                    id,
                    payload: [7; 24],
                })
                .unwrap()
        })
        .collect::<Vec<_>>();

    assert_eq!(manager.pool_count(), 1);
    assert_eq!(manager.fallback_allocations(), 44);
    assert_eq!(manager.active_allocations(), 300);

    for (expected_id, sample) in (0..300_u64).zip(&samples) {
        let sample = unsafe { sample.as_ref() };
        assert_eq!(sample.id, expected_id);
        assert_eq!(sample.payload, [7; 24]);
    }

    for sample in samples {
        unsafe {
            manager.destroy(sample);
        }
    }

    assert_eq!(manager.active_allocations(), 0);
}

#[test]
fn byte_budget_strategy_sizes_pools_by_bytes() {
    let manager = PoolManager::builder()
        .strategy(ByteBudgetStrategy::new(NonZero::new(4096).unwrap()))
        .build();

    let small = manager.allocate_bytes(16).unwrap();
    let large = manager.allocate_bytes(8192).unwrap();

    assert_eq!(
        manager.pool_stats(SizeClass::for_size(16)).unwrap().capacity(),
        256
    );

    // Blocks larger than the budget still get a pool of one.
    assert_eq!(
        manager
            .pool_stats(SizeClass::for_size(8192))
            .unwrap()
            .capacity(),
        1
    );

    unsafe {
        manager.deallocate(small);
        manager.deallocate(large);
    }
}

#[test]
fn pointer_between_blocks_is_rejected() {
    let manager = PoolManager::new();

    let ptr = manager.allocate_bytes(32).unwrap();

    let between = unsafe { ptr.byte_add(8) };
    assert!(!unsafe { manager.deallocate(between) });
    assert_eq!(manager.active_allocations(), 1);
    assert_eq!(manager.total_deallocations(), 0);

    unsafe {
        assert!(manager.deallocate(ptr));
    }
}

#[test]
fn stats_report_lists_pools() {
    let manager = PoolManager::new();

    let ptr = manager.allocate_bytes(100).unwrap();
    let report = manager.stats().to_string();

    assert!(report.contains("128B"), "unexpected report: {report}");

    unsafe {
        manager.deallocate(ptr);
    }

    let empty = PoolManager::new().stats().to_string();
    assert!(empty.contains("No active pools"), "unexpected report: {empty}");
}

#[test]
fn container_adapter_backs_a_simple_stack() {
    /// A minimal growable stack storing its elements through an `ElementAllocator`.
    struct Stack<T, E: ElementAllocator<T>> {
        allocator: E,
        storage: NonNull<T>,
        capacity: usize,
        len: usize,
    }

    impl<T, E: ElementAllocator<T>> Stack<T, E> {
        fn with_capacity(allocator: E, capacity: usize) -> Self {
            let storage = allocator.allocate(capacity).unwrap();

            Self {
                allocator,
                storage,
                capacity,
                len: 0,
            }
        }

        fn push(&mut self, value: T) {
            assert!(self.len < self.capacity, "stack is full");

            unsafe {
                self.allocator.construct(self.storage.add(self.len), value);
            }
            self.len += 1;
        }

        fn get(&self, index: usize) -> &T {
            assert!(index < self.len);

            unsafe { self.storage.add(index).as_ref() }
        }
    }

    impl<T, E: ElementAllocator<T>> Drop for Stack<T, E> {
        fn drop(&mut self) {
            for index in 0..self.len {
                unsafe {
                    self.allocator.destroy(self.storage.add(index));
                }
            }

            unsafe {
                self.allocator.deallocate(self.storage, self.capacity);
            }
        }
    }

    let manager = PoolManager::new();

    {
        let mut stack = Stack::with_capacity(ManagedAllocator::<String>::new(&manager), 8);

        for index in 0..8 {
            stack.push(format!("item {index}"));
        }

        assert_eq!(stack.get(5), "item 5");

        // Eight strings share one allocation.
        assert_eq!(manager.active_allocations(), 1);
    }

    assert_eq!(manager.active_allocations(), 0);
}

#[test]
fn standard_containers_draw_from_manager_pools() {
    let manager = PoolManager::builder()
        .drop_policy(DropPolicy::MustNotDropActiveAllocations)
        .build();

    {
        let mut readings = ManagedVec::new_in(ManagedAllocator::new(&manager));
        let mut by_sensor =
            ManagedHashMap::with_hasher_in(RandomState::new(), ManagedAllocator::new(&manager));

        for reading in 0..500_u32 {
            readings.push(reading);
            *by_sensor.entry(reading % 10).or_insert(0_u32) += 1;
        }

        assert_eq!(readings.len(), 500);
        assert_eq!(by_sensor.get(&3), Some(&50));

        // Growth released outgrown storage, so each container holds one allocation.
        assert_eq!(manager.active_allocations(), 2);
        assert!(manager.pool_count() >= 2);
    }

    // The drop policy verifies that both containers returned their storage.
    assert_eq!(manager.active_allocations(), 0);
    drop(manager);
}

#[test]
fn shared_containers_keep_their_manager_alive() {
    let manager = Arc::new(PoolManager::new());

    let mut tags = SharedHashSet::with_hasher_in(
        RandomState::new(),
        SharedAllocator::new(Arc::clone(&manager)),
    );
    tags.extend(["red", "green", "blue", "red"]);

    let weak = Arc::downgrade(&manager);
    drop(manager);

    assert_eq!(tags.len(), 3);
    assert!(tags.contains("green"));
    assert_eq!(weak.upgrade().unwrap().active_allocations(), 1);

    drop(tags);
    assert!(weak.upgrade().is_none());
}

#[test]
fn managed_box_moves_value_in_and_out() {
    let manager = PoolManager::new();

    let mut boxed = ManagedBox::new_in(vec![1_u32, 2, 3], &manager).unwrap();
    boxed.push(4);

    let inner = ManagedBox::into_inner(boxed);

    assert_eq!(inner, vec![1, 2, 3, 4]);
    assert_eq!(manager.active_allocations(), 0);
}
