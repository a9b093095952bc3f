//! Tests for the process-wide memory manager.
//!
//! The global manager is shared by every test in a process, so this file contains a single
//! test that owns it for the duration of the test binary.

#![allow(
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]

use std::sync::Arc;

use sized_pool::{PoolManager, SharedAllocator, SharedVec};

#[test]
fn global_manager_can_be_shared_and_replaced() {
    let first = PoolManager::global();
    let again = PoolManager::global();
    assert!(Arc::ptr_eq(&first, &again));

    let ptr = first.allocate_bytes(24).unwrap();
    assert_eq!(PoolManager::global().active_allocations(), 1);

    // Containers on the default adapter use whatever manager is global when they are created.
    let mut before = SharedVec::new_in(SharedAllocator::default());
    before.push(1_u64);
    assert!(Arc::ptr_eq(before.allocator().manager(), &first));

    let replacement = Arc::new(PoolManager::builder().max_size_class(10).build());
    let previous = PoolManager::set_global(Arc::clone(&replacement));

    assert!(Arc::ptr_eq(&previous, &first));
    assert!(Arc::ptr_eq(&PoolManager::global(), &replacement));
    assert_eq!(PoolManager::global().max_supported_size(), 1024);
    assert_eq!(PoolManager::global().active_allocations(), 0);

    let mut after = SharedVec::new_in(SharedAllocator::default());
    after.push(2_u64);
    assert!(Arc::ptr_eq(after.allocator().manager(), &replacement));
    assert_eq!(replacement.active_allocations(), 1);

    // Memory from the previous manager is still released through it.
    drop(before);
    assert!(unsafe { previous.deallocate(ptr) });
    assert_eq!(first.active_allocations(), 0);
}
