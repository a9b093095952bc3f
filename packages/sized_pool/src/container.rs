//! Standard container support via the `allocator-api2` interface.
//!
//! Both adapters implement [`Allocator`], which the containers of `allocator-api2` and
//! `hashbrown` accept on stable Rust. The aliases below name the common combinations.

use std::alloc::{GlobalAlloc, Layout, System};
use std::hash::RandomState;
use std::ptr::{self, NonNull};

use allocator_api2::alloc::{AllocError, Allocator};
use allocator_api2::vec;
use hashbrown::{HashMap, HashSet};

use crate::{ManagedAllocator, PoolManager, SharedAllocator};

/// A growable array whose storage comes from a borrowed [`PoolManager`].
///
/// # Examples
///
/// ```
/// use sized_pool::{ManagedAllocator, ManagedVec, PoolManager};
///
/// let manager = PoolManager::new();
///
/// let mut values = ManagedVec::new_in(ManagedAllocator::new(&manager));
/// values.extend(0..100_u32);
///
/// assert_eq!(values.len(), 100);
/// assert_eq!(manager.active_allocations(), 1);
/// ```
pub type ManagedVec<'m, T, A = System> = vec::Vec<T, ManagedAllocator<'m, T, A>>;

/// A hash map whose table comes from a borrowed [`PoolManager`].
///
/// # Examples
///
/// ```
/// use std::hash::RandomState;
///
/// use sized_pool::{ManagedAllocator, ManagedHashMap, PoolManager};
///
/// let manager = PoolManager::new();
///
/// let allocator = ManagedAllocator::new(&manager);
/// let mut ages = ManagedHashMap::with_hasher_in(RandomState::new(), allocator);
/// ages.insert("ferris", 9);
///
/// assert_eq!(ages.get("ferris"), Some(&9));
/// ```
pub type ManagedHashMap<'m, K, V, S = RandomState, A = System> =
    HashMap<K, V, S, ManagedAllocator<'m, (K, V), A>>;

/// A hash set whose table comes from a borrowed [`PoolManager`].
pub type ManagedHashSet<'m, T, S = RandomState, A = System> =
    HashSet<T, S, ManagedAllocator<'m, T, A>>;

/// A growable array whose storage comes from a shared [`PoolManager`].
pub type SharedVec<T, A = System> = vec::Vec<T, SharedAllocator<T, A>>;

/// A hash map whose table comes from a shared [`PoolManager`].
pub type SharedHashMap<K, V, S = RandomState, A = System> =
    HashMap<K, V, S, SharedAllocator<(K, V), A>>;

/// A hash set whose table comes from a shared [`PoolManager`].
pub type SharedHashSet<T, S = RandomState, A = System> = HashSet<T, S, SharedAllocator<T, A>>;

// SAFETY: Blocks stay valid until released because the manager outlives the adapter and never
// moves or frees a block on its own. Copies of the adapter allocate from the same manager, so
// any of them can release the blocks of the others.
unsafe impl<T, A> Allocator for ManagedAllocator<'_, T, A>
where
    A: GlobalAlloc,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        allocate_block(self.manager(), layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            deallocate_block(self.manager(), ptr, layout);
        }
    }
}

// SAFETY: The adapter keeps its manager alive, and the manager never moves or frees a block on
// its own. Clones share the same manager, so any of them can release the blocks of the others.
unsafe impl<T, A> Allocator for SharedAllocator<T, A>
where
    A: GlobalAlloc,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        allocate_block(self.manager(), layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            deallocate_block(self.manager(), ptr, layout);
        }
    }
}

fn allocate_block<A>(
    manager: &PoolManager<A>,
    layout: Layout,
) -> Result<NonNull<[u8]>, AllocError>
where
    A: GlobalAlloc,
{
    if layout.size() == 0 {
        // Never handed to the manager. Any address with the right alignment will do.
        let dangling = NonNull::new(ptr::without_provenance_mut::<u8>(layout.align()))
            .ok_or(AllocError)?;

        return Ok(NonNull::slice_from_raw_parts(dangling, 0));
    }

    let ptr = manager
        .allocate_layout(layout)
        .map_err(|_manager_error| AllocError)?;

    Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
}

/// # Safety
///
/// The caller must guarantee that `ptr` was returned by `allocate_block()` on the same manager
/// with the same layout and has not been released since.
unsafe fn deallocate_block<A>(manager: &PoolManager<A>, ptr: NonNull<u8>, layout: Layout)
where
    A: GlobalAlloc,
{
    if layout.size() == 0 {
        return;
    }

    // SAFETY: Forwarding guarantees from the caller: the memory came from this manager.
    let released = unsafe { manager.deallocate(ptr) };
    debug_assert!(released, "released storage the manager did not hand out");
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::SizeClass;
    use crate::test_support::FailingAllocator;

    #[test]
    fn vec_growth_returns_outgrown_storage() {
        let manager = PoolManager::new();

        {
            let mut values = ManagedVec::new_in(ManagedAllocator::new(&manager));

            for value in 0..1000_u64 {
                values.push(value);
            }

            assert_eq!(values.iter().sum::<u64>(), 999 * 1000 / 2);

            // Every reallocation released the storage it replaced.
            assert!(manager.total_allocations() > 1);
            assert_eq!(manager.active_allocations(), 1);
        }

        assert_eq!(manager.active_allocations(), 0);
    }

    #[test]
    fn small_vec_is_served_by_pool() {
        let manager = PoolManager::new();

        let mut values = ManagedVec::with_capacity_in(8, ManagedAllocator::new(&manager));
        values.extend([1_u32, 2, 3]);

        // 8 * 4 bytes is exactly one 32-byte block.
        let pool = manager.pool_stats(SizeClass::for_size(32)).unwrap();
        assert_eq!(pool.allocated(), 1);
        assert_eq!(manager.fallback_allocations(), 0);
    }

    #[test]
    fn hash_map_and_set_allocate_from_manager() {
        let manager = PoolManager::new();

        {
            let mut names =
                ManagedHashMap::with_hasher_in(RandomState::new(), ManagedAllocator::new(&manager));
            let mut seen =
                ManagedHashSet::with_hasher_in(RandomState::new(), ManagedAllocator::new(&manager));

            for id in 0..200_u32 {
                names.insert(id, format!("item {id}"));
                seen.insert(id % 7);
            }

            assert_eq!(names.get(&42).map(String::as_str), Some("item 42"));
            assert_eq!(seen.len(), 7);

            // One table per container.
            assert_eq!(manager.active_allocations(), 2);
        }

        assert_eq!(manager.active_allocations(), 0);
    }

    #[test]
    fn shared_containers_outlive_local_manager_handle() {
        let manager = Arc::new(PoolManager::new());

        let mut values = SharedVec::new_in(SharedAllocator::new(Arc::clone(&manager)));
        let mut lookup = SharedHashMap::with_hasher_in(
            RandomState::new(),
            SharedAllocator::new(Arc::clone(&manager)),
        );

        values.extend(["a", "b", "c"]);
        lookup.insert("b", 1);

        let observer = Arc::clone(&manager);
        drop(manager);

        assert_eq!(values.get(1), Some(&"b"));
        assert_eq!(lookup.get("b"), Some(&1));
        assert_eq!(observer.active_allocations(), 2);

        drop(values);
        drop(lookup);

        assert_eq!(observer.active_allocations(), 0);
    }

    #[test]
    fn global_shared_vec_round_trips() {
        let mut values = SharedVec::new_in(SharedAllocator::global());
        values.extend(0..64_u16);

        assert_eq!(values.last(), Some(&63));
        assert!(Arc::ptr_eq(values.allocator().manager(), &PoolManager::global()));
    }

    #[test]
    fn zero_sized_layout_is_aligned_and_skips_manager() {
        let manager = PoolManager::new();
        let allocator = ManagedAllocator::<u8>::new(&manager);
        let layout = Layout::from_size_align(0, 64).unwrap();

        let block = Allocator::allocate(&allocator, layout).unwrap();

        assert_eq!(block.len(), 0);
        assert_eq!(block.cast::<u8>().as_ptr().addr() % 64, 0);
        assert_eq!(manager.total_allocations(), 0);

        unsafe {
            Allocator::deallocate(&allocator, block.cast(), layout);
        }

        assert_eq!(manager.total_deallocations(), 0);
    }

    #[test]
    fn failed_fallback_is_alloc_error() {
        let manager = PoolManager::builder()
            .max_size_class(4)
            .fallback(FailingAllocator)
            .build();
        let allocator = ManagedAllocator::<u8, _>::new(&manager);

        let oversize = Layout::from_size_align(1024, 8).unwrap();
        assert_eq!(Allocator::allocate(&allocator, oversize), Err(AllocError));

        // Small enough for a pool, so the failing fallback is never consulted.
        let pooled = Layout::from_size_align(16, 8).unwrap();
        let block = Allocator::allocate(&allocator, pooled).unwrap();
        assert_eq!(block.len(), 16);

        unsafe {
            Allocator::deallocate(&allocator, block.cast(), pooled);
        }

        assert_eq!(manager.active_allocations(), 0);
    }
}
