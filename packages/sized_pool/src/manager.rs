use std::alloc::{GlobalAlloc, Layout, System};
use std::fmt;
use std::mem::{align_of, size_of};
use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use scopeguard::ScopeGuard;
use tracing::{debug, trace, warn};

use crate::{
    BlockPool, CapacityStrategy, DropPolicy, ERR_POISONED_LOCK, Error, FallbackAllocator,
    ManagerStats, PoolManagerBuilder, PoolStats, Result, SizeClass,
};

/// A memory manager that serves recurring allocation sizes from per-size-class block pools.
///
/// Every request is rounded up to a power-of-two size class. Each size class up to a configurable
/// maximum (1 MiB by default) has its own fixed-capacity [`BlockPool`], created the first time
/// the size class is requested. Requests are served by the general-purpose fallback allocator
/// (the system allocator by default) when they are larger than the largest pooled size class or
/// when the pool for their size class has no vacant block left. Pools never grow.
///
/// Deallocation does not require the caller to remember the size: the manager finds the pool
/// whose arena contains the pointer, and releases pointers that no pool claims through the
/// fallback allocator.
///
/// # Thread safety
///
/// The manager is thread-safe ([`Send`] + [`Sync`]) if its fallback allocator is. Allocation
/// and deallocation only take the lock of the one pool involved, held just long enough to update
/// its free list. The statistics counters are independent atomics.
///
/// # Examples
///
/// ```
/// use sized_pool::PoolManager;
///
/// let manager = PoolManager::new();
///
/// let small = manager.allocate(10, 8).unwrap();
/// let large = manager.allocate(4 * 1024 * 1024, 8).unwrap();
///
/// assert_eq!(manager.pool_count(), 1);
/// assert_eq!(manager.fallback_allocations(), 1);
///
/// // SAFETY: Both pointers were allocated by this manager and are released once.
/// unsafe {
///     manager.deallocate(small);
///     manager.deallocate(large);
/// }
///
/// assert_eq!(manager.active_allocations(), 0);
/// ```
pub struct PoolManager<A = System> {
    /// One slot per size class, from 0 up to and including the maximum size class.
    ///
    /// A slot holds `None` if creating its pool failed, in which case that size class is
    /// permanently served by the fallback allocator.
    pools: Box<[OnceLock<Option<BlockPool>>]>,

    max_size_class: SizeClass,

    /// Consulted only when a pool is created, so replacing it does not affect existing pools.
    strategy: Mutex<Arc<dyn CapacityStrategy>>,

    fallback: FallbackAllocator<A>,

    drop_policy: DropPolicy,

    total_allocations: AtomicUsize,
    total_deallocations: AtomicUsize,
    fallback_allocations: AtomicUsize,
}

impl PoolManager {
    /// Creates a memory manager with the default configuration.
    ///
    /// Use [`builder()`](Self::builder) to customize the configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring a new memory manager.
    ///
    /// # Examples
    ///
    /// ```
    /// use sized_pool::{DropPolicy, PoolManager};
    ///
    /// let manager = PoolManager::builder()
    ///     .max_size_class(16)
    ///     .drop_policy(DropPolicy::MustNotDropActiveAllocations)
    ///     .build();
    /// ```
    #[cfg_attr(test, mutants::skip)] // Gets mutated to alternate version of itself.
    pub fn builder() -> PoolManagerBuilder {
        PoolManagerBuilder::new()
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> PoolManager<A>
where
    A: GlobalAlloc,
{
    pub(crate) fn new_inner(
        max_size_class: SizeClass,
        strategy: Arc<dyn CapacityStrategy>,
        drop_policy: DropPolicy,
        fallback: A,
    ) -> Self {
        let pools = (0..=max_size_class.index())
            .map(|_| OnceLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            pools,
            max_size_class,
            strategy: Mutex::new(strategy),
            fallback: FallbackAllocator::new(fallback),
            drop_policy,
            total_allocations: AtomicUsize::new(0),
            total_deallocations: AtomicUsize::new(0),
            fallback_allocations: AtomicUsize::new(0),
        }
    }

    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// The request is served from the pool of the smallest size class that is at least as large
    /// as both `size` and `alignment`, or by the fallback allocator if that size class is larger
    /// than [`max_supported_size()`](Self::max_supported_size) or its pool is exhausted.
    ///
    /// The returned memory is uninitialized and must be released via
    /// [`deallocate()`](Self::deallocate) on the same manager.
    ///
    /// # Errors
    ///
    /// * [`Error::ZeroSize`] if `size` is zero.
    /// * [`Error::InvalidLayout`] if `alignment` is not a power of two or `size` overflows
    ///   when rounded up to it.
    /// * [`Error::OutOfMemory`] if the request needed the fallback allocator and it failed.
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size, alignment)
            .map_err(|_layout_error| Error::InvalidLayout { size, alignment })?;

        self.allocate_layout(layout)
    }

    /// Allocates `size` bytes with no alignment requirement.
    ///
    /// Equivalent to [`allocate(size, 1)`](Self::allocate), so the block comes from the
    /// smallest size class that can hold `size` bytes.
    ///
    /// # Errors
    ///
    /// Same as [`allocate()`](Self::allocate).
    pub fn allocate_bytes(&self, size: usize) -> Result<NonNull<u8>> {
        self.allocate(size, 1)
    }

    /// Allocates memory for the given layout.
    ///
    /// # Errors
    ///
    /// Same as [`allocate()`](Self::allocate).
    pub fn allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.size() == 0 {
            return Err(Error::ZeroSize);
        }

        // Blocks are aligned to their own size, so a large enough block satisfies any alignment.
        let size_class = SizeClass::for_size(layout.size().max(layout.align()));

        if size_class > self.max_size_class {
            return self.allocate_fallback(layout);
        }

        if let Some(ptr) = self.pool(size_class).and_then(BlockPool::allocate) {
            self.total_allocations.fetch_add(1, atomic::Ordering::Relaxed);
            return Ok(ptr);
        }

        self.allocate_fallback(layout)
    }

    fn allocate_fallback(&self, layout: Layout) -> Result<NonNull<u8>> {
        let ptr = self.fallback.allocate(layout)?;

        self.fallback_allocations.fetch_add(1, atomic::Ordering::Relaxed);
        self.total_allocations.fetch_add(1, atomic::Ordering::Relaxed);

        trace!(
            size = layout.size(),
            alignment = layout.align(),
            "allocation served by fallback allocator"
        );

        Ok(ptr)
    }

    /// Releases memory previously allocated by this manager.
    ///
    /// Returns `true` if the memory was released. Returns `false` if `ptr` points into the arena
    /// of one of the pools but is not the start of a block currently handed out, for example
    /// because it was already released. In that case nothing is changed.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr` was returned by an allocation method of this
    /// manager and has not been released since, unless `ptr` points into a pool arena (in which
    /// case misuse is detected as described above). Pointers that no pool claims are assumed to
    /// come from the fallback allocator and are released through it.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) -> bool {
        if let Some(pool) = self.pool_containing(ptr) {
            if pool.deallocate(ptr) {
                self.total_deallocations.fetch_add(1, atomic::Ordering::Relaxed);
                return true;
            }

            warn!(
                block_size = pool.block_size(),
                ?ptr,
                "rejected deallocation of a pointer that is not an outstanding block"
            );
            return false;
        }

        // SAFETY: No pool claims the pointer and the caller guarantees it came from this
        // manager, so it must have come from the fallback allocator.
        unsafe {
            self.fallback.deallocate(ptr);
        }

        self.total_deallocations.fetch_add(1, atomic::Ordering::Relaxed);

        true
    }

    /// Moves `value` into memory allocated from this manager.
    ///
    /// Zero-sized types do not allocate and are given a dangling (but well-aligned) pointer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the value needed the fallback allocator and it failed.
    /// The value is dropped in that case.
    ///
    /// # Examples
    ///
    /// ```
    /// use sized_pool::PoolManager;
    ///
    /// let manager = PoolManager::new();
    ///
    /// let greeting = manager.construct(String::from("hello")).unwrap();
    ///
    /// // SAFETY: The pointer is valid until destroyed and we do not hold other references.
    /// assert_eq!(unsafe { greeting.as_ref() }, "hello");
    ///
    /// // SAFETY: The pointer came from construct() on this manager and is destroyed once.
    /// unsafe { manager.destroy(greeting) };
    /// ```
    pub fn construct<T>(&self, value: T) -> Result<NonNull<T>> {
        let layout = Layout::new::<T>();

        let ptr = if layout.size() == 0 {
            NonNull::dangling()
        } else {
            self.allocate_layout(layout)?.cast::<T>()
        };

        // SAFETY: The memory is freshly allocated (or zero-sized), properly sized and aligned
        // for `T`, and not referenced by anyone else.
        unsafe {
            ptr.write(value);
        }

        Ok(ptr)
    }

    /// Drops a value created by [`construct()`](Self::construct) and releases its memory.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr` was returned by `construct()` on this manager, that
    /// it has not been destroyed yet and that no references to the value remain.
    pub unsafe fn destroy<T>(&self, ptr: NonNull<T>) {
        // SAFETY: Forwarding guarantees from the caller: the value is initialized and unaliased.
        unsafe {
            ptr.drop_in_place();
        }

        // SAFETY: Forwarding guarantees from the caller: the memory came from this manager.
        unsafe {
            self.deallocate_value_memory(ptr);
        }
    }

    /// Releases the memory of a value created by [`construct()`](Self::construct) whose value
    /// has already been moved out, without dropping anything.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr` was returned by `construct()` on this manager and
    /// that its memory has not been released yet.
    pub(crate) unsafe fn deallocate_value_memory<T>(&self, ptr: NonNull<T>) {
        if size_of::<T>() == 0 {
            return;
        }

        // SAFETY: Forwarding guarantees from the caller: the memory came from this manager.
        let released = unsafe { self.deallocate(ptr.cast()) };
        debug_assert!(released, "released a value the manager did not hand out");
    }

    /// Allocates one contiguous array of `count` default-initialized values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLayout`] if the array size overflows and [`Error::OutOfMemory`]
    /// if the array needed the fallback allocator and it failed.
    ///
    /// # Examples
    ///
    /// ```
    /// use sized_pool::PoolManager;
    ///
    /// let manager = PoolManager::new();
    ///
    /// let numbers = manager.construct_array::<u32>(8).unwrap();
    ///
    /// // SAFETY: All elements are initialized and we hold no other references.
    /// assert_eq!(unsafe { numbers.as_ref() }, &[0; 8]);
    ///
    /// // SAFETY: The slice came from construct_array() on this manager and is destroyed once.
    /// unsafe { manager.destroy_array(numbers) };
    /// ```
    pub fn construct_array<T: Default>(&self, count: usize) -> Result<NonNull<[T]>> {
        self.construct_array_with(count, |_| T::default())
    }

    /// Allocates one contiguous array of `count` values, initializing the element at each
    /// index with the value returned by `f(index)`.
    ///
    /// If `f` panics, the elements initialized so far are dropped and the memory is released
    /// before the panic continues.
    ///
    /// # Errors
    ///
    /// Same as [`construct_array()`](Self::construct_array).
    pub fn construct_array_with<T>(
        &self,
        count: usize,
        mut f: impl FnMut(usize) -> T,
    ) -> Result<NonNull<[T]>> {
        let layout = Layout::array::<T>(count).map_err(|_layout_error| Error::InvalidLayout {
            size: size_of::<T>().saturating_mul(count),
            alignment: align_of::<T>(),
        })?;

        let first = if layout.size() == 0 {
            NonNull::dangling()
        } else {
            self.allocate_layout(layout)?.cast::<T>()
        };

        // If an initializer panics, drop what was already initialized and release the memory.
        let mut initialized = scopeguard::guard(0_usize, |initialized| {
            // SAFETY: The first `initialized` elements were written below and nobody else has
            // seen them, so we own them exclusively.
            unsafe {
                NonNull::slice_from_raw_parts(first, initialized).drop_in_place();
            }

            if layout.size() != 0 {
                // SAFETY: The memory was allocated above and has not been handed out.
                unsafe {
                    self.deallocate(first.cast());
                }
            }
        });

        for index in 0..count {
            let value = f(index);

            // SAFETY: The index is within the array we allocated for `count` elements.
            unsafe {
                first.add(index).write(value);
            }

            // Cannot overflow because it never exceeds `count`.
            *initialized = initialized.wrapping_add(1);
        }

        // Every element is initialized, so the cleanup must not run.
        _ = ScopeGuard::into_inner(initialized);

        Ok(NonNull::slice_from_raw_parts(first, count))
    }

    /// Drops every element of an array created by [`construct_array()`](Self::construct_array)
    /// or [`construct_array_with()`](Self::construct_array_with) and releases its memory.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `array` was returned by one of those methods on this
    /// manager, that it has not been destroyed yet and that no references to its elements remain.
    pub unsafe fn destroy_array<T>(&self, array: NonNull<[T]>) {
        // SAFETY: Forwarding guarantees from the caller: the elements are initialized and
        // unaliased.
        unsafe {
            array.drop_in_place();
        }

        if size_of::<T>() != 0 && !array.is_empty() {
            // SAFETY: Forwarding guarantees from the caller: the memory came from this manager.
            let released = unsafe { self.deallocate(array.cast()) };
            debug_assert!(released, "destroyed an array the manager did not hand out");
        }
    }

    /// Replaces the strategy used to size pools created from now on.
    ///
    /// Pools that already exist keep the dimensions they were created with.
    pub fn set_strategy(&self, strategy: Arc<dyn CapacityStrategy>) {
        debug!(?strategy, "replacing pool capacity strategy");

        *self.strategy.lock().expect(ERR_POISONED_LOCK) = strategy;
    }

    /// The strategy that will size the next pool to be created.
    #[must_use]
    pub fn strategy(&self) -> Arc<dyn CapacityStrategy> {
        Arc::clone(&self.strategy.lock().expect(ERR_POISONED_LOCK))
    }

    /// The largest size class served from pools.
    #[must_use]
    pub fn max_size_class(&self) -> SizeClass {
        self.max_size_class
    }

    /// The largest request size served from pools. Larger requests always go to the fallback
    /// allocator.
    #[must_use]
    pub fn max_supported_size(&self) -> usize {
        self.max_size_class.block_size()
    }

    /// The drop policy the manager was built with.
    #[must_use]
    pub fn drop_policy(&self) -> DropPolicy {
        self.drop_policy
    }

    /// The number of allocations served, from pools and from the fallback allocator.
    #[must_use]
    pub fn total_allocations(&self) -> usize {
        self.total_allocations.load(atomic::Ordering::Relaxed)
    }

    /// The number of successful deallocations.
    #[must_use]
    pub fn total_deallocations(&self) -> usize {
        self.total_deallocations.load(atomic::Ordering::Relaxed)
    }

    /// The number of allocations served by the fallback allocator, because the request was
    /// larger than the largest pooled size class or because its pool was exhausted.
    #[must_use]
    pub fn fallback_allocations(&self) -> usize {
        self.fallback_allocations.load(atomic::Ordering::Relaxed)
    }

    /// The number of allocations not yet deallocated.
    ///
    /// Calculated from two counters read one after the other, so under concurrent traffic the
    /// result may be briefly out of date.
    #[must_use]
    pub fn active_allocations(&self) -> usize {
        let deallocations = self.total_deallocations();
        self.total_allocations().saturating_sub(deallocations)
    }

    /// The number of pools created so far.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.existing_pools().count()
    }

    /// A snapshot of the counters of the pool for `size_class`, if that pool has been created.
    #[must_use]
    pub fn pool_stats(&self, size_class: SizeClass) -> Option<PoolStats> {
        self.pools
            .get(size_class.index() as usize)?
            .get()?
            .as_ref()
            .map(BlockPool::stats)
    }

    /// A snapshot of the counters of the manager and all of its pools.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        ManagerStats::new(
            self.total_allocations(),
            self.total_deallocations(),
            self.fallback_allocations(),
            self.max_supported_size(),
            self.existing_pools().map(BlockPool::stats).collect(),
        )
    }

    /// Returns the pool for the size class, creating it if this is the first request for it.
    ///
    /// Returns `None` if the size class has no pool because creating it failed.
    fn pool(&self, size_class: SizeClass) -> Option<&BlockPool> {
        let slot = self
            .pools
            .get(size_class.index() as usize)
            .expect("size class was checked against the maximum before looking up its pool");

        // Concurrent first callers wait here until the one running the initializer is done.
        slot.get_or_init(|| self.create_pool(size_class)).as_ref()
    }

    fn create_pool(&self, size_class: SizeClass) -> Option<BlockPool> {
        // We hold the strategy lock only long enough to grab the current strategy.
        let strategy = self.strategy();

        let block_size = size_class.block_size();
        let object_count = strategy.object_count(block_size);
        let pool_byte_size = strategy.pool_byte_size(block_size);

        if block_size.saturating_mul(object_count.get()) != pool_byte_size {
            warn!(
                ?strategy,
                block_size,
                object_count = object_count.get(),
                pool_byte_size,
                "capacity strategy reports inconsistent pool dimensions, using object count"
            );
        }

        let block_size_nz =
            NonZero::new(block_size).expect("block sizes are powers of two, never zero");

        match BlockPool::new(block_size_nz, object_count) {
            Ok(pool) => {
                debug!(
                    size_class = size_class.index(),
                    block_size,
                    object_count = object_count.get(),
                    "created block pool"
                );

                Some(pool)
            }
            Err(error) => {
                warn!(
                    size_class = size_class.index(),
                    block_size,
                    object_count = object_count.get(),
                    %error,
                    "could not create block pool, size class will use the fallback allocator"
                );

                None
            }
        }
    }

    fn existing_pools(&self) -> impl Iterator<Item = &BlockPool> {
        self.pools
            .iter()
            .filter_map(|slot| slot.get().and_then(Option::as_ref))
    }

    fn pool_containing(&self, ptr: NonNull<u8>) -> Option<&BlockPool> {
        self.existing_pools().find(|pool| pool.contains(ptr))
    }
}

impl<A> fmt::Debug for PoolManager<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("pools", &self.pools)
            .field("max_size_class", &self.max_size_class)
            .field("strategy", &self.strategy)
            .field("fallback", &self.fallback)
            .field("drop_policy", &self.drop_policy)
            .field("total_allocations", &self.total_allocations)
            .field("total_deallocations", &self.total_deallocations)
            .field("fallback_allocations", &self.fallback_allocations)
            .finish()
    }
}

impl<A> Drop for PoolManager<A> {
    fn drop(&mut self) {
        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the first panic was, leading to debug difficulties.
        if thread::panicking()
            || !matches!(self.drop_policy, DropPolicy::MustNotDropActiveAllocations)
        {
            return;
        }

        let allocations = self.total_allocations.load(atomic::Ordering::Relaxed);
        let deallocations = self.total_deallocations.load(atomic::Ordering::Relaxed);
        let active = allocations.saturating_sub(deallocations);

        assert!(
            active == 0,
            "dropped a PoolManager with {active} active allocations - this is forbidden by DropPolicy::MustNotDropActiveAllocations"
        );
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::cell::Cell;
    use std::collections::HashSet;
    use std::panic::{self, AssertUnwindSafe};
    use std::rc::Rc;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::FixedCountStrategy;
    use crate::test_support::{CountingAllocator, FailingAllocator};

    assert_impl_all!(PoolManager: Send, Sync, fmt::Debug, Default);

    struct CountOnDrop(Rc<Cell<usize>>);

    impl Drop for CountOnDrop {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn small_manager(object_count: usize) -> PoolManager {
        PoolManager::builder()
            .strategy(FixedCountStrategy::new(NonZero::new(object_count).unwrap()))
            .build()
    }

    #[test]
    fn smoke_test() {
        let manager = PoolManager::new();

        let ptr = manager.allocate_bytes(24).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(0x5A, 24);
        }

        assert_eq!(manager.pool_count(), 1);
        assert_eq!(manager.total_allocations(), 1);
        assert_eq!(manager.active_allocations(), 1);

        assert!(unsafe { manager.deallocate(ptr) });
        assert_eq!(manager.total_deallocations(), 1);
        assert_eq!(manager.active_allocations(), 0);
    }

    #[test]
    fn no_pools_exist_until_requested() {
        let manager = PoolManager::new();

        assert_eq!(manager.pool_count(), 0);
        assert!(manager.pool_stats(SizeClass::new(4)).is_none());
        assert!(manager.stats().pools().is_empty());
    }

    #[test]
    fn zero_size_is_rejected() {
        let manager = PoolManager::new();

        assert_eq!(manager.allocate_bytes(0), Err(Error::ZeroSize));
        assert_eq!(manager.allocate(0, 16), Err(Error::ZeroSize));
        assert_eq!(manager.total_allocations(), 0);
        assert_eq!(manager.pool_count(), 0);
    }

    #[test]
    fn invalid_alignment_is_rejected() {
        let manager = PoolManager::new();

        assert_eq!(
            manager.allocate(16, 3),
            Err(Error::InvalidLayout {
                size: 16,
                alignment: 3
            })
        );
        assert_eq!(
            manager.allocate(16, 0),
            Err(Error::InvalidLayout {
                size: 16,
                alignment: 0
            })
        );
    }

    #[test]
    fn request_is_served_by_smallest_sufficient_class() {
        let manager = PoolManager::new();

        let ptr = manager.allocate_bytes(5).unwrap();

        let stats = manager.pool_stats(SizeClass::new(3)).unwrap();
        assert_eq!(stats.block_size(), 8);
        assert_eq!(stats.allocated(), 1);

        unsafe {
            manager.deallocate(ptr);
        }
    }

    #[test]
    fn alignment_raises_size_class() {
        let manager = PoolManager::new();

        let ptr = manager.allocate(8, 64).unwrap();
        assert_eq!(ptr.as_ptr().addr() % 64, 0);
        assert!(manager.pool_stats(SizeClass::new(6)).is_some());
        assert!(manager.pool_stats(SizeClass::new(3)).is_none());

        unsafe {
            manager.deallocate(ptr);
        }
    }

    #[test]
    fn oversize_goes_to_fallback() {
        let manager = PoolManager::builder()
            .max_size_class(10)
            .fallback(CountingAllocator::new())
            .build();

        let ptr = manager.allocate_bytes(1025).unwrap();

        assert_eq!(manager.fallback_allocations(), 1);
        assert_eq!(manager.total_allocations(), 1);
        assert_eq!(manager.pool_count(), 0);
        assert_eq!(manager.fallback.allocator().allocations(), 1);

        assert!(unsafe { manager.deallocate(ptr) });

        assert_eq!(manager.total_deallocations(), 1);
        assert_eq!(manager.fallback.allocator().deallocations(), 1);
    }

    #[test]
    fn max_supported_size_itself_is_pooled() {
        let manager = PoolManager::builder().max_size_class(10).build();

        let ptr = manager.allocate_bytes(1024).unwrap();

        assert_eq!(manager.fallback_allocations(), 0);
        assert_eq!(manager.pool_count(), 1);

        unsafe {
            manager.deallocate(ptr);
        }
    }

    #[test]
    fn exhausted_pool_falls_back_once_per_request() {
        let manager = small_manager(4);

        let pooled = (0..4)
            .map(|_| manager.allocate_bytes(16).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(manager.fallback_allocations(), 0);

        let extra_a = manager.allocate_bytes(16).unwrap();
        assert_eq!(manager.fallback_allocations(), 1);
        let extra_b = manager.allocate_bytes(16).unwrap();
        assert_eq!(manager.fallback_allocations(), 2);

        // The pool was not grown or replaced.
        let stats = manager.pool_stats(SizeClass::new(4)).unwrap();
        assert_eq!(stats.capacity(), 4);
        assert_eq!(stats.allocated(), 4);

        unsafe {
            assert!(manager.deallocate(extra_a));
            assert!(manager.deallocate(extra_b));

            for ptr in pooled {
                assert!(manager.deallocate(ptr));
            }
        }

        assert_eq!(manager.active_allocations(), 0);
        assert_eq!(manager.pool_stats(SizeClass::new(4)).unwrap().allocated(), 0);
    }

    #[test]
    fn pool_is_reused_after_release() {
        let manager = small_manager(1);

        let first = manager.allocate_bytes(32).unwrap();
        unsafe {
            manager.deallocate(first);
        }

        let second = manager.allocate_bytes(32).unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.fallback_allocations(), 0);

        unsafe {
            manager.deallocate(second);
        }
    }

    #[test]
    fn double_free_of_pooled_block_is_rejected() {
        let manager = PoolManager::new();

        let ptr = manager.allocate_bytes(64).unwrap();

        assert!(unsafe { manager.deallocate(ptr) });
        assert!(!unsafe { manager.deallocate(ptr) });

        assert_eq!(manager.total_deallocations(), 1);
        assert_eq!(manager.active_allocations(), 0);
    }

    #[test]
    fn misaligned_pointer_into_pool_is_rejected() {
        let manager = PoolManager::new();

        let ptr = manager.allocate_bytes(64).unwrap();
        let inside = unsafe { ptr.byte_add(1) };

        assert!(!unsafe { manager.deallocate(inside) });
        assert_eq!(manager.active_allocations(), 1);

        assert!(unsafe { manager.deallocate(ptr) });
    }

    #[test]
    fn fallback_failure_is_reported() {
        let manager = PoolManager::builder()
            .max_size_class(4)
            .fallback(FailingAllocator)
            .build();

        assert_eq!(
            manager.allocate(64, 8),
            Err(Error::OutOfMemory {
                size: 64,
                alignment: 8
            })
        );

        assert_eq!(manager.total_allocations(), 0);
        assert_eq!(manager.fallback_allocations(), 0);
    }

    #[test]
    fn unavailable_pool_uses_fallback() {
        // A pool this large cannot be laid out, so its size class is served by the fallback.
        let manager = PoolManager::builder()
            .strategy(FixedCountStrategy::new(NonZero::new(usize::MAX).unwrap()))
            .fallback(CountingAllocator::new())
            .build();

        let ptr = manager.allocate_bytes(100).unwrap();

        assert_eq!(manager.pool_count(), 0);
        assert_eq!(manager.fallback_allocations(), 1);
        assert_eq!(manager.fallback.allocator().allocations(), 1);

        unsafe {
            assert!(manager.deallocate(ptr));
        }
    }

    #[test]
    fn pool_without_room_for_bookkeeping_uses_fallback() {
        // One-byte blocks keep the arena layout valid, but an index per block cannot be stored.
        let manager = PoolManager::builder()
            .strategy(FixedCountStrategy::new(NonZero::new(usize::MAX >> 3).unwrap()))
            .fallback(CountingAllocator::new())
            .build();

        let ptr = manager.allocate_bytes(1).unwrap();

        assert_eq!(manager.pool_count(), 0);
        assert_eq!(manager.fallback_allocations(), 1);

        // The size class stays unavailable instead of retrying pool creation.
        let second = manager.allocate_bytes(1).unwrap();
        assert_eq!(manager.pool_count(), 0);
        assert_eq!(manager.fallback.allocator().allocations(), 2);

        unsafe {
            assert!(manager.deallocate(ptr));
            assert!(manager.deallocate(second));
        }
    }

    #[test]
    fn replaced_strategy_affects_only_new_pools() {
        let manager = small_manager(4);

        let small = manager.allocate_bytes(8).unwrap();
        manager.set_strategy(Arc::new(FixedCountStrategy::new(NonZero::new(16).unwrap())));
        let large = manager.allocate_bytes(512).unwrap();

        assert_eq!(manager.pool_stats(SizeClass::new(3)).unwrap().capacity(), 4);
        assert_eq!(manager.pool_stats(SizeClass::new(9)).unwrap().capacity(), 16);
        assert_eq!(manager.strategy().object_count(1).get(), 16);

        unsafe {
            manager.deallocate(small);
            manager.deallocate(large);
        }
    }

    #[test]
    fn inconsistent_strategy_uses_object_count() {
        #[derive(Debug)]
        struct Inconsistent;

        impl CapacityStrategy for Inconsistent {
            fn object_count(&self, _block_size: usize) -> NonZero<usize> {
                NonZero::new(2).unwrap()
            }

            fn pool_byte_size(&self, _block_size: usize) -> usize {
                1
            }
        }

        let manager = PoolManager::builder().strategy(Inconsistent).build();

        let ptr = manager.allocate_bytes(64).unwrap();
        assert_eq!(manager.pool_stats(SizeClass::new(6)).unwrap().capacity(), 2);

        unsafe {
            manager.deallocate(ptr);
        }
    }

    #[test]
    fn pooled_blocks_are_unique() {
        let manager = small_manager(64);

        let ptrs = (0..64)
            .map(|_| manager.allocate_bytes(16).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(ptrs.iter().collect::<HashSet<_>>().len(), 64);

        for ptr in ptrs {
            unsafe {
                manager.deallocate(ptr);
            }
        }
    }

    #[test]
    fn construct_and_destroy_runs_drop() {
        struct SetOnDrop(Rc<Cell<bool>>);

        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let manager = PoolManager::new();
        let dropped = Rc::new(Cell::new(false));

        let ptr = manager.construct(SetOnDrop(Rc::clone(&dropped))).unwrap();
        assert!(!dropped.get());
        assert_eq!(manager.active_allocations(), 1);

        unsafe {
            manager.destroy(ptr);
        }

        assert!(dropped.get());
        assert_eq!(manager.active_allocations(), 0);
    }

    #[test]
    fn construct_zero_sized_type_does_not_allocate() {
        let manager = PoolManager::new();

        let ptr = manager.construct(()).unwrap();
        assert_eq!(manager.total_allocations(), 0);

        unsafe {
            manager.destroy(ptr);
        }

        assert_eq!(manager.total_deallocations(), 0);
    }

    #[test]
    fn construct_honors_type_alignment() {
        #[repr(align(128))]
        struct Aligned(u8);

        let manager = PoolManager::new();

        let ptr = manager.construct(Aligned(7)).unwrap();
        assert_eq!(ptr.as_ptr().addr() % 128, 0);
        assert_eq!(unsafe { ptr.as_ref() }.0, 7);

        unsafe {
            manager.destroy(ptr);
        }
    }

    #[test]
    fn construct_array_initializes_every_element() {
        let manager = PoolManager::new();

        let array = manager.construct_array_with(10, |index| index * 2).unwrap();

        assert_eq!(array.len(), 10);
        assert_eq!(
            unsafe { array.as_ref() },
            &[0, 2, 4, 6, 8, 10, 12, 14, 16, 18]
        );

        // One allocation for the whole array.
        assert_eq!(manager.total_allocations(), 1);

        unsafe {
            manager.destroy_array(array);
        }

        assert_eq!(manager.active_allocations(), 0);
    }

    #[test]
    fn destroy_array_drops_every_element() {
        let manager = PoolManager::new();
        let drops = Rc::new(Cell::new(0_usize));

        let array = manager
            .construct_array_with(5, |_| CountOnDrop(Rc::clone(&drops)))
            .unwrap();

        unsafe {
            manager.destroy_array(array);
        }

        assert_eq!(drops.get(), 5);
    }

    #[test]
    fn empty_array_does_not_allocate() {
        let manager = PoolManager::new();

        let array = manager.construct_array::<u64>(0).unwrap();
        assert!(array.is_empty());
        assert_eq!(manager.total_allocations(), 0);

        unsafe {
            manager.destroy_array(array);
        }

        assert_eq!(manager.total_deallocations(), 0);
    }

    #[test]
    fn array_size_overflow_is_invalid_layout() {
        let manager = PoolManager::new();

        let result = manager.construct_array::<u64>(usize::MAX);

        assert!(matches!(result, Err(Error::InvalidLayout { .. })));
    }

    #[test]
    fn panicking_initializer_cleans_up() {
        let manager = PoolManager::new();
        let drops = Rc::new(Cell::new(0_usize));

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            manager.construct_array_with(10, |index| {
                assert!(index < 3, "initializer failed");
                CountOnDrop(Rc::clone(&drops))
            })
        }));

        assert!(result.is_err());
        assert_eq!(drops.get(), 3);
        assert_eq!(manager.active_allocations(), 0);
    }

    #[test]
    fn stats_snapshot_matches_counters() {
        let manager = small_manager(2);

        let a = manager.allocate_bytes(10).unwrap();
        let b = manager.allocate_bytes(10).unwrap();
        let c = manager.allocate_bytes(10).unwrap();
        let d = manager.allocate_bytes(3000).unwrap();

        let stats = manager.stats();
        assert_eq!(stats.total_allocations(), 4);
        assert_eq!(stats.fallback_allocations(), 1);
        assert_eq!(stats.active_allocations(), 4);
        assert_eq!(stats.max_supported_size(), 1 << 20);

        let classes = stats
            .pools()
            .iter()
            .map(|pool| pool.block_size())
            .collect::<Vec<_>>();
        assert_eq!(classes, vec![16, 4096]);

        unsafe {
            for ptr in [a, b, c, d] {
                manager.deallocate(ptr);
            }
        }
    }

    #[test]
    fn drop_with_active_allocations_is_allowed_by_default() {
        let manager = PoolManager::new();

        let _leaked = manager.allocate_bytes(8).unwrap();

        drop(manager);
    }

    #[test]
    fn drop_without_active_allocations_does_not_panic_if_policy_must_not_drop() {
        let manager = PoolManager::builder()
            .drop_policy(DropPolicy::MustNotDropActiveAllocations)
            .build();

        let ptr = manager.allocate_bytes(8).unwrap();
        unsafe {
            manager.deallocate(ptr);
        }

        drop(manager);
    }

    #[test]
    #[should_panic]
    fn drop_with_active_allocations_panics_if_policy_must_not_drop() {
        let manager = PoolManager::builder()
            .drop_policy(DropPolicy::MustNotDropActiveAllocations)
            .build();

        let _leaked = manager.allocate_bytes(8).unwrap();

        drop(manager);
    }
}
