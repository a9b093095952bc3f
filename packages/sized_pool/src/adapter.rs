use std::alloc::{GlobalAlloc, Layout, System};
use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::{Error, PoolManager, Result};

/// Allocates storage for arrays of `T` on behalf of a container.
///
/// Implementations compare equal if memory allocated through one of them can be released
/// through the other.
pub trait ElementAllocator<T>: PartialEq {
    /// Allocates uninitialized storage for `count` contiguous values of `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage could not be allocated.
    fn allocate(&self, count: usize) -> Result<NonNull<T>>;

    /// Releases storage previously allocated for `count` values.
    ///
    /// The values themselves are not dropped.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr` was returned by [`allocate()`](Self::allocate) on
    /// this allocator (or one equal to it) with the same `count`, and has not been released since.
    unsafe fn deallocate(&self, ptr: NonNull<T>, count: usize);

    /// Moves `value` into the storage at `ptr`, without dropping whatever was there before.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr` points to allocated storage for a `T` that is valid
    /// for writes and not referenced by anyone else.
    unsafe fn construct(&self, ptr: NonNull<T>, value: T) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            ptr.write(value);
        }
    }

    /// Drops the value at `ptr` in place, leaving the storage allocated.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr` points to an initialized `T` that is not referenced
    /// by anyone else and is not used again until re-initialized.
    unsafe fn destroy(&self, ptr: NonNull<T>) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            ptr.drop_in_place();
        }
    }
}

/// An [`ElementAllocator`] that takes its storage from a [`PoolManager`].
///
/// The adapter is nothing more than a reference to the manager, so it is cheap to copy and
/// can be rebound to a different element type with [`rebind()`](Self::rebind). Two adapters are
/// equal if they refer to the same manager, regardless of their element types.
///
/// # Examples
///
/// ```
/// use sized_pool::{ElementAllocator, ManagedAllocator, PoolManager};
///
/// let manager = PoolManager::new();
/// let allocator = ManagedAllocator::<u64>::new(&manager);
///
/// let storage = allocator.allocate(4).unwrap();
///
/// // SAFETY: The storage holds 4 values and we release it with the same count.
/// unsafe {
///     for index in 0..4 {
///         allocator.construct(storage.add(index), index as u64);
///     }
///
///     assert_eq!(storage.add(3).read(), 3);
///
///     allocator.deallocate(storage, 4);
/// }
///
/// assert_eq!(allocator, allocator.rebind::<String>());
/// ```
pub struct ManagedAllocator<'m, T, A = System> {
    manager: &'m PoolManager<A>,

    _element: PhantomData<fn() -> T>,
}

impl<'m, T, A> ManagedAllocator<'m, T, A>
where
    A: GlobalAlloc,
{
    /// Creates an adapter that allocates from `manager`.
    #[must_use]
    pub const fn new(manager: &'m PoolManager<A>) -> Self {
        Self {
            manager,
            _element: PhantomData,
        }
    }

    /// The manager the adapter allocates from.
    #[must_use]
    pub const fn manager(&self) -> &'m PoolManager<A> {
        self.manager
    }

    /// Creates an adapter for a different element type that allocates from the same manager.
    #[must_use]
    pub const fn rebind<U>(&self) -> ManagedAllocator<'m, U, A> {
        ManagedAllocator::new(self.manager)
    }
}

impl<T, A> ElementAllocator<T> for ManagedAllocator<'_, T, A>
where
    A: GlobalAlloc,
{
    fn allocate(&self, count: usize) -> Result<NonNull<T>> {
        let layout = Layout::array::<T>(count).map_err(|_layout_error| Error::InvalidLayout {
            size: size_of::<T>().saturating_mul(count),
            alignment: align_of::<T>(),
        })?;

        if layout.size() == 0 {
            return Ok(NonNull::dangling());
        }

        Ok(self.manager.allocate_layout(layout)?.cast())
    }

    unsafe fn deallocate(&self, ptr: NonNull<T>, count: usize) {
        // Zero-sized requests were never allocated.
        if size_of::<T>() == 0 || count == 0 {
            return;
        }

        // SAFETY: Forwarding guarantees from the caller: the memory came from our manager.
        let released = unsafe { self.manager.deallocate(ptr.cast()) };
        debug_assert!(released, "released storage the manager did not hand out");
    }
}

impl<T, A> Clone for ManagedAllocator<'_, T, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, A> Copy for ManagedAllocator<'_, T, A> {}

impl<T, U, A> PartialEq<ManagedAllocator<'_, U, A>> for ManagedAllocator<'_, T, A> {
    fn eq(&self, other: &ManagedAllocator<'_, U, A>) -> bool {
        ptr::eq(self.manager, other.manager)
    }
}

impl<T, A> Eq for ManagedAllocator<'_, T, A> {}

impl<T, A> fmt::Debug for ManagedAllocator<'_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedAllocator")
            .field("element", &type_name::<T>())
            .field("manager", &ptr::from_ref(self.manager))
            .finish()
    }
}

/// An [`ElementAllocator`] that shares ownership of the [`PoolManager`] it allocates from.
///
/// Unlike [`ManagedAllocator`], this adapter is not tied to the lifetime of a borrowed manager,
/// so containers using it can be stored anywhere. The [`Default`] adapter allocates from
/// [`PoolManager::global()`]. Two adapters are equal if they share the same manager.
///
/// # Examples
///
/// ```
/// use sized_pool::{SharedAllocator, SharedVec};
///
/// let mut values = SharedVec::new_in(SharedAllocator::global());
/// values.extend([1, 2, 3]);
///
/// assert_eq!(values.iter().sum::<i32>(), 6);
/// ```
pub struct SharedAllocator<T, A = System> {
    manager: Arc<PoolManager<A>>,

    _element: PhantomData<fn() -> T>,
}

impl<T> SharedAllocator<T> {
    /// Creates an adapter that allocates from the current process-wide manager.
    ///
    /// The adapter keeps using that manager even if it is later replaced via
    /// [`PoolManager::set_global()`].
    #[must_use]
    pub fn global() -> Self {
        Self::new(PoolManager::global())
    }
}

impl<T, A> SharedAllocator<T, A>
where
    A: GlobalAlloc,
{
    /// Creates an adapter that allocates from `manager`.
    #[must_use]
    pub fn new(manager: Arc<PoolManager<A>>) -> Self {
        Self {
            manager,
            _element: PhantomData,
        }
    }

    /// The manager the adapter allocates from.
    #[must_use]
    pub fn manager(&self) -> &Arc<PoolManager<A>> {
        &self.manager
    }

    /// Creates an adapter for a different element type that allocates from the same manager.
    #[must_use]
    pub fn rebind<U>(&self) -> SharedAllocator<U, A> {
        SharedAllocator::new(Arc::clone(&self.manager))
    }

    /// A borrowing adapter over the same manager.
    #[must_use]
    pub fn as_managed(&self) -> ManagedAllocator<'_, T, A> {
        ManagedAllocator::new(&self.manager)
    }
}

impl<T, A> ElementAllocator<T> for SharedAllocator<T, A>
where
    A: GlobalAlloc,
{
    fn allocate(&self, count: usize) -> Result<NonNull<T>> {
        self.as_managed().allocate(count)
    }

    unsafe fn deallocate(&self, ptr: NonNull<T>, count: usize) {
        // SAFETY: Forwarding guarantees from the caller. The borrowing adapter is equal to us.
        unsafe {
            self.as_managed().deallocate(ptr, count);
        }
    }
}

impl<T> Default for SharedAllocator<T> {
    fn default() -> Self {
        Self::global()
    }
}

impl<T, A> Clone for SharedAllocator<T, A> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            _element: PhantomData,
        }
    }
}

impl<T, U, A> PartialEq<SharedAllocator<U, A>> for SharedAllocator<T, A> {
    fn eq(&self, other: &SharedAllocator<U, A>) -> bool {
        Arc::ptr_eq(&self.manager, &other.manager)
    }
}

impl<T, A> Eq for SharedAllocator<T, A> {}

impl<T, A> fmt::Debug for SharedAllocator<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedAllocator")
            .field("element", &type_name::<T>())
            .field("manager", &Arc::as_ptr(&self.manager))
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::SizeClass;

    assert_impl_all!(ManagedAllocator<'static, u32>: Send, Sync, Copy, fmt::Debug, Eq);
    assert_impl_all!(SharedAllocator<u32>: Send, Sync, Clone, fmt::Debug, Eq, Default);

    #[test]
    fn allocate_uses_manager_pools() {
        let manager = PoolManager::new();
        let allocator = ManagedAllocator::<u32>::new(&manager);

        let storage = allocator.allocate(10).unwrap();

        // 40 bytes round up to the 64-byte class.
        assert_eq!(
            manager.pool_stats(SizeClass::new(6)).unwrap().allocated(),
            1
        );

        unsafe {
            allocator.deallocate(storage, 10);
        }

        assert_eq!(manager.active_allocations(), 0);
    }

    #[test]
    fn construct_and_destroy_manage_value_lifetime() {
        let manager = PoolManager::new();
        let allocator = ManagedAllocator::<Rc<Cell<u8>>>::new(&manager);
        let shared = Rc::new(Cell::new(1));

        let storage = allocator.allocate(1).unwrap();

        unsafe {
            allocator.construct(storage, Rc::clone(&shared));
        }
        assert_eq!(Rc::strong_count(&shared), 2);

        unsafe {
            allocator.destroy(storage);
        }
        assert_eq!(Rc::strong_count(&shared), 1);

        unsafe {
            allocator.deallocate(storage, 1);
        }
    }

    #[test]
    fn zero_sized_requests_do_not_allocate() {
        let manager = PoolManager::new();
        let empty = ManagedAllocator::<u64>::new(&manager);
        let unit = ManagedAllocator::<()>::new(&manager);

        let a = empty.allocate(0).unwrap();
        let b = unit.allocate(1000).unwrap();

        assert_eq!(manager.total_allocations(), 0);

        unsafe {
            empty.deallocate(a, 0);
            unit.deallocate(b, 1000);
        }

        assert_eq!(manager.total_deallocations(), 0);
    }

    #[test]
    fn oversized_arrays_are_served_by_fallback() {
        let manager = PoolManager::builder().max_size_class(8).build();
        let allocator = ManagedAllocator::<u64>::new(&manager);

        let storage = allocator.allocate(1000).unwrap();
        assert_eq!(manager.fallback_allocations(), 1);

        unsafe {
            allocator.deallocate(storage, 1000);
        }

        assert_eq!(manager.active_allocations(), 0);
    }

    #[test]
    fn overflowing_count_is_invalid_layout() {
        let manager = PoolManager::new();
        let allocator = ManagedAllocator::<u64>::new(&manager);

        assert!(matches!(
            allocator.allocate(usize::MAX),
            Err(Error::InvalidLayout { .. })
        ));
    }

    #[test]
    fn equality_follows_manager_identity() {
        let first = PoolManager::new();
        let second = PoolManager::new();

        let a = ManagedAllocator::<u8>::new(&first);
        let b = ManagedAllocator::<u8>::new(&first);
        let c = ManagedAllocator::<u8>::new(&second);

        assert_eq!(a, b);
        assert_ne!(a, c);

        let rebound = a.rebind::<String>();
        assert_eq!(a, rebound);
        assert_ne!(c, rebound);
        assert!(ptr::eq(rebound.manager(), &first));
    }

    #[test]
    fn rebound_allocator_releases_memory_of_sibling() {
        let manager = PoolManager::new();
        let bytes = ManagedAllocator::<u8>::new(&manager);
        let words = bytes.rebind::<u64>();

        let storage = words.allocate(4).unwrap();

        // Equal allocators may release each other's memory.
        unsafe {
            bytes.rebind::<u64>().deallocate(storage, 4);
        }

        assert_eq!(manager.active_allocations(), 0);
    }

    #[test]
    fn shared_allocator_keeps_manager_alive() {
        let manager = Arc::new(PoolManager::new());
        let allocator = SharedAllocator::<u64>::new(Arc::clone(&manager));

        let storage = allocator.allocate(4).unwrap();
        assert_eq!(manager.active_allocations(), 1);

        // The adapter holds its own handle, so the memory stays valid after ours is gone.
        let weak = Arc::downgrade(&manager);
        drop(manager);
        assert!(weak.upgrade().is_some());

        unsafe {
            storage.write(42);
            assert_eq!(storage.read(), 42);

            allocator.deallocate(storage, 4);
        }

        assert_eq!(allocator.manager().active_allocations(), 0);

        drop(allocator);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn shared_equality_follows_manager_identity() {
        let manager = Arc::new(PoolManager::new());

        let a = SharedAllocator::<u8>::new(Arc::clone(&manager));
        let b = a.clone();
        let c = SharedAllocator::<u8>::new(Arc::new(PoolManager::new()));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, a.rebind::<String>());
        assert_eq!(a.as_managed(), ManagedAllocator::<u8>::new(&manager));
    }

    #[test]
    fn default_shared_allocator_uses_global_manager() {
        let allocator = SharedAllocator::<u32>::default();

        assert!(Arc::ptr_eq(allocator.manager(), &PoolManager::global()));
        assert_eq!(allocator, SharedAllocator::<u32>::global());
    }
}
