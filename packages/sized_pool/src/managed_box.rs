use std::alloc::{GlobalAlloc, System};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::{PoolManager, Result};

/// Owns one value stored in memory allocated from a [`PoolManager`].
///
/// The value is dropped and its memory released through the manager when the box is dropped.
///
/// # Examples
///
/// ```
/// use sized_pool::{ManagedBox, PoolManager};
///
/// let manager = PoolManager::new();
///
/// let mut numbers = ManagedBox::new_in(vec![1, 2, 3], &manager).unwrap();
/// numbers.push(4);
///
/// assert_eq!(*numbers, [1, 2, 3, 4]);
/// assert_eq!(manager.active_allocations(), 1);
///
/// drop(numbers);
///
/// assert_eq!(manager.active_allocations(), 0);
/// ```
pub struct ManagedBox<'m, T, A = System>
where
    A: GlobalAlloc,
{
    ptr: NonNull<T>,
    manager: &'m PoolManager<A>,
}

impl<'m, T, A> ManagedBox<'m, T, A>
where
    A: GlobalAlloc,
{
    /// Moves `value` into memory allocated from `manager`.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager could not allocate memory for the value. The value is
    /// dropped in that case.
    pub fn new_in(value: T, manager: &'m PoolManager<A>) -> Result<Self> {
        let ptr = manager.construct(value)?;

        Ok(Self { ptr, manager })
    }

    /// The manager the value is stored in.
    #[must_use]
    pub fn manager(this: &Self) -> &'m PoolManager<A> {
        this.manager
    }

    /// A pointer to the stored value, valid for as long as the box lives.
    #[must_use]
    pub fn as_ptr(this: &Self) -> NonNull<T> {
        this.ptr
    }

    /// Moves the value out of the box, releasing its memory.
    #[must_use]
    pub fn into_inner(this: Self) -> T {
        let this = ManuallyDrop::new(this);

        // SAFETY: The box owns an initialized value and we consume the box, so the value is
        // read exactly once and never dropped in place.
        let value = unsafe { this.ptr.read() };

        // SAFETY: The memory came from construct() on this manager and is released once.
        // The value was moved out above, so only the memory remains to be released.
        unsafe {
            this.manager.deallocate_value_memory(this.ptr);
        }

        value
    }
}

impl<T, A> Deref for ManagedBox<'_, T, A>
where
    A: GlobalAlloc,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: The box owns an initialized value and shared access to the box grants shared
        // access to the value.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T, A> DerefMut for ManagedBox<'_, T, A>
where
    A: GlobalAlloc,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: The box owns an initialized value and exclusive access to the box grants
        // exclusive access to the value.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T, A> Drop for ManagedBox<'_, T, A>
where
    A: GlobalAlloc,
{
    fn drop(&mut self) {
        // SAFETY: The value was created by construct() on this manager and the box is the only
        // owner, so it is destroyed exactly once.
        unsafe {
            self.manager.destroy(self.ptr);
        }
    }
}

impl<T, A> fmt::Debug for ManagedBox<'_, T, A>
where
    T: fmt::Debug,
    A: GlobalAlloc,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedBox")
            .field("value", &**self)
            .finish_non_exhaustive()
    }
}

// SAFETY: The box owns its value like `Box<T>` does, so it can move to another thread if the
// value can. The manager reference requires the manager to be Sync.
unsafe impl<T, A> Send for ManagedBox<'_, T, A>
where
    T: Send,
    A: GlobalAlloc + Sync,
{
}

// SAFETY: Shared access to the box only grants shared access to the value.
unsafe impl<T, A> Sync for ManagedBox<'_, T, A>
where
    T: Sync,
    A: GlobalAlloc + Sync,
{
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::ptr;
    use std::rc::Rc;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(ManagedBox<'static, u32>: Send, Sync, fmt::Debug);
    assert_not_impl_any!(ManagedBox<'static, Rc<u32>>: Send, Sync);

    #[test]
    fn value_is_accessible_and_mutable() {
        let manager = PoolManager::new();

        let mut boxed = ManagedBox::new_in(String::from("pool"), &manager).unwrap();
        boxed.push_str("ed");

        assert_eq!(*boxed, "pooled");
        assert_eq!(boxed.len(), 6);
    }

    #[test]
    fn drop_destroys_value_and_releases_memory() {
        let manager = PoolManager::new();
        let shared = Rc::new(Cell::new(0));

        let boxed = ManagedBox::new_in(Rc::clone(&shared), &manager).unwrap();
        assert_eq!(Rc::strong_count(&shared), 2);
        assert_eq!(manager.active_allocations(), 1);

        drop(boxed);

        assert_eq!(Rc::strong_count(&shared), 1);
        assert_eq!(manager.active_allocations(), 0);
    }

    #[test]
    fn into_inner_returns_value_without_dropping_it() {
        let manager = PoolManager::new();
        let shared = Rc::new(Cell::new(0));

        let boxed = ManagedBox::new_in(Rc::clone(&shared), &manager).unwrap();
        let inner = ManagedBox::into_inner(boxed);

        assert_eq!(Rc::strong_count(&shared), 2);
        assert_eq!(manager.active_allocations(), 0);

        inner.set(5);
        assert_eq!(shared.get(), 5);
    }

    #[test]
    fn as_ptr_points_into_a_pool() {
        let manager = PoolManager::new();

        let boxed = ManagedBox::new_in(42_u64, &manager).unwrap();
        let value_ptr = ManagedBox::as_ptr(&boxed);

        assert_eq!(value_ptr.as_ptr().addr() % 8, 0);
        assert_eq!(manager.pool_count(), 1);
        assert!(ptr::eq(ManagedBox::manager(&boxed), &manager));
    }

    #[test]
    fn zero_sized_value_does_not_allocate() {
        let manager = PoolManager::new();

        let boxed = ManagedBox::new_in((), &manager).unwrap();
        _ = ManagedBox::into_inner(boxed);

        assert_eq!(manager.total_allocations(), 0);
        assert_eq!(manager.total_deallocations(), 0);
    }
}
