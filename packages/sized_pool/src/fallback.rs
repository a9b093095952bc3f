use std::alloc::{GlobalAlloc, Layout};
use std::any::type_name;
use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use crate::{Error, Result};

/// Written immediately in front of every fallback allocation, recording what is needed to
/// release it again through [`GlobalAlloc::dealloc()`], which requires the layout it was allocated with.
#[derive(Clone, Copy, Debug)]
struct FallbackHeader {
    /// Layout of the whole underlying allocation, header and padding included.
    layout: Layout,

    /// Distance in bytes from the start of the underlying allocation to the pointer we
    /// handed out.
    offset: usize,
}

const HEADER_SIZE: usize = size_of::<FallbackHeader>();

/// Serves allocations that no pool can serve, using a general-purpose allocator.
///
/// Callers release fallback allocations without telling us their size, so each allocation
/// is prefixed with a [`FallbackHeader`] describing the underlying allocation.
pub(crate) struct FallbackAllocator<A> {
    allocator: A,
}

impl<A> FallbackAllocator<A>
where
    A: GlobalAlloc,
{
    pub(crate) const fn new(allocator: A) -> Self {
        Self { allocator }
    }

    #[cfg(test)]
    pub(crate) fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Allocates memory for `layout` from the general-purpose allocator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLayout`] if the layout cannot be extended with the header and
    /// [`Error::OutOfMemory`] if the general-purpose allocator fails.
    pub(crate) fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        let (outer_layout, offset) = outer_layout(layout)?;

        // SAFETY: The outer layout is never zero-sized because it always includes the header.
        let base = NonNull::new(unsafe { self.allocator.alloc(outer_layout) }).ok_or(
            Error::OutOfMemory {
                size: layout.size(),
                alignment: layout.align(),
            },
        )?;

        // SAFETY: The offset is within the allocation, as the outer layout is `offset` bytes
        // plus the caller's requested size.
        let ptr = unsafe { base.byte_add(offset) };

        let header_ptr = header_ptr(ptr);

        // SAFETY: `offset >= HEADER_SIZE`, so the header lies within the allocation, in front of
        // the memory handed to the caller. The pointer is aligned for the header because `ptr` is
        // aligned to at least the header alignment and the header size is a multiple of it.
        unsafe {
            header_ptr.write(FallbackHeader {
                layout: outer_layout,
                offset,
            });
        }

        Ok(ptr)
    }

    /// Releases memory previously returned by [`allocate()`](Self::allocate).
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr` was returned by `allocate()` on this instance
    /// and has not been released since.
    pub(crate) unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        // SAFETY: Forwarding guarantees from the caller: `allocate()` wrote a header right
        // in front of `ptr` and nothing has released the allocation since.
        let header = unsafe { header_ptr(ptr).read() };

        // SAFETY: The header records the distance back to the start of the allocation.
        let base = unsafe { ptr.byte_sub(header.offset) };

        // SAFETY: `base` was returned by our allocator for exactly this layout.
        unsafe {
            self.allocator.dealloc(base.as_ptr(), header.layout);
        }
    }
}

impl<A> fmt::Debug for FallbackAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackAllocator")
            .field("allocator", &type_name::<A>())
            .finish()
    }
}

/// Calculates the layout of the underlying allocation for a caller's `layout`, plus the offset
/// of the caller's memory within it.
fn outer_layout(layout: Layout) -> Result<(Layout, usize)> {
    let invalid = || Error::InvalidLayout {
        size: layout.size(),
        alignment: layout.align(),
    };

    let align = layout.align().max(align_of::<FallbackHeader>());

    // The caller's memory must start at a multiple of its alignment and leave room for the
    // header in front of it.
    let offset = HEADER_SIZE.next_multiple_of(align);

    let size = offset.checked_add(layout.size()).ok_or_else(invalid)?;
    let outer = Layout::from_size_align(size, align).map_err(|_layout_error| invalid())?;

    Ok((outer, offset))
}

fn header_ptr(ptr: NonNull<u8>) -> NonNull<FallbackHeader> {
    #[expect(
        clippy::cast_ptr_alignment,
        reason = "fallback allocations are aligned to at least the header alignment"
    )]
    let header_end = ptr.cast::<FallbackHeader>();

    // SAFETY: Every pointer handed out by `FallbackAllocator::allocate()` is preceded by a
    // header within the same allocation.
    unsafe { header_end.sub(1) }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::alloc::System;

    use super::*;
    use crate::test_support::{CountingAllocator, FailingAllocator};

    #[test]
    fn allocations_honor_alignment() {
        let fallback = FallbackAllocator::new(System);

        for shift in 0..=12 {
            let align = 1_usize << shift;
            let layout = Layout::from_size_align(100, align).unwrap();

            let ptr = fallback.allocate(layout).unwrap();
            assert_eq!(ptr.as_ptr().addr() % align, 0);

            unsafe {
                ptr.as_ptr().write_bytes(0xAB, 100);
                fallback.deallocate(ptr);
            }
        }
    }

    #[test]
    fn deallocate_releases_the_underlying_allocation() {
        let fallback = FallbackAllocator::new(CountingAllocator::new());

        let a = fallback.allocate(Layout::new::<[u64; 100]>()).unwrap();
        let b = fallback
            .allocate(Layout::from_size_align(5, 256).unwrap())
            .unwrap();

        assert_eq!(fallback.allocator.allocations(), 2);
        assert_eq!(fallback.allocator.outstanding_bytes(), {
            let (a_outer, _) = outer_layout(Layout::new::<[u64; 100]>()).unwrap();
            let (b_outer, _) = outer_layout(Layout::from_size_align(5, 256).unwrap()).unwrap();
            a_outer.size() + b_outer.size()
        });

        unsafe {
            fallback.deallocate(b);
            fallback.deallocate(a);
        }

        assert_eq!(fallback.allocator.deallocations(), 2);
        assert_eq!(fallback.allocator.outstanding_bytes(), 0);
    }

    #[test]
    fn allocator_failure_is_out_of_memory() {
        let fallback = FallbackAllocator::new(FailingAllocator);

        let result = fallback.allocate(Layout::from_size_align(64, 8).unwrap());

        assert_eq!(
            result,
            Err(Error::OutOfMemory {
                size: 64,
                alignment: 8
            })
        );
    }

    #[test]
    fn outer_layout_leaves_room_for_header() {
        let (outer, offset) = outer_layout(Layout::from_size_align(10, 1).unwrap()).unwrap();
        assert!(offset >= HEADER_SIZE);
        assert_eq!(outer.size(), offset + 10);

        let (outer, offset) = outer_layout(Layout::from_size_align(10, 4096).unwrap()).unwrap();
        assert_eq!(offset, 4096);
        assert_eq!(outer.align(), 4096);
    }

    #[test]
    fn outer_layout_overflow_is_invalid_layout() {
        let layout = Layout::from_size_align(isize::MAX as usize - 7, 8).unwrap();

        assert!(matches!(
            outer_layout(layout),
            Err(Error::InvalidLayout { .. })
        ));
    }
}
