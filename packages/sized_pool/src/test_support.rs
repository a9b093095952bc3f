//! Allocators shared by the unit tests of this crate.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr;
use std::sync::atomic::{self, AtomicUsize};

/// Forwards to the system allocator while counting what passes through.
#[derive(Debug, Default)]
pub(crate) struct CountingAllocator {
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
    outstanding_bytes: AtomicUsize,
}

impl CountingAllocator {
    pub(crate) const fn new() -> Self {
        Self {
            allocations: AtomicUsize::new(0),
            deallocations: AtomicUsize::new(0),
            outstanding_bytes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn allocations(&self) -> usize {
        self.allocations.load(atomic::Ordering::Relaxed)
    }

    pub(crate) fn deallocations(&self) -> usize {
        self.deallocations.load(atomic::Ordering::Relaxed)
    }

    pub(crate) fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes.load(atomic::Ordering::Relaxed)
    }
}

// SAFETY: Forwards every call to the system allocator unchanged.
unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocations.fetch_add(1, atomic::Ordering::Relaxed);
        self.outstanding_bytes.fetch_add(layout.size(), atomic::Ordering::Relaxed);

        // SAFETY: Forwarding the caller's guarantees.
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.deallocations.fetch_add(1, atomic::Ordering::Relaxed);
        self.outstanding_bytes.fetch_sub(layout.size(), atomic::Ordering::Relaxed);

        // SAFETY: Forwarding the caller's guarantees.
        unsafe { System.dealloc(ptr, layout) }
    }
}

/// An allocator that never has any memory to give.
#[derive(Debug, Default)]
pub(crate) struct FailingAllocator;

// SAFETY: Never hands out memory, so there is nothing to release.
unsafe impl GlobalAlloc for FailingAllocator {
    unsafe fn alloc(&self, _layout: Layout) -> *mut u8 {
        ptr::null_mut()
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
        unreachable!("FailingAllocator never allocates");
    }
}
