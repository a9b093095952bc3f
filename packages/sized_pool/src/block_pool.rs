use std::alloc::{Layout, alloc, dealloc};
use std::fmt;
use std::mem::{align_of, size_of};
use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{self, AtomicUsize};

use num_integer::Integer;

use crate::{ERR_POISONED_LOCK, Error, PoolStats, Result, SizeClass};

/// A fixed-capacity pool of equally sized memory blocks carved from one contiguous arena.
///
/// The pool owns its arena for its entire lifetime. It never grows: once every block has been
/// handed out, [`allocate()`](Self::allocate) returns `None` until a block is returned via
/// [`deallocate()`](Self::deallocate).
///
/// Every block is aligned to the block size, which is always a power of two. The arena itself
/// is never read or written by the pool, so the contents of a block are whatever the previous
/// user left there (or uninitialized for blocks never used before).
///
/// # Thread safety
///
/// The pool is thread-safe ([`Send`] + [`Sync`]). The free list is protected by a mutex that is
/// only held while a block is taken from or returned to it. Testing whether a pointer belongs to
/// the pool via [`contains()`](Self::contains) does not take the lock, as the arena bounds never
/// change after construction.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use sized_pool::BlockPool;
///
/// let pool = BlockPool::new(NonZero::new(64).unwrap(), NonZero::new(2).unwrap()).unwrap();
///
/// let a = pool.allocate().unwrap();
/// let b = pool.allocate().unwrap();
/// assert!(pool.allocate().is_none());
///
/// assert!(pool.contains(a));
/// assert!(pool.deallocate(a));
/// assert!(pool.deallocate(b));
/// assert_eq!(pool.allocated(), 0);
/// ```
pub struct BlockPool {
    /// Size of every block in bytes. Always a power of two.
    block_size: NonZero<usize>,

    /// Number of blocks in the arena.
    capacity: NonZero<usize>,

    /// Layout the arena was allocated with, required to release it again.
    arena_layout: Layout,

    /// First byte of the arena. Immutable after construction.
    arena_start: NonNull<u8>,

    free_list: Mutex<FreeList>,

    /// Number of blocks currently handed out. Only written while holding the free list lock,
    /// so it always equals `capacity - free_list.len()` at the moment of writing.
    allocated: AtomicUsize,

    total_allocations: AtomicUsize,
    total_deallocations: AtomicUsize,
}

/// The mutable state of a [`BlockPool`], guarded by its mutex.
#[derive(Debug)]
struct FreeList {
    /// Stack of indexes of vacant blocks. The block with index `i` starts at
    /// `arena_start + i * block_size`. Never reallocates, as it can hold every block.
    vacant: Vec<usize>,

    /// One bit per block, set while the block is handed out. A block is in `vacant` if and only
    /// if its bit is clear, which lets us reject repeated release of the same block.
    outstanding: Vec<BitBlock>,
}

/// The type used for storage blocks of the outstanding bitset.
type BitBlock = u64;

/// Number of bits in each storage block.
const BITS_PER_BLOCK: usize = BitBlock::BITS as usize;

impl FreeList {
    /// Creates the bookkeeping for `capacity` vacant blocks.
    ///
    /// The memory is reserved fallibly, so a pool whose bookkeeping does not fit in memory is
    /// reported as [`Error::OutOfMemory`] instead of aborting the process.
    fn new(capacity: usize) -> Result<Self> {
        let out_of_memory = || Error::OutOfMemory {
            size: capacity.saturating_mul(size_of::<usize>()),
            alignment: align_of::<usize>(),
        };

        let mut vacant = Vec::new();
        vacant
            .try_reserve_exact(capacity)
            .map_err(|_reserve_error| out_of_memory())?;

        // Reversed so the stack hands out the lowest address first.
        vacant.extend((0..capacity).rev());

        let len_blocks = capacity.div_ceil(BITS_PER_BLOCK);

        let mut outstanding = Vec::new();
        outstanding
            .try_reserve_exact(len_blocks)
            .map_err(|_reserve_error| out_of_memory())?;
        outstanding.resize(len_blocks, 0);

        Ok(Self {
            vacant,
            outstanding,
        })
    }

    fn is_outstanding(&self, index: usize) -> bool {
        let (block_index, index_in_block) = index.div_rem(&BITS_PER_BLOCK);

        let block = self
            .outstanding
            .get(block_index)
            .expect("only indexes of blocks in the arena are ever looked up");

        (*block & (1 << index_in_block)) != 0
    }

    fn set_outstanding(&mut self, index: usize, outstanding: bool) {
        let (block_index, index_in_block) = index.div_rem(&BITS_PER_BLOCK);

        let block = self
            .outstanding
            .get_mut(block_index)
            .expect("only indexes of blocks in the arena are ever updated");

        if outstanding {
            *block |= 1 << index_in_block;
        } else {
            *block &= !(1 << index_in_block);
        }
    }
}

impl BlockPool {
    /// Creates a pool of `capacity` blocks of `block_size` bytes each.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLayout`] if the arena size overflows and [`Error::OutOfMemory`]
    /// if the system allocator cannot provide the arena or the bookkeeping for its blocks.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is not a power of two.
    pub fn new(block_size: NonZero<usize>, capacity: NonZero<usize>) -> Result<Self> {
        assert!(
            block_size.is_power_of_two(),
            "block size {block_size} is not a power of two"
        );

        let arena_size = block_size
            .get()
            .checked_mul(capacity.get())
            .ok_or(Error::InvalidLayout {
                size: usize::MAX,
                alignment: block_size.get(),
            })?;

        let arena_layout = Layout::from_size_align(arena_size, block_size.get()).map_err(
            |_layout_error| Error::InvalidLayout {
                size: arena_size,
                alignment: block_size.get(),
            },
        )?;

        // Reserved before the arena, so that nothing needs to be released if this fails.
        let free_list = FreeList::new(capacity.get())?;

        // SAFETY: The layout has a non-zero size because both factors of the size are non-zero.
        let arena_start = NonNull::new(unsafe { alloc(arena_layout) }).ok_or(Error::OutOfMemory {
            size: arena_size,
            alignment: block_size.get(),
        })?;

        Ok(Self {
            block_size,
            capacity,
            arena_layout,
            arena_start,
            free_list: Mutex::new(free_list),
            allocated: AtomicUsize::new(0),
            total_allocations: AtomicUsize::new(0),
            total_deallocations: AtomicUsize::new(0),
        })
    }

    /// The size in bytes of every block in the pool.
    #[must_use]
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size.get()
    }

    /// The size class the pool serves.
    #[must_use]
    #[inline]
    pub fn size_class(&self) -> SizeClass {
        SizeClass::new(self.block_size.trailing_zeros())
    }

    /// The total number of blocks in the pool, whether handed out or not.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// The number of blocks currently handed out.
    #[must_use]
    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated.load(atomic::Ordering::Relaxed)
    }

    /// The number of blocks currently available for allocation.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free_list.lock().expect(ERR_POISONED_LOCK).vacant.len()
    }

    /// The number of blocks handed out over the lifetime of the pool.
    #[must_use]
    #[inline]
    pub fn total_allocations(&self) -> usize {
        self.total_allocations.load(atomic::Ordering::Relaxed)
    }

    /// The number of blocks returned over the lifetime of the pool.
    #[must_use]
    #[inline]
    pub fn total_deallocations(&self) -> usize {
        self.total_deallocations.load(atomic::Ordering::Relaxed)
    }

    /// Takes a snapshot of the pool's occupancy counters.
    ///
    /// The individual counters are read one after another, so under concurrent traffic they may
    /// not describe the same instant.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats::new(
            self.size_class(),
            self.capacity(),
            self.allocated(),
            self.total_allocations(),
            self.total_deallocations(),
        )
    }

    /// Hands out one vacant block, or returns `None` if every block is already handed out.
    ///
    /// Never blocks waiting for a block to be returned and never grows the pool.
    #[must_use]
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        let index = {
            let mut free_list = self.free_list.lock().expect(ERR_POISONED_LOCK);

            let index = free_list.vacant.pop()?;

            debug_assert!(
                !free_list.is_outstanding(index),
                "block {index} was vacant and outstanding"
            );
            free_list.set_outstanding(index, true);

            // Cannot underflow because the free list never holds more than `capacity` entries.
            self.allocated.store(
                self.capacity.get().wrapping_sub(free_list.vacant.len()),
                atomic::Ordering::Relaxed,
            );

            index
        };

        self.total_allocations.fetch_add(1, atomic::Ordering::Relaxed);

        Some(self.block_ptr(index))
    }

    /// Returns a block to the pool.
    ///
    /// Returns `false` without changing anything if `ptr` does not point to the start of a block
    /// of this pool, or if that block is not currently handed out (for example, because it was
    /// already returned). The pool never dereferences `ptr`, so calling this with an arbitrary
    /// pointer is safe.
    pub fn deallocate(&self, ptr: NonNull<u8>) -> bool {
        let Some(index) = self.block_index(ptr) else {
            return false;
        };

        {
            let mut free_list = self.free_list.lock().expect(ERR_POISONED_LOCK);

            if !free_list.is_outstanding(index) {
                return false;
            }

            free_list.set_outstanding(index, false);
            free_list.vacant.push(index);

            // Cannot underflow because the free list never holds more than `capacity` entries.
            self.allocated.store(
                self.capacity.get().wrapping_sub(free_list.vacant.len()),
                atomic::Ordering::Relaxed,
            );
        }

        self.total_deallocations.fetch_add(1, atomic::Ordering::Relaxed);

        true
    }

    /// Whether `ptr` points anywhere inside the arena of this pool.
    ///
    /// This is a pure address range test and does not take the pool's lock.
    #[must_use]
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.arena_offset(ptr).is_some()
    }

    /// The byte offset of `ptr` from the start of the arena, if it lies within the arena.
    fn arena_offset(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = ptr
            .as_ptr()
            .addr()
            .checked_sub(self.arena_start.as_ptr().addr())?;

        (offset < self.arena_layout.size()).then_some(offset)
    }

    /// The index of the block starting at `ptr`, if `ptr` is the start of a block of this pool.
    fn block_index(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = self.arena_offset(ptr)?;

        // Block size is a power of two, so the mask selects the offset within a block.
        let within_block = offset & self.block_size.get().wrapping_sub(1);

        (within_block == 0).then(|| offset >> self.block_size.trailing_zeros())
    }

    fn block_ptr(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.capacity.get());

        // Cannot overflow because that would imply the arena extends beyond virtual memory.
        let offset = index.wrapping_mul(self.block_size.get());

        // SAFETY: The index is less than the capacity, so the offset stays within the arena
        // that we allocated in `new()` and still own.
        unsafe { self.arena_start.byte_add(offset) }
    }
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPool")
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("arena_start", &self.arena_start)
            .field("allocated", &self.allocated())
            .field("total_allocations", &self.total_allocations())
            .field("total_deallocations", &self.total_deallocations())
            .finish_non_exhaustive()
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        // SAFETY: We allocated the arena with this layout in `new()` and release it exactly once.
        // Any blocks still handed out become dangling, which the owner of the pool is
        // responsible for (see `DropPolicy`).
        unsafe {
            dealloc(self.arena_start.as_ptr(), self.arena_layout);
        }
    }
}

// SAFETY: The arena pointer is owned by the pool and is only used to calculate block addresses.
// The pool never reads or writes through it, and all mutable state is behind a mutex or atomics.
unsafe impl Send for BlockPool {}

// SAFETY: See above. Shared access only reads immutable arena bounds without synchronization.
unsafe impl Sync for BlockPool {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(BlockPool: Send, Sync, fmt::Debug);

    fn pool(block_size: usize, capacity: usize) -> BlockPool {
        BlockPool::new(
            NonZero::new(block_size).unwrap(),
            NonZero::new(capacity).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn smoke_test() {
        let pool = pool(16, 3);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();

        unsafe {
            a.cast::<u64>().write(1);
            b.cast::<u64>().write(2);
            c.cast::<u64>().write(3);

            assert_eq!(a.cast::<u64>().read(), 1);
            assert_eq!(b.cast::<u64>().read(), 2);
            assert_eq!(c.cast::<u64>().read(), 3);
        }

        assert_eq!(pool.allocated(), 3);
        assert_eq!(pool.available(), 0);

        assert!(pool.deallocate(b));
        assert_eq!(pool.allocated(), 2);

        // The block just returned is the only one available, so it is handed out again.
        assert_eq!(pool.allocate(), Some(b));

        assert!(pool.deallocate(a));
        assert!(pool.deallocate(b));
        assert!(pool.deallocate(c));
        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let pool = pool(8, 2);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();

        assert!(pool.allocate().is_none());
        assert!(pool.allocate().is_none());
        assert_eq!(pool.total_allocations(), 2);

        assert!(pool.deallocate(a));
        assert!(pool.allocate().is_some());

        _ = b;
    }

    #[test]
    fn hands_out_lowest_address_first() {
        let pool = pool(32, 4);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();

        assert_eq!(b.as_ptr().addr() - a.as_ptr().addr(), 32);
    }

    #[test]
    fn blocks_are_aligned_to_block_size() {
        for shift in 0..=12 {
            let block_size = 1_usize << shift;
            let pool = pool(block_size, 8);

            while let Some(block) = pool.allocate() {
                assert_eq!(block.as_ptr().addr() % block_size, 0);
            }
        }
    }

    #[test]
    fn contains_checks_arena_bounds() {
        let pool = pool(16, 4);
        let first = pool.allocate().unwrap();

        assert!(pool.contains(first));

        // Last byte of the arena is inside, one past the end is not.
        let last_byte = unsafe { first.byte_add(16 * 4 - 1) };
        let past_end = unsafe { first.byte_add(16 * 4) };
        assert!(pool.contains(last_byte));
        assert!(!pool.contains(past_end));

        let outside = Box::new(0_u8);
        assert!(!pool.contains(NonNull::from(&*outside)));
    }

    #[test]
    fn deallocate_rejects_foreign_pointer() {
        let pool = pool(16, 4);
        let _block = pool.allocate().unwrap();

        let mut foreign = [0_u8; 16];
        assert!(!pool.deallocate(NonNull::from(&mut foreign).cast()));

        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.total_deallocations(), 0);
    }

    #[test]
    fn deallocate_rejects_misaligned_pointer() {
        let pool = pool(16, 4);
        let block = pool.allocate().unwrap();

        let inside_block = unsafe { block.byte_add(3) };
        assert!(pool.contains(inside_block));
        assert!(!pool.deallocate(inside_block));

        assert_eq!(pool.allocated(), 1);
        assert!(pool.deallocate(block));
    }

    #[test]
    fn deallocate_rejects_double_free() {
        let pool = pool(16, 4);
        let block = pool.allocate().unwrap();

        assert!(pool.deallocate(block));
        assert!(!pool.deallocate(block));

        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.total_deallocations(), 1);

        // The free list must not contain the block twice.
        let blocks = std::iter::from_fn(|| pool.allocate()).collect::<HashSet<_>>();
        assert_eq!(blocks.len(), 4);
    }

    #[test]
    fn deallocate_rejects_never_allocated_block() {
        let pool = pool(16, 4);
        let first = pool.allocate().unwrap();

        // The second block exists in the arena but was never handed out.
        let second = unsafe { first.byte_add(16) };
        assert!(!pool.deallocate(second));
    }

    #[test]
    fn counters_follow_traffic() {
        let pool = pool(64, 8);

        for _ in 0..100 {
            let block = pool.allocate().unwrap();
            assert!(pool.deallocate(block));
        }

        assert_eq!(pool.total_allocations(), 100);
        assert_eq!(pool.total_deallocations(), 100);
        assert_eq!(pool.allocated(), 0);

        let stats = pool.stats();
        assert_eq!(stats.size_class(), SizeClass::new(6));
        assert_eq!(stats.capacity(), 8);
        assert_eq!(stats.available(), 8);
    }

    #[test]
    fn allocated_plus_available_is_capacity() {
        let pool = pool(8, 16);
        let mut held = Vec::new();

        for round in 0..16 {
            held.push(pool.allocate().unwrap());
            assert_eq!(pool.allocated() + pool.available(), 16, "round {round}");
        }

        for block in held {
            assert!(pool.deallocate(block));
            assert_eq!(pool.allocated() + pool.available(), 16);
        }
    }

    #[test]
    fn concurrent_allocations_never_share_a_block() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 32;

        let pool = pool(16, THREADS * PER_THREAD);

        let blocks = thread::scope(|s| {
            let handles = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        (0..PER_THREAD)
                            .map(|_| pool.allocate().unwrap().as_ptr().addr())
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        let unique = blocks.iter().copied().collect::<HashSet<_>>();
        assert_eq!(unique.len(), THREADS * PER_THREAD);
        assert!(pool.allocate().is_none());
    }

    #[test]
    fn arena_overflow_is_invalid_layout() {
        let result = BlockPool::new(
            NonZero::new(1 << 20).unwrap(),
            NonZero::new(usize::MAX).unwrap(),
        );

        assert!(matches!(result, Err(Error::InvalidLayout { .. })));
    }

    #[test]
    fn bookkeeping_that_does_not_fit_is_out_of_memory() {
        // The arena layout is valid, but one index per block does not fit in the address space.
        let capacity = usize::MAX >> 3;

        let result = BlockPool::new(NonZero::new(1).unwrap(), NonZero::new(capacity).unwrap());

        assert!(matches!(result, Err(Error::OutOfMemory { .. })));
    }

    #[test]
    fn free_list_tracks_blocks_across_bitset_words() {
        // Spans three storage blocks, the last one partially used.
        let mut free_list = FreeList::new(130).unwrap();

        assert_eq!(free_list.vacant.len(), 130);
        assert_eq!(free_list.outstanding.len(), 3);

        for index in [0, 63, 64, 129] {
            assert!(!free_list.is_outstanding(index));
            free_list.set_outstanding(index, true);
            assert!(free_list.is_outstanding(index));
        }

        assert!(!free_list.is_outstanding(1));
        assert!(!free_list.is_outstanding(65));
        assert!(!free_list.is_outstanding(128));

        free_list.set_outstanding(64, false);
        assert!(!free_list.is_outstanding(64));
        assert!(free_list.is_outstanding(63));
        assert!(free_list.is_outstanding(129));
    }

    #[test]
    fn free_list_that_does_not_fit_is_out_of_memory() {
        assert!(matches!(
            FreeList::new(usize::MAX),
            Err(Error::OutOfMemory { .. })
        ));
    }

    #[test]
    #[should_panic]
    fn non_power_of_two_block_size_panics() {
        _ = pool(24, 4);
    }
}
