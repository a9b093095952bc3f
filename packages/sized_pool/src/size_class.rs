use std::fmt;

/// The largest size class served from pools by default: blocks of 2^20 bytes (1 MiB).
pub const DEFAULT_MAX_SIZE_CLASS: u32 = 20;

/// The largest size class a [`PoolManager`][crate::PoolManager] may be configured to pool.
///
/// A single pool of the default strategy at this class already spans 256 GiB of address space.
pub const MAX_SIZE_CLASS_LIMIT: u32 = 30;

/// Rounds a requested byte count up to the block size of the size class that serves it.
///
/// Both 0 and 1 round to 1. Every other value rounds up to the next power of two. Values above
/// the largest power of two representable in `usize` saturate at that power of two.
///
/// # Examples
///
/// ```
/// use sized_pool::size_category;
///
/// assert_eq!(size_category(0), 1);
/// assert_eq!(size_category(1), 1);
/// assert_eq!(size_category(5), 8);
/// assert_eq!(size_category(1024), 1024);
/// ```
#[must_use]
#[inline]
pub fn size_category(size: usize) -> usize {
    size.checked_next_power_of_two()
        .unwrap_or(1 << (usize::BITS - 1))
}

/// Identifies one of the power-of-two block sizes a memory manager pools.
///
/// Size class `n` serves blocks of exactly `2^n` bytes.
///
/// # Examples
///
/// ```
/// use sized_pool::SizeClass;
///
/// let class = SizeClass::for_size(10);
/// assert_eq!(class.index(), 4);
/// assert_eq!(class.block_size(), 16);
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SizeClass {
    index: u32,
}

impl SizeClass {
    /// Creates the size class with the given index, serving blocks of `2^index` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `2^index` is not representable in `usize`.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        assert!(
            index < usize::BITS,
            "size class index must be smaller than the pointer width"
        );

        Self { index }
    }

    /// Returns the smallest size class whose block size is at least `size` bytes.
    ///
    /// A zero-byte size maps to the smallest size class, matching [`size_category()`].
    #[must_use]
    #[inline]
    pub fn for_size(size: usize) -> Self {
        Self {
            index: size_category(size).trailing_zeros(),
        }
    }

    /// The index of the size class, which is also the base-2 logarithm of its block size.
    #[must_use]
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// The size in bytes of every block in this size class.
    #[must_use]
    #[inline]
    pub const fn block_size(self) -> usize {
        1 << self.index
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.block_size())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn size_category_rounds_up_to_power_of_two() {
        assert_eq!(size_category(0), 1);
        assert_eq!(size_category(1), 1);
        assert_eq!(size_category(2), 2);
        assert_eq!(size_category(3), 4);
        assert_eq!(size_category(5), 8);
        assert_eq!(size_category(1000), 1024);
        assert_eq!(size_category(1024), 1024);
        assert_eq!(size_category(1025), 2048);
    }

    #[test]
    fn size_category_saturates() {
        let largest = 1_usize << (usize::BITS - 1);

        assert_eq!(size_category(largest), largest);
        assert_eq!(size_category(usize::MAX), largest);
    }

    #[test]
    fn for_size_picks_smallest_sufficient_class() {
        for size in 1..=4096_usize {
            let class = SizeClass::for_size(size);

            assert!(class.block_size() >= size);
            assert!(class.index() == 0 || class.block_size() / 2 < size);
        }
    }

    #[test]
    fn zero_and_one_share_the_smallest_class() {
        assert_eq!(SizeClass::for_size(0), SizeClass::new(0));
        assert_eq!(SizeClass::for_size(1), SizeClass::new(0));
    }

    #[test]
    fn default_max_class_is_one_mebibyte() {
        assert_eq!(SizeClass::new(DEFAULT_MAX_SIZE_CLASS).block_size(), 1024 * 1024);
    }

    #[test]
    #[should_panic]
    fn new_rejects_index_beyond_pointer_width() {
        _ = SizeClass::new(usize::BITS);
    }

    #[test]
    fn display_shows_block_size() {
        assert_eq!(SizeClass::new(11).to_string(), "2048B");
    }
}
