use std::fmt::Debug;
use std::num::NonZero;

/// The number of blocks in every pool created by the default [`FixedCountStrategy`].
pub const DEFAULT_OBJECT_COUNT: NonZero<usize> = NonZero::new(256).unwrap();

/// Decides the dimensions of the pool created for a size class.
///
/// A strategy is consulted once per size class, when the pool for that class is first needed.
/// Replacing the strategy of a [`PoolManager`][crate::PoolManager] therefore only affects pools
/// that have not been created yet.
///
/// Implementations must be pure: the same block size must always produce the same answer, and
/// [`pool_byte_size()`](Self::pool_byte_size) must equal `block_size * object_count`. The
/// provided implementation of `pool_byte_size()` guarantees this, so most strategies only
/// implement [`object_count()`](Self::object_count).
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use sized_pool::{CapacityStrategy, PoolManager};
///
/// /// Gives small blocks bigger pools than large blocks.
/// #[derive(Debug)]
/// struct SmallFavoring;
///
/// impl CapacityStrategy for SmallFavoring {
///     fn object_count(&self, block_size: usize) -> NonZero<usize> {
///         if block_size <= 64 {
///             NonZero::new(4096).unwrap()
///         } else {
///             NonZero::new(64).unwrap()
///         }
///     }
/// }
///
/// let manager = PoolManager::builder().strategy(SmallFavoring).build();
/// ```
pub trait CapacityStrategy: Debug + Send + Sync {
    /// Returns the number of blocks in the pool for blocks of `block_size` bytes.
    fn object_count(&self, block_size: usize) -> NonZero<usize>;

    /// Returns the size in bytes of the arena backing the pool for blocks of `block_size` bytes.
    ///
    /// Saturates at `usize::MAX` if the product overflows. The memory manager treats such a
    /// pool as impossible to allocate.
    fn pool_byte_size(&self, block_size: usize) -> usize {
        block_size.saturating_mul(self.object_count(block_size).get())
    }
}

/// Creates pools with the same number of blocks regardless of size class.
///
/// The default instance uses [`DEFAULT_OBJECT_COUNT`] (256) blocks per pool.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use sized_pool::{CapacityStrategy, FixedCountStrategy};
///
/// let strategy = FixedCountStrategy::new(NonZero::new(16).unwrap());
///
/// assert_eq!(strategy.object_count(64).get(), 16);
/// assert_eq!(strategy.pool_byte_size(64), 1024);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FixedCountStrategy {
    object_count: NonZero<usize>,
}

impl FixedCountStrategy {
    /// Creates a strategy that gives every pool `object_count` blocks.
    #[must_use]
    pub const fn new(object_count: NonZero<usize>) -> Self {
        Self { object_count }
    }
}

impl Default for FixedCountStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_OBJECT_COUNT)
    }
}

impl CapacityStrategy for FixedCountStrategy {
    fn object_count(&self, _block_size: usize) -> NonZero<usize> {
        self.object_count
    }
}

/// Sizes every pool to fit within a byte budget, so large size classes get fewer blocks.
///
/// Each pool receives `budget / block_size` blocks, but never less than one block. Size classes
/// larger than the budget therefore get pools of exactly one block.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use sized_pool::{ByteBudgetStrategy, CapacityStrategy};
///
/// let strategy = ByteBudgetStrategy::new(NonZero::new(64 * 1024).unwrap());
///
/// assert_eq!(strategy.object_count(16).get(), 4096);
/// assert_eq!(strategy.object_count(1024 * 1024).get(), 1);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ByteBudgetStrategy {
    budget: NonZero<usize>,
}

impl ByteBudgetStrategy {
    /// Creates a strategy that targets `budget` bytes per pool.
    #[must_use]
    pub const fn new(budget: NonZero<usize>) -> Self {
        Self { budget }
    }
}

impl CapacityStrategy for ByteBudgetStrategy {
    fn object_count(&self, block_size: usize) -> NonZero<usize> {
        self.budget
            .get()
            .checked_div(block_size)
            .and_then(NonZero::new)
            .unwrap_or(NonZero::<usize>::MIN)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(FixedCountStrategy: Send, Sync, Debug, Copy);
    assert_impl_all!(ByteBudgetStrategy: Send, Sync, Debug, Copy);

    #[test]
    fn default_strategy_uses_256_objects_for_every_class() {
        let strategy = FixedCountStrategy::default();

        for shift in 0..=20 {
            let block_size = 1_usize << shift;

            assert_eq!(strategy.object_count(block_size).get(), 256);
            assert_eq!(strategy.pool_byte_size(block_size), block_size * 256);
        }
    }

    #[test]
    fn pool_byte_size_saturates_on_overflow() {
        let strategy = FixedCountStrategy::new(NonZero::new(usize::MAX).unwrap());

        assert_eq!(strategy.pool_byte_size(2), usize::MAX);
    }

    #[test]
    fn byte_budget_divides_budget_by_block_size() {
        let strategy = ByteBudgetStrategy::new(NonZero::new(4096).unwrap());

        assert_eq!(strategy.object_count(1).get(), 4096);
        assert_eq!(strategy.object_count(64).get(), 64);
        assert_eq!(strategy.object_count(4096).get(), 1);
        assert_eq!(strategy.pool_byte_size(64), 4096);
    }

    #[test]
    fn byte_budget_never_yields_empty_pools() {
        let strategy = ByteBudgetStrategy::new(NonZero::new(100).unwrap());

        assert_eq!(strategy.object_count(128).get(), 1);
        assert_eq!(strategy.object_count(1 << 20).get(), 1);
        assert_eq!(strategy.pool_byte_size(128), 128);
    }

    #[test]
    fn trait_objects_are_usable() {
        let strategies: Vec<Box<dyn CapacityStrategy>> = vec![
            Box::new(FixedCountStrategy::default()),
            Box::new(ByteBudgetStrategy::new(NonZero::new(1024).unwrap())),
        ];

        let counts = strategies
            .iter()
            .map(|s| s.object_count(8).get())
            .collect::<Vec<_>>();

        assert_eq!(counts, vec![256, 128]);
    }
}
