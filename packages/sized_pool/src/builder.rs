use std::alloc::{GlobalAlloc, System};
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::{
    CapacityStrategy, DEFAULT_MAX_SIZE_CLASS, DropPolicy, FixedCountStrategy,
    MAX_SIZE_CLASS_LIMIT, PoolManager, SizeClass,
};

/// Builder for creating an instance of [`PoolManager`].
///
/// Every setting is optional. Without any configuration, the built manager pools size classes
/// from 1 byte up to [`DEFAULT_MAX_SIZE_CLASS`] (1 MiB) with 256 blocks per pool, and serves
/// everything else from the system allocator.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use sized_pool::{FixedCountStrategy, PoolManager};
///
/// let manager = PoolManager::builder()
///     .max_size_class(12)
///     .strategy(FixedCountStrategy::new(NonZero::new(1024).unwrap()))
///     .build();
///
/// assert_eq!(manager.max_supported_size(), 4096);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing configuration to happen on different threads than where the manager is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[derive(Debug)]
#[must_use]
pub struct PoolManagerBuilder<A = System> {
    max_size_class: SizeClass,
    strategy: Arc<dyn CapacityStrategy>,
    drop_policy: DropPolicy,
    fallback: A,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl PoolManagerBuilder {
    pub(crate) fn new() -> Self {
        Self {
            max_size_class: SizeClass::new(DEFAULT_MAX_SIZE_CLASS),
            strategy: Arc::new(FixedCountStrategy::default()),
            drop_policy: DropPolicy::default(),
            fallback: System,
            _not_sync: PhantomData,
        }
    }
}

impl<A> PoolManagerBuilder<A>
where
    A: GlobalAlloc,
{
    /// Sets the largest size class served from pools. Requests for blocks larger than
    /// `2^index` bytes always go to the fallback allocator.
    ///
    /// # Panics
    ///
    /// Panics if `index` is greater than [`MAX_SIZE_CLASS_LIMIT`].
    pub fn max_size_class(mut self, index: u32) -> Self {
        assert!(
            index <= MAX_SIZE_CLASS_LIMIT,
            "max size class {index} exceeds the limit of {MAX_SIZE_CLASS_LIMIT}"
        );

        self.max_size_class = SizeClass::new(index);
        self
    }

    /// Sets the strategy that decides how many blocks each pool gets.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::num::NonZero;
    ///
    /// use sized_pool::{ByteBudgetStrategy, PoolManager};
    ///
    /// let manager = PoolManager::builder()
    ///     .strategy(ByteBudgetStrategy::new(NonZero::new(64 * 1024).unwrap()))
    ///     .build();
    /// ```
    pub fn strategy(mut self, strategy: impl CapacityStrategy + 'static) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    /// Sets a strategy that may also be shared with other managers or inspected by the caller.
    pub fn shared_strategy(mut self, strategy: Arc<dyn CapacityStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the manager. This governs how to treat
    /// active allocations when the manager is dropped.
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Sets the general-purpose allocator used for requests that no pool can serve.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::alloc::System;
    ///
    /// use sized_pool::PoolManager;
    ///
    /// let manager = PoolManager::builder().fallback(System).build();
    /// ```
    pub fn fallback<B>(self, allocator: B) -> PoolManagerBuilder<B>
    where
        B: GlobalAlloc,
    {
        PoolManagerBuilder {
            max_size_class: self.max_size_class,
            strategy: self.strategy,
            drop_policy: self.drop_policy,
            fallback: allocator,
            _not_sync: PhantomData,
        }
    }

    /// Builds the memory manager with the specified configuration.
    ///
    /// No pools are created yet. Each pool is created when its size class is first requested.
    #[must_use]
    pub fn build(self) -> PoolManager<A> {
        PoolManager::new_inner(
            self.max_size_class,
            self.strategy,
            self.drop_policy,
            self.fallback,
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::num::NonZero;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::ByteBudgetStrategy;

    assert_impl_all!(PoolManagerBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(PoolManagerBuilder: Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = PoolManagerBuilder::new();

        assert_eq!(builder.max_size_class, SizeClass::new(DEFAULT_MAX_SIZE_CLASS));
        assert_eq!(builder.drop_policy, DropPolicy::default());
        assert_eq!(builder.strategy.object_count(8).get(), 256);
    }

    #[test]
    fn max_size_class_sets_limit() {
        let manager = PoolManagerBuilder::new().max_size_class(10).build();

        assert_eq!(manager.max_size_class(), SizeClass::new(10));
        assert_eq!(manager.max_supported_size(), 1024);
    }

    #[test]
    fn max_size_class_zero_pools_single_bytes_only() {
        let manager = PoolManagerBuilder::new().max_size_class(0).build();

        assert_eq!(manager.max_supported_size(), 1);
    }

    #[test]
    #[should_panic]
    fn max_size_class_beyond_limit_panics() {
        _ = PoolManagerBuilder::new().max_size_class(MAX_SIZE_CLASS_LIMIT + 1);
    }

    #[test]
    fn strategy_is_used_by_built_manager() {
        let strategy = ByteBudgetStrategy::new(NonZero::new(1024).unwrap());
        let manager = PoolManagerBuilder::new().strategy(strategy).build();

        assert_eq!(manager.strategy().object_count(16).get(), 64);
    }

    #[test]
    fn shared_strategy_is_the_same_instance() {
        let strategy: Arc<dyn CapacityStrategy> = Arc::new(FixedCountStrategy::default());
        let manager = PoolManagerBuilder::new()
            .shared_strategy(Arc::clone(&strategy))
            .build();

        assert!(Arc::ptr_eq(&manager.strategy(), &strategy));
    }

    #[test]
    fn drop_policy_sets_policy_correctly() {
        let builder =
            PoolManagerBuilder::new().drop_policy(DropPolicy::MustNotDropActiveAllocations);
        assert_eq!(builder.drop_policy, DropPolicy::MustNotDropActiveAllocations);

        let builder = PoolManagerBuilder::new().drop_policy(DropPolicy::MayDropActiveAllocations);
        assert_eq!(builder.drop_policy, DropPolicy::MayDropActiveAllocations);
    }

    #[test]
    fn fallback_keeps_other_settings() {
        let builder = PoolManagerBuilder::new()
            .max_size_class(5)
            .drop_policy(DropPolicy::MustNotDropActiveAllocations)
            .fallback(crate::test_support::CountingAllocator::new());

        assert_eq!(builder.max_size_class, SizeClass::new(5));
        assert_eq!(builder.drop_policy, DropPolicy::MustNotDropActiveAllocations);
    }
}
