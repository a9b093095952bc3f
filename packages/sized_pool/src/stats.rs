use std::fmt;

use crate::SizeClass;

/// A snapshot of the occupancy counters of one block pool.
///
/// Obtained from [`BlockPool::stats()`][crate::BlockPool::stats] or
/// [`PoolManager::pool_stats()`][crate::PoolManager::pool_stats].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolStats {
    size_class: SizeClass,
    capacity: usize,
    allocated: usize,
    total_allocations: usize,
    total_deallocations: usize,
}

impl PoolStats {
    pub(crate) fn new(
        size_class: SizeClass,
        capacity: usize,
        allocated: usize,
        total_allocations: usize,
        total_deallocations: usize,
    ) -> Self {
        Self {
            size_class,
            capacity,
            allocated,
            total_allocations,
            total_deallocations,
        }
    }

    /// The size class served by the pool.
    #[must_use]
    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }

    /// The size in bytes of every block in the pool.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.size_class.block_size()
    }

    /// The total number of blocks in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of blocks handed out when the snapshot was taken.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// The number of blocks available when the snapshot was taken.
    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.allocated)
    }

    /// The number of blocks handed out over the lifetime of the pool.
    #[must_use]
    pub fn total_allocations(&self) -> usize {
        self.total_allocations
    }

    /// The number of blocks returned over the lifetime of the pool.
    #[must_use]
    pub fn total_deallocations(&self) -> usize {
        self.total_deallocations
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} blocks: {}/{} allocated, {} total allocations, {} total deallocations",
            self.size_class,
            self.allocated,
            self.capacity,
            self.total_allocations,
            self.total_deallocations
        )
    }
}

/// A snapshot of the counters of a [`PoolManager`][crate::PoolManager] and all of its pools.
///
/// The counters are read one after another without a global lock, so under concurrent traffic
/// they are not guaranteed to be consistent with each other.
///
/// The [`Display`][fmt::Display] implementation renders a human-readable report.
///
/// # Examples
///
/// ```
/// use sized_pool::PoolManager;
///
/// let manager = PoolManager::new();
/// let ptr = manager.allocate_bytes(100).unwrap();
///
/// let stats = manager.stats();
/// assert_eq!(stats.active_allocations(), 1);
/// assert_eq!(stats.pools().len(), 1);
/// println!("{stats}");
///
/// // SAFETY: The pointer was allocated by this manager and is released once.
/// unsafe { manager.deallocate(ptr) };
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManagerStats {
    total_allocations: usize,
    total_deallocations: usize,
    fallback_allocations: usize,
    max_supported_size: usize,
    pools: Vec<PoolStats>,
}

impl ManagerStats {
    pub(crate) fn new(
        total_allocations: usize,
        total_deallocations: usize,
        fallback_allocations: usize,
        max_supported_size: usize,
        pools: Vec<PoolStats>,
    ) -> Self {
        Self {
            total_allocations,
            total_deallocations,
            fallback_allocations,
            max_supported_size,
            pools,
        }
    }

    /// The number of allocations served, from pools and from the fallback allocator.
    #[must_use]
    pub fn total_allocations(&self) -> usize {
        self.total_allocations
    }

    /// The number of successful deallocations.
    #[must_use]
    pub fn total_deallocations(&self) -> usize {
        self.total_deallocations
    }

    /// The number of allocations served by the fallback allocator.
    #[must_use]
    pub fn fallback_allocations(&self) -> usize {
        self.fallback_allocations
    }

    /// The number of allocations not yet deallocated.
    #[must_use]
    pub fn active_allocations(&self) -> usize {
        self.total_allocations.saturating_sub(self.total_deallocations)
    }

    /// The largest request size served from pools.
    #[must_use]
    pub fn max_supported_size(&self) -> usize {
        self.max_supported_size
    }

    /// Snapshots of every pool created so far, ordered by size class.
    #[must_use]
    pub fn pools(&self) -> &[PoolStats] {
        &self.pools
    }
}

impl fmt::Display for ManagerStats {
    #[cfg_attr(test, mutants::skip)] // Human-readable output, not worth mutating.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total allocations: {}", self.total_allocations)?;
        writeln!(f, "Total deallocations: {}", self.total_deallocations)?;
        writeln!(f, "Active allocations: {}", self.active_allocations())?;
        writeln!(f, "Fallback allocations: {}", self.fallback_allocations)?;
        writeln!(f, "Active pools: {}", self.pools.len())?;
        writeln!(f, "Max supported object size: {} bytes", self.max_supported_size)?;

        if self.pools.is_empty() {
            return writeln!(f, "No active pools");
        }

        for pool in &self.pools {
            writeln!(f, "  pool[{}] {pool}", pool.size_class().index())?;
        }

        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PoolStats: Send, Sync, Copy, fmt::Debug, fmt::Display);
    assert_impl_all!(ManagerStats: Send, Sync, Clone, fmt::Debug, fmt::Display);

    #[test]
    fn pool_stats_derive_available_and_block_size() {
        let stats = PoolStats::new(SizeClass::new(4), 256, 10, 30, 20);

        assert_eq!(stats.block_size(), 16);
        assert_eq!(stats.available(), 246);
    }

    #[test]
    fn active_allocations_saturates() {
        // Counters read at different instants may briefly show more deallocations.
        let stats = ManagerStats::new(5, 6, 0, 1024, Vec::new());

        assert_eq!(stats.active_allocations(), 0);
    }

    #[test]
    fn display_lists_every_pool() {
        let stats = ManagerStats::new(
            3,
            1,
            1,
            1 << 20,
            vec![
                PoolStats::new(SizeClass::new(4), 256, 1, 1, 0),
                PoolStats::new(SizeClass::new(11), 256, 1, 1, 1),
            ],
        );

        let report = stats.to_string();

        assert!(report.contains("Active allocations: 2"));
        assert!(report.contains("Fallback allocations: 1"));
        assert!(report.contains("pool[4] 16B blocks: 1/256 allocated"));
        assert!(report.contains("pool[11] 2048B blocks"));
        assert!(!report.contains("No active pools"));
    }

    #[test]
    fn display_reports_no_pools() {
        let stats = ManagerStats::new(0, 0, 0, 1 << 20, Vec::new());

        assert!(stats.to_string().contains("No active pools"));
    }
}
