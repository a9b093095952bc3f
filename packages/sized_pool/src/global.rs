use std::sync::{Arc, LazyLock};

use arc_swap::ArcSwap;
use tracing::debug;

use crate::PoolManager;

// We use `ArcSwap` because it offers very good multithreaded read performance and lets callers
// keep using a manager they obtained even after it has been replaced.
static GLOBAL_MANAGER: LazyLock<ArcSwap<PoolManager>> =
    LazyLock::new(|| ArcSwap::from_pointee(PoolManager::new()));

impl PoolManager {
    /// The process-wide memory manager, created with the default configuration on first use.
    ///
    /// Every caller receives a handle to the same manager until it is replaced via
    /// [`set_global()`](Self::set_global).
    ///
    /// # Examples
    ///
    /// ```
    /// use sized_pool::PoolManager;
    ///
    /// let manager = PoolManager::global();
    ///
    /// let ptr = manager.allocate_bytes(64).unwrap();
    ///
    /// // SAFETY: The pointer came from this manager and is released once.
    /// unsafe { manager.deallocate(ptr) };
    /// ```
    #[must_use]
    pub fn global() -> Arc<Self> {
        GLOBAL_MANAGER.load_full()
    }

    /// Replaces the process-wide memory manager and returns the previous one.
    ///
    /// Memory allocated from the previous manager must still be released through it. Callers
    /// that already hold a handle to the previous manager keep using it, and it stays alive
    /// until the last handle is dropped.
    pub fn set_global(manager: Arc<Self>) -> Arc<Self> {
        debug!(
            max_supported_size = manager.max_supported_size(),
            "replacing global pool manager"
        );

        GLOBAL_MANAGER.swap(manager)
    }
}
