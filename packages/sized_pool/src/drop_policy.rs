/// Determines what happens when a [`PoolManager`][crate::PoolManager] is dropped while memory it
/// handed out has not been returned yet.
///
/// Dropping the manager always releases the arenas of its pools. Any pointers into those arenas
/// that callers still hold become dangling. Outstanding fallback allocations are leaked.
///
/// # Examples
///
/// ```
/// use sized_pool::{DropPolicy, PoolManager};
///
/// let manager = PoolManager::builder()
///     .drop_policy(DropPolicy::MustNotDropActiveAllocations)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The manager may be dropped with active allocations. This is the default.
    #[default]
    MayDropActiveAllocations,

    /// The manager will panic if it is dropped while it has active allocations.
    ///
    /// This is useful for detecting leaks in tests and in components that must return all
    /// memory before shutting down.
    MustNotDropActiveAllocations,
}
