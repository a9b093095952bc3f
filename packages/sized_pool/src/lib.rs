#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A memory manager that serves frequently recurring allocation sizes from fixed-capacity
//! pools, one pool per power-of-two size class, and everything else from a general-purpose
//! allocator.
//!
//! Each request is rounded up to the smallest power of two that can hold it (its size class).
//! The first request for a size class creates a [`BlockPool`] for it, with a capacity decided by
//! a pluggable [`CapacityStrategy`]. Later requests of that size class are served from the pool
//! until it runs out of vacant blocks, at which point they go to the fallback allocator. Pools
//! never grow and are only released when the manager is dropped.
//!
//! The core functionality includes:
//! - [`PoolManager`] - routes allocations to pools or the fallback allocator
//! - [`BlockPool`] - a fixed-capacity arena of equally sized, self-aligned blocks
//! - [`CapacityStrategy`] - decides how many blocks each pool holds
//! - [`ManagedAllocator`] and [`SharedAllocator`] - typed access for containers, usable with
//!   the [`allocator_api2`] and [`hashbrown`] containers (see [`ManagedVec`], [`SharedHashMap`])
//! - [`ManagedBox`] - ownership of a single value
//!
//! # Example
//!
//! ```
//! use sized_pool::PoolManager;
//!
//! let manager = PoolManager::new();
//!
//! // Both requests round up to the 16-byte size class and share one pool.
//! let a = manager.allocate_bytes(10).unwrap();
//! let b = manager.allocate_bytes(16).unwrap();
//!
//! // This one gets a pool of 2048-byte blocks.
//! let c = manager.allocate_bytes(2000).unwrap();
//!
//! assert_eq!(manager.pool_count(), 2);
//! assert_eq!(manager.active_allocations(), 3);
//!
//! // SAFETY: All pointers came from this manager and each is released once.
//! unsafe {
//!     manager.deallocate(a);
//!     manager.deallocate(b);
//!     manager.deallocate(c);
//! }
//!
//! println!("{}", manager.stats());
//! ```
//!
//! # Typed values
//!
//! ```
//! use sized_pool::{ManagedBox, PoolManager};
//!
//! let manager = PoolManager::new();
//!
//! let point = ManagedBox::new_in((1.5_f32, -2.0_f32), &manager).unwrap();
//! assert_eq!(point.0, 1.5);
//! ```
//!
//! # Shared instance
//!
//! A process-wide manager is available via [`PoolManager::global()`] and can be replaced via
//! [`PoolManager::set_global()`]. Passing a manager explicitly is preferred where practical.
//!
//! # Logging
//!
//! The crate emits [`tracing`] events: `debug` when a pool is created or configuration changes,
//! `trace` when a request is served by the fallback allocator and `warn` when a deallocation
//! is rejected or a pool cannot be created. No subscriber is installed by the crate itself.

mod adapter;
mod block_pool;
mod builder;
mod container;
mod drop_policy;
mod error;
mod fallback;
mod global;
mod managed_box;
mod manager;
mod size_class;
mod stats;
mod strategy;

#[cfg(test)]
mod test_support;

pub use adapter::*;
pub use block_pool::*;
pub use builder::*;
pub use container::*;
pub use drop_policy::*;
pub use error::*;
pub(crate) use fallback::*;
pub use managed_box::*;
pub use manager::*;
pub use size_class::*;
pub use stats::*;
pub use strategy::*;

// Containers accepting our adapters come from these crates, so callers can use matching versions.
pub use allocator_api2;
pub use hashbrown;

pub(crate) const ERR_POISONED_LOCK: &str =
    "encountered poisoned lock - program validity cannot be guaranteed";
