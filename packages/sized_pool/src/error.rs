use thiserror::Error;

/// Errors that can occur when requesting memory from a [`PoolManager`][crate::PoolManager].
///
/// Pool exhaustion and oversize requests are not errors. Both are silently served by the
/// fallback allocator instead.
#[derive(Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The caller requested zero bytes. Zero-sized allocations are rejected instead of being
    /// rounded up to the smallest size class.
    #[error("zero-sized allocations are not supported")]
    ZeroSize,

    /// The requested size and alignment do not form a valid memory layout, either because the
    /// alignment is not a power of two or because the size overflows when padded to it.
    #[error("invalid layout: {size} bytes aligned to {alignment}")]
    InvalidLayout {
        /// The requested size in bytes.
        size: usize,

        /// The requested alignment in bytes.
        alignment: usize,
    },

    /// The underlying general-purpose allocator could not provide the requested memory.
    #[error("out of memory: could not allocate {size} bytes aligned to {alignment}")]
    OutOfMemory {
        /// The requested size in bytes.
        size: usize,

        /// The requested alignment in bytes.
        alignment: usize,
    },
}

/// A specialized `Result` type for memory manager operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
