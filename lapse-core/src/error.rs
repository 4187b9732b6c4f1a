//! Error types for cache operations.

use thiserror::Error;

/// Errors surfaced by the write operations of a [`Cache`](crate::Cache).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// The cache's lifecycle has ended and it no longer accepts writes
    #[error("canceled cache instance")]
    Canceled,

    /// The caller's own cancellation fired while waiting on a busy entry
    #[error("operation canceled while waiting on entry")]
    OperationCanceled,
}

impl CacheError {
    /// Returns `true` if the cache itself has been torn down.
    pub fn is_canceled(&self) -> bool {
        matches!(self, CacheError::Canceled)
    }

    /// Returns `true` if the caller-supplied cancellation fired first.
    pub fn is_operation_canceled(&self) -> bool {
        matches!(self, CacheError::OperationCanceled)
    }
}
