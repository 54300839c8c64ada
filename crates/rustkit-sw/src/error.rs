//! Errors for cache storage and the pending request queue.

use thiserror::Error;

use crate::queue::PendingId;

/// Errors that can occur in cache storage operations.
///
/// Absence (no matching entry, unknown cache name on `has`/`delete`) is not
/// an error and is reported through `Option`/`bool` return values instead.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid cache name: {0}")]
    InvalidName(String),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Invalid match options: {0}")]
    InvalidOptions(String),

    #[error("Capture failed: {0}")]
    CaptureFailure(String),

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Request already resolved: {0:?}")]
    DoubleResolution(PendingId),

    #[error("Storage unavailable for scope {scope}: {reason}")]
    StorageUnavailable { scope: String, reason: String },

    #[error("Config error: {0}")]
    Config(String),
}

impl CacheError {
    /// Create a persistence failure.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::PersistenceFailure(msg.into())
    }

    /// Create a capture failure.
    pub fn capture(msg: impl Into<String>) -> Self {
        Self::CaptureFailure(msg.into())
    }

    /// Create a storage-unavailable error for a scope.
    pub fn unavailable(scope: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::StorageUnavailable {
            scope: scope.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        Self::PersistenceFailure(e.to_string())
    }
}

/// Result alias for cache storage operations.
pub type CacheResult<T> = Result<T, CacheError>;
