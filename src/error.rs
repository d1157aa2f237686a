//! Error types for the cache backends
//!
//! Provides unified error handling using thiserror. These errors never leave
//! the crate through the engine API: the persistence adapter logs and
//! swallows them.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for storage backends and the durable open sequence.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Generic storage failure with context
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite failure in the durable store
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON encoding or decoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Durable store stayed locked by another holder past the busy timeout
    #[error("Durable store blocked: {0}")]
    Blocked(String),

    /// Backend handle has already been closed
    #[error("Backend closed")]
    Closed,

    /// Blocking task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),
}

impl CacheError {
    // == Classification ==
    /// Returns true when the error only means the handle was closed.
    ///
    /// Operations racing a `destroy()` hit this and are silently discarded.
    pub fn is_closed(&self) -> bool {
        matches!(self, CacheError::Closed)
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheError::Task(err.to_string())
    }
}

// == Result Type Alias ==
/// Convenience Result type for backend operations.
pub type Result<T> = std::result::Result<T, CacheError>;
