//! Storage-specific error types.
//!
//! All storage operations return [`StorageError`] on failure, which can be
//! matched to determine the underlying cause (database, pool, queue, lifecycle, etc.).

use thiserror::Error;

use crate::storage::types::IssueStatus;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    /// Read connection pool failed to hand out a connection.
    #[error("read pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error (archive export, database directory).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The store has been shut down.
    #[error("store already disposed")]
    Disposed,

    /// The job was cancelled before it ran (caller gone or shutdown drain timed out).
    #[error("write job cancelled")]
    Cancelled,

    /// The job was evicted from a saturated write queue.
    #[error("write job dropped: queue full")]
    Dropped,

    /// Archive destination rejected before touching the filesystem.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Invalid data in database or in a request (e.g., unknown enum value).
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Issue lifecycle transition not permitted.
    #[error("invalid issue transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: IssueStatus,
        /// Requested status.
        to: IssueStatus,
    },

    /// Referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal error (e.g., task join failure, writer thread gone).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::Internal(format!("blocking task failed: {e}"))
    }
}
