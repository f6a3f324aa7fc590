//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing storage cannot be used (disabled, locked, I/O failure).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write would exceed the configured quota.
    #[error("storage quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether this error means "the device cannot persist right now".
    ///
    /// Callers degrade to in-memory operation on these instead of failing.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::QuotaExceeded { .. } | Self::Database(_)
        )
    }
}
