//! Error types for the sync engine.

use driftsync_store::StoreError;
use driftsync_types::{ConflictId, MutationId, NetworkState};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// Only [`SyncError::RemoteRejected`] and exhausted retries are meant to
/// reach the user as actionable failures. Storage and network problems are
/// normally absorbed into [`crate::OfflineState`] before they get here.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The persistence layer could not be used.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),

    /// The remote collaborator cannot be reached.
    #[error("network unavailable")]
    NetworkUnavailable,

    /// The remote collaborator definitively refused the write.
    #[error("remote rejected the mutation: {0}")]
    RemoteRejected(String),

    /// Timeout or server-side hiccup; worth retrying.
    #[error("transient failure: {0}")]
    TransientFailure(String),

    /// No conflict with this ID.
    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    /// The conflict already carries a resolution.
    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(ConflictId),

    /// Field-level merge is not implemented.
    #[error("merged resolution is not supported")]
    MergeNotSupported,

    /// No queued mutation with this ID.
    #[error("mutation not found: {0}")]
    MutationNotFound(MutationId),

    /// The operation needs a mutation in the failed state.
    #[error("mutation {0} has not failed")]
    MutationNotFailed(MutationId),

    /// The network state machine refused a transition.
    #[error("invalid network transition from {from} on {event}")]
    InvalidTransition { from: NetworkState, event: String },

    /// Caller passed an argument combination that makes no sense.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
