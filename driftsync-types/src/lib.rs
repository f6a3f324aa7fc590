//! Core type definitions for driftsync.
//!
//! This crate defines the plain, storage-agnostic types shared by the
//! store, the engine and the CLI:
//! - Mutation and conflict identifiers (UUID v7)
//! - Millisecond wall-clock timestamps
//! - The small enums that travel through persisted records
//!   (mutation kind, conflict resolution, network state)

mod ids;
mod kinds;
mod timestamp;

pub use ids::{ConflictId, MutationId};
pub use kinds::{MutationKind, NetworkState, Resolution};
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}
