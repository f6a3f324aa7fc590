//! Offline-first mutation sync engine.
//!
//! Lets a client keep working while disconnected: writes are queued in a
//! durable outbox, replayed against the remote collaborator on reconnect,
//! checked for conflicts against the record they were based on, and any
//! divergence is kept for the user to resolve.
//!
//! # Components
//!
//! - **Query Cache** ([`QueryCache`]): memoized reads keyed by procedure and
//!   arguments, with TTL expiry and invalidation
//! - **Outbox** ([`Outbox`]): insertion-ordered queue of unconfirmed writes
//!   with retry bookkeeping and capped exponential backoff
//! - **Conflicts** ([`ConflictStore`]): detected divergences and their
//!   resolutions, plus a field-level diff for presentation
//! - **Network** ([`NetworkMonitor`]): `online` / `offline` / `syncing`
//! - **Orchestrator** ([`SyncOrchestrator`]): owns all of the above and the
//!   single [`OfflineState`] the UI polls
//!
//! # Replay guarantees
//!
//! Writes to the same record are applied in the order they were made, across
//! retries and restarts. Different records drain concurrently. A queued write
//! only ever leaves the outbox through a recorded success, a recorded
//! conflict, or a user discard of a permanently failed entry.
//!
//! # Example
//!
//! ```
//! use driftsync_engine::{NewMutation, SubmitOutcome, SyncConfig, SyncOrchestrator};
//! use driftsync_engine::remote::mock::MockRemote;
//! use driftsync_store::MemoryStore;
//! use driftsync_types::NetworkState;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let engine = SyncOrchestrator::open(
//!     SyncConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MockRemote::new()),
//!     NetworkState::Offline,
//! )
//! .await;
//!
//! let write = NewMutation::update("contact", "contact-1", "contacts.update", json!({"name": "Bob"}));
//! let outcome = engine.submit(write).await.unwrap();
//! assert!(matches!(outcome, SubmitOutcome::Queued(_)));
//! assert_eq!(engine.offline_state().await.pending_mutations, 1);
//!
//! let report = engine.connectivity_restored().await.unwrap();
//! assert_eq!(report.applied, 1);
//! assert!(engine.outbox().is_empty().await);
//! # });
//! ```

mod cache;
mod config;
pub mod conflict;
mod error;
pub mod network;
mod orchestrator;
mod outbox;
pub mod remote;
mod state;

pub use cache::{CacheOptions, CachedQuery, QueryCache, QueryKey};
pub use config::SyncConfig;
pub use conflict::{ConflictStore, DataConflict, FieldDiff, conflicting_fields};
pub use error::{SyncError, SyncResult};
pub use network::{NetworkEvent, NetworkMonitor};
pub use orchestrator::{AttemptOutcome, DrainReport, DrainStatus, SubmitOutcome, SyncOrchestrator};
pub use outbox::{
    BASE_VERSION_FIELD, BackoffPolicy, MutationStatus, NewMutation, Outbox, OutboxStats,
    QueuedMutation,
};
pub use remote::{AuditSink, Disconnected, Remote, RemoteError, RemoteSnapshot, ResolutionRecord};
pub use state::{OfflineState, STORAGE_WARNING};

pub use driftsync_types::{ConflictId, MutationId, MutationKind, NetworkState, Resolution, Timestamp};
