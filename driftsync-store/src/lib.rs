//! Namespaced durable key/value storage for driftsync.
//!
//! Every other driftsync component persists through the [`DurableStore`]
//! trait. Values are JSON documents; keys are strings scoped to one of four
//! fixed [`Namespace`]s. Two backends ship with the crate:
//!
//! - [`MemoryStore`]: volatile, used in tests and as a fallback when no
//!   on-device storage exists
//! - [`SqliteStore`]: a single `kv` table in an embedded SQLite database
//!
//! # Example
//!
//! ```
//! use driftsync_store::{DurableStore, MemoryStore, Namespace};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let store = MemoryStore::new();
//! store.set(Namespace::State, "offline", json!({"pending": 0})).await.unwrap();
//! let value = store.get(Namespace::State, "offline").await.unwrap();
//! assert_eq!(value, Some(json!({"pending": 0})));
//! # });
//! ```

mod error;
mod memory;
mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The fixed set of storage namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Memoized read results.
    Cache,
    /// Queued, not yet confirmed writes.
    Outbox,
    /// Detected local/remote divergences.
    Conflicts,
    /// The offline state singleton.
    State,
}

impl Namespace {
    /// All namespaces, in a stable order.
    pub const ALL: [Namespace; 4] = [
        Namespace::Cache,
        Namespace::Outbox,
        Namespace::Conflicts,
        Namespace::State,
    ];

    /// The on-disk name of the namespace.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Outbox => "outbox",
            Self::Conflicts => "conflicts",
            Self::State => "state",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage footprint, used to warn before quota exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUsage {
    /// Bytes currently used.
    pub used: u64,
    /// Bytes still available, if the backend knows its limit.
    pub available: Option<u64>,
}

/// A namespaced, asynchronous key/value store.
///
/// Implementations must make each single call atomic. Nothing is assumed
/// about atomicity across calls or across namespaces.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Reads one value.
    async fn get(&self, namespace: Namespace, key: &str) -> StoreResult<Option<Value>>;

    /// Writes one value, replacing any previous one.
    async fn set(&self, namespace: Namespace, key: &str, value: Value) -> StoreResult<()>;

    /// Removes one value. Removing a missing key is not an error.
    async fn remove(&self, namespace: Namespace, key: &str) -> StoreResult<()>;

    /// Reads every entry of a namespace, ordered by key.
    async fn entries(&self, namespace: Namespace) -> StoreResult<Vec<(String, Value)>>;

    /// Replaces the whole content of a namespace.
    async fn replace_namespace(
        &self,
        namespace: Namespace,
        entries: Vec<(String, Value)>,
    ) -> StoreResult<()>;

    /// Reports bytes used and, when bounded, bytes still available.
    async fn usage(&self) -> StoreResult<StorageUsage>;
}

/// Size accounting shared by the backends: the bytes a single entry takes.
pub(crate) fn entry_size(key: &str, value: &Value) -> u64 {
    (key.len() + value.to_string().len()) as u64
}
