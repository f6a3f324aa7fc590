//! Time-boxed memoization of read results.
//!
//! Entries are keyed by `(procedure, args)`. The key is derived from the
//! content (`"{procedure}:{args as JSON}"`), so callers never manage a key
//! space of their own. serde_json keeps object keys sorted, which makes the
//! JSON text, and therefore the key, deterministic.
//!
//! The in-memory copy is authoritative; the `cache` namespace is written
//! through, so optimistic values stay readable while storage is failing.

use crate::error::{SyncError, SyncResult};
use crate::state::StateCell;
use driftsync_store::{DurableStore, Namespace, StoreError};
use driftsync_types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Identity of a cached read: a procedure name and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryKey {
    pub procedure: String,
    pub args: Vec<Value>,
}

impl QueryKey {
    pub fn new(procedure: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            procedure: procedure.into(),
            args,
        }
    }

    /// The storage key derived from the procedure and the arguments.
    pub fn derive(procedure: &str, args: &[Value]) -> String {
        let args_json = Value::Array(args.to_vec()).to_string();
        format!("{procedure}:{args_json}")
    }

    /// The storage key of this query.
    pub fn storage_key(&self) -> String {
        Self::derive(&self.procedure, &self.args)
    }
}

/// A cached read result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedQuery {
    pub key: String,
    pub procedure: String,
    pub data: Value,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
    pub version: u32,
}

impl CachedQuery {
    /// True once `now` is past the expiry.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| now.is_after(&at))
    }
}

/// Per-write cache options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Lifetime of the entry; falls back to the configured default TTL.
    pub ttl: Option<Duration>,
    /// Version to stamp; falls back to the configured cache version.
    pub version: Option<u32>,
}

impl CacheOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            version: None,
        }
    }
}

/// The query cache, persisted in the `cache` namespace.
pub struct QueryCache {
    store: Arc<dyn DurableStore>,
    state: Arc<StateCell>,
    entries: Mutex<BTreeMap<String, CachedQuery>>,
    default_ttl: Option<Duration>,
    version: u32,
}

impl QueryCache {
    /// Loads the persisted entries. Unreadable ones are dropped on the next
    /// rewrite of the namespace.
    pub(crate) async fn load(
        store: Arc<dyn DurableStore>,
        state: Arc<StateCell>,
        default_ttl: Option<Duration>,
        version: u32,
    ) -> Self {
        let entries = match store.entries(Namespace::Cache).await {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|(key, value)| match serde_json::from_value(value) {
                    Ok(entry) => Some((key, entry)),
                    Err(e) => {
                        debug!("Skipping unreadable cache entry {}: {}", key, e);
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!("Failed to load query cache, starting empty: {}", e);
                BTreeMap::new()
            }
        };
        Self {
            store,
            state,
            entries: Mutex::new(entries),
            default_ttl,
            version,
        }
    }

    /// Returns the cached data, or `None` when absent, expired, or written
    /// under another cache version. Stale entries are purged first.
    pub async fn get(&self, procedure: &str, args: &[Value]) -> Option<Value> {
        self.get_entry(procedure, args).await.map(|entry| entry.data)
    }

    /// Like [`QueryCache::get`] but returns the whole entry.
    pub async fn get_entry(&self, procedure: &str, args: &[Value]) -> Option<CachedQuery> {
        let key = QueryKey::derive(procedure, args);
        let mut entries = self.entries.lock().await;
        let entry = entries.get(&key)?;
        if self.is_live(entry, Timestamp::now()) {
            return Some(entry.clone());
        }

        debug!("Purging stale cache entry {}", key);
        entries.remove(&key);
        let removed = self.store.remove(Namespace::Cache, &key).await;
        self.note(removed, "purge stale cache entry").await;
        None
    }

    /// Stores `data` for `(procedure, args)`.
    pub async fn set(&self, procedure: &str, args: &[Value], data: Value, options: CacheOptions) {
        let now = Timestamp::now();
        let key = QueryKey::derive(procedure, args);
        let entry = CachedQuery {
            key: key.clone(),
            procedure: procedure.to_string(),
            data,
            timestamp: now,
            expires_at: options
                .ttl
                .or(self.default_ttl)
                .map(|ttl| now.saturating_add(ttl)),
            version: options.version.unwrap_or(self.version),
        };

        let mut entries = self.entries.lock().await;
        let written = match serde_json::to_value(&entry) {
            Ok(value) => self.store.set(Namespace::Cache, &key, value).await,
            Err(e) => Err(StoreError::Serialization(e)),
        };
        entries.insert(key, entry);
        self.note(written, "write cache entry").await;
    }

    /// Invalidates cached reads.
    ///
    /// - `procedure` and `args`: exactly that entry
    /// - `procedure` only: every entry of that procedure
    /// - neither: the whole cache
    ///
    /// Returns the number of entries removed.
    pub async fn invalidate(
        &self,
        procedure: Option<&str>,
        args: Option<&[Value]>,
    ) -> SyncResult<usize> {
        match (procedure, args) {
            (Some(procedure), Some(args)) => {
                let key = QueryKey::derive(procedure, args);
                let mut entries = self.entries.lock().await;
                if entries.remove(&key).is_none() {
                    return Ok(0);
                }
                let removed = self.store.remove(Namespace::Cache, &key).await;
                self.note(removed, "invalidate cache entry").await;
                Ok(1)
            }
            (Some(procedure), None) => {
                Ok(self.retain(|entry| entry.procedure != procedure).await)
            }
            (None, None) => Ok(self.retain(|_| false).await),
            (None, Some(_)) => Err(SyncError::InvalidArgument(
                "cache invalidation by arguments requires a procedure".to_string(),
            )),
        }
    }

    /// Invalidates exactly one query.
    pub async fn invalidate_key(&self, key: &QueryKey) {
        // Exact invalidation always has a procedure, so it cannot fail.
        let _ = self.invalidate(Some(&key.procedure), Some(&key.args)).await;
    }

    /// Removes every expired (or version-stale) entry. Returns how many.
    pub async fn clear_expired(&self) -> usize {
        let now = Timestamp::now();
        let removed = self.retain(|entry| self.is_live(entry, now)).await;
        if removed > 0 {
            debug!("Swept {} expired cache entries", removed);
        }
        removed
    }

    /// Every entry in key order, expired ones included.
    pub async fn dump(&self) -> Vec<CachedQuery> {
        self.entries.lock().await.values().cloned().collect()
    }

    /// Rewrites the persisted namespace from memory.
    pub(crate) async fn flush(&self) {
        let entries = self.entries.lock().await;
        let written = self.write_namespace(&entries).await;
        self.note(written, "rewrite cache namespace").await;
    }

    fn is_live(&self, entry: &CachedQuery, now: Timestamp) -> bool {
        !entry.is_expired(now) && entry.version == self.version
    }

    /// Keeps only entries matching `keep` and rewrites the namespace.
    async fn retain<F>(&self, keep: F) -> usize
    where
        F: Fn(&CachedQuery) -> bool,
    {
        let mut entries = self.entries.lock().await;
        let total = entries.len();
        entries.retain(|_, entry| keep(entry));
        let removed = total - entries.len();
        if removed == 0 {
            return 0;
        }

        let written = self.write_namespace(&entries).await;
        self.note(written, "rewrite cache namespace").await;
        removed
    }

    async fn write_namespace(
        &self,
        entries: &BTreeMap<String, CachedQuery>,
    ) -> Result<(), StoreError> {
        let values = entries
            .iter()
            .map(|(key, entry)| serde_json::to_value(entry).map(|v| (key.clone(), v)))
            .collect::<Result<Vec<_>, _>>()?;
        self.store.replace_namespace(Namespace::Cache, values).await
    }

    /// Publishes the outcome of a write, touching the shared state only
    /// when the cache's health changes.
    async fn note(&self, result: Result<(), StoreError>, context: &str) {
        let ok = match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to {}: {}", context, e);
                false
            }
        };
        let degraded = self
            .state
            .snapshot()
            .await
            .degraded_namespaces
            .contains(&Namespace::Cache);
        if degraded == ok {
            self.state.update(|s| s.note_write(Namespace::Cache, ok)).await;
        }
    }
}
