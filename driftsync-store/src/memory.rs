//! Volatile in-memory backend.

use crate::{DurableStore, Namespace, StorageUsage, StoreError, StoreResult, entry_size};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

type Tables = HashMap<Namespace, BTreeMap<String, Value>>;

/// A [`DurableStore`] that keeps everything in process memory.
///
/// Supports an optional byte quota and can be switched "unavailable" to
/// exercise the degraded-storage paths of its callers.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    quota: Option<u64>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty, unbounded store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            quota: None,
            available: AtomicBool::new(true),
        }
    }

    /// Creates an empty store that rejects writes beyond `quota` bytes.
    pub fn with_quota(quota: u64) -> Self {
        Self {
            quota: Some(quota),
            ..Self::new()
        }
    }

    /// Simulates storage being disabled (`false`) or restored (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of entries in a namespace.
    pub async fn len(&self, namespace: Namespace) -> usize {
        self.tables
            .read()
            .await
            .get(&namespace)
            .map_or(0, BTreeMap::len)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("storage disabled".to_string()))
        }
    }

    fn used(tables: &Tables) -> u64 {
        tables
            .values()
            .flat_map(|t| t.iter())
            .map(|(k, v)| entry_size(k, v))
            .sum()
    }

    fn check_quota(&self, used_after: u64) -> StoreResult<()> {
        match self.quota {
            Some(quota) if used_after > quota => Err(StoreError::QuotaExceeded {
                needed: used_after,
                available: quota,
            }),
            _ => Ok(()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, namespace: Namespace, key: &str) -> StoreResult<Option<Value>> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables.get(&namespace).and_then(|t| t.get(key)).cloned())
    }

    async fn set(&self, namespace: Namespace, key: &str, value: Value) -> StoreResult<()> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let previous = tables
            .get(&namespace)
            .and_then(|t| t.get(key))
            .map_or(0, |v| entry_size(key, v));
        let used_after = Self::used(&tables) - previous + entry_size(key, &value);
        self.check_quota(used_after)?;
        tables
            .entry(namespace)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, namespace: Namespace, key: &str) -> StoreResult<()> {
        self.check_available()?;
        if let Some(table) = self.tables.write().await.get_mut(&namespace) {
            table.remove(key);
        }
        Ok(())
    }

    async fn entries(&self, namespace: Namespace) -> StoreResult<Vec<(String, Value)>> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(&namespace)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn replace_namespace(
        &self,
        namespace: Namespace,
        entries: Vec<(String, Value)>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let current: u64 = tables
            .get(&namespace)
            .map(|t| t.iter().map(|(k, v)| entry_size(k, v)).sum())
            .unwrap_or(0);
        let incoming: u64 = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
        self.check_quota(Self::used(&tables) - current + incoming)?;
        tables.insert(namespace, entries.into_iter().collect());
        Ok(())
    }

    async fn usage(&self) -> StoreResult<StorageUsage> {
        self.check_available()?;
        let used = Self::used(&*self.tables.read().await);
        Ok(StorageUsage {
            used,
            available: self.quota.map(|q| q.saturating_sub(used)),
        })
    }
}
