//! Embedded SQLite backend.
//!
//! All namespaces share one `kv` table keyed by `(namespace, key)`. Values
//! are stored as JSON text. Blocking SQLite calls run on the blocking pool so
//! the async callers never stall the runtime.

use crate::{DurableStore, Namespace, StorageUsage, StoreError, StoreResult};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS kv (
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (namespace, key)
    );
";

/// Persistent [`DurableStore`] backed by SQLite.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    quota: Option<u64>,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            StoreError::Unavailable(format!("failed to open {}: {e}", path.display()))
        })?;
        debug!("Opened SQLite store at {}", path.display());
        Self::from_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("failed to open in-memory store: {e}")))?;
        Self::from_connection(conn)
    }

    /// Limits the logical size of the stored data to `quota` bytes.
    #[must_use]
    pub fn with_quota(mut self, quota: u64) -> Self {
        self.quota = Some(quota);
        self
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            quota: None,
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("store connection poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("storage task failed: {e}")))?
    }
}

fn used_bytes(conn: &Connection) -> StoreResult<u64> {
    let used: i64 = conn.query_row(
        "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0) FROM kv",
        [],
        |row| row.get(0),
    )?;
    Ok(used.max(0) as u64)
}

fn namespace_bytes(conn: &Connection, namespace: Namespace) -> StoreResult<u64> {
    let used: i64 = conn.query_row(
        "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0) FROM kv WHERE namespace = ?1",
        params![namespace.as_str()],
        |row| row.get(0),
    )?;
    Ok(used.max(0) as u64)
}

fn entry_bytes(conn: &Connection, namespace: Namespace, key: &str) -> StoreResult<u64> {
    let used: Option<i64> = conn
        .query_row(
            "SELECT length(CAST(key AS BLOB)) + length(CAST(value AS BLOB)) FROM kv WHERE namespace = ?1 AND key = ?2",
            params![namespace.as_str(), key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(used.unwrap_or(0).max(0) as u64)
}

fn check_quota(quota: Option<u64>, used_after: u64) -> StoreResult<()> {
    match quota {
        Some(quota) if used_after > quota => Err(StoreError::QuotaExceeded {
            needed: used_after,
            available: quota,
        }),
        _ => Ok(()),
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, namespace: Namespace, key: &str) -> StoreResult<Option<Value>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let text: Option<String> = conn
                .query_row(
                    "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                    params![namespace.as_str(), key],
                    |row| row.get(0),
                )
                .optional()?;
            text.map(|t| serde_json::from_str(&t).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn set(&self, namespace: Namespace, key: &str, value: Value) -> StoreResult<()> {
        let key = key.to_string();
        let quota = self.quota;
        self.with_conn(move |conn| {
            let text = serde_json::to_string(&value)?;
            if quota.is_some() {
                let used_after = used_bytes(conn)? - entry_bytes(conn, namespace, &key)?
                    + (key.len() + text.len()) as u64;
                check_quota(quota, used_after)?;
            }
            conn.execute(
                "INSERT OR REPLACE INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)",
                params![namespace.as_str(), key, text],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, namespace: Namespace, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace.as_str(), key],
            )?;
            Ok(())
        })
        .await
    }

    async fn entries(&self, namespace: Namespace) -> StoreResult<Vec<(String, Value)>> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT key, value FROM kv WHERE namespace = ?1 ORDER BY key")?;
            let rows = stmt.query_map(params![namespace.as_str()], |row| {
                let key: String = row.get(0)?;
                let value: String = row.get(1)?;
                Ok((key, value))
            })?;

            let mut result = Vec::new();
            for row in rows {
                let (key, text) = row?;
                result.push((key, serde_json::from_str(&text)?));
            }
            Ok(result)
        })
        .await
    }

    async fn replace_namespace(
        &self,
        namespace: Namespace,
        entries: Vec<(String, Value)>,
    ) -> StoreResult<()> {
        let quota = self.quota;
        self.with_conn(move |conn| {
            let encoded = entries
                .into_iter()
                .map(|(k, v)| serde_json::to_string(&v).map(|t| (k, t)))
                .collect::<Result<Vec<_>, _>>()?;
            if quota.is_some() {
                let incoming: u64 = encoded.iter().map(|(k, t)| (k.len() + t.len()) as u64).sum();
                let used_after = used_bytes(conn)? - namespace_bytes(conn, namespace)? + incoming;
                check_quota(quota, used_after)?;
            }

            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM kv WHERE namespace = ?1",
                params![namespace.as_str()],
            )?;
            for (key, text) in &encoded {
                tx.execute(
                    "INSERT INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)",
                    params![namespace.as_str(), key, text],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn usage(&self) -> StoreResult<StorageUsage> {
        let quota = self.quota;
        self.with_conn(move |conn| {
            let used = used_bytes(conn)?;
            Ok(StorageUsage {
                used,
                available: quota.map(|q| q.saturating_sub(used)),
            })
        })
        .await
    }
}
