//! Seams to the outside world: the remote collaborator that executes
//! mutations, and the optional audit collaborator that records conflict
//! resolutions.

use crate::error::SyncError;
use crate::outbox::BASE_VERSION_FIELD;
use async_trait::async_trait;
use driftsync_types::{ConflictId, Resolution, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The collaborator cannot be reached. Expected while offline.
    #[error("network unavailable")]
    NetworkUnavailable,
    /// Definitive validation failure; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Timeout or server hiccup.
    #[error("transient: {0}")]
    Transient(String),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NetworkUnavailable => SyncError::NetworkUnavailable,
            RemoteError::Rejected(reason) => SyncError::RemoteRejected(reason),
            RemoteError::Transient(reason) => SyncError::TransientFailure(reason),
        }
    }
}

/// The current remote version of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSnapshot {
    pub data: Value,
    pub updated_at: Timestamp,
}

impl RemoteSnapshot {
    /// Builds a snapshot from a record carrying its own `updatedAt`.
    pub fn from_record(data: Value) -> Option<Self> {
        let updated_at = Timestamp::from_field(&data, BASE_VERSION_FIELD)?;
        Some(Self { data, updated_at })
    }
}

/// The remote collaborator.
///
/// The engine only needs an async call it can retry; transport, auth and
/// serialization are the implementor's concern.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Executes a procedure with positional arguments.
    async fn execute(&self, procedure: &str, args: &[Value]) -> Result<Value, RemoteError>;

    /// Fetches the current remote version of a record, `None` if it does not
    /// exist.
    async fn fetch_current(
        &self,
        entity: &str,
        entity_id: &str,
    ) -> Result<Option<RemoteSnapshot>, RemoteError>;
}

/// What the audit collaborator receives when a conflict is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRecord {
    pub conflict_id: ConflictId,
    pub resolution: Resolution,
    pub timestamp: Timestamp,
    /// Caller-supplied audit payload, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<Value>,
}

impl ResolutionRecord {
    pub(crate) fn new(conflict_id: ConflictId, resolution: Resolution, entry: Option<Value>) -> Self {
        Self {
            conflict_id,
            resolution,
            timestamp: Timestamp::now(),
            entry,
        }
    }
}

/// Receives resolution records for an external, tamper-evident audit log.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: ResolutionRecord) -> Result<(), String>;
}

/// A remote that is never reachable. Used by tooling that inspects a
/// profile without a connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disconnected;

#[async_trait]
impl Remote for Disconnected {
    async fn execute(&self, _procedure: &str, _args: &[Value]) -> Result<Value, RemoteError> {
        Err(RemoteError::NetworkUnavailable)
    }

    async fn fetch_current(
        &self,
        _entity: &str,
        _entity_id: &str,
    ) -> Result<Option<RemoteSnapshot>, RemoteError> {
        Err(RemoteError::NetworkUnavailable)
    }
}

pub mod mock {
    //! A scriptable in-memory collaborator for tests.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Mutex, PoisonError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// One recorded `execute` call.
    #[derive(Debug, Clone, PartialEq)]
    pub struct RemoteCall {
        pub procedure: String,
        pub args: Vec<Value>,
    }

    /// In-memory [`Remote`].
    ///
    /// Succeeds by default, echoing the last argument. Failures are scripted
    /// per procedure and consumed in order.
    #[derive(Default)]
    pub struct MockRemote {
        snapshots: Mutex<HashMap<(String, String), RemoteSnapshot>>,
        failures: Mutex<HashMap<String, VecDeque<RemoteError>>>,
        fetch_failures: Mutex<VecDeque<RemoteError>>,
        calls: Mutex<Vec<RemoteCall>>,
        unreachable: AtomicBool,
        latency: Mutex<Option<Duration>>,
    }

    impl MockRemote {
        pub fn new() -> Self {
            Self::default()
        }

        /// Sets the remote version of a record from its own `updatedAt`.
        /// A record without one reads as missing remotely.
        pub fn set_snapshot(&self, entity: &str, entity_id: &str, record: Value) {
            let key = (entity.to_string(), entity_id.to_string());
            let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
            match RemoteSnapshot::from_record(record) {
                Some(snapshot) => snapshots.insert(key, snapshot),
                None => snapshots.remove(&key),
            };
        }

        /// Makes the next `times` calls to `procedure` fail with `err`.
        pub fn fail_next(&self, procedure: &str, err: RemoteError, times: usize) {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            let script = failures.entry(procedure.to_string()).or_default();
            script.extend(std::iter::repeat_n(err, times));
        }

        /// Makes the next snapshot fetch fail with `err`.
        pub fn fail_next_fetch(&self, err: RemoteError) {
            self.fetch_failures.lock().unwrap_or_else(PoisonError::into_inner).push_back(err);
        }

        /// Every call answers `NetworkUnavailable` while set.
        pub fn set_unreachable(&self, unreachable: bool) {
            self.unreachable.store(unreachable, Ordering::SeqCst);
        }

        /// Delays every call.
        pub fn set_latency(&self, latency: Duration) {
            *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(latency);
        }

        /// Recorded `execute` calls, in order.
        pub fn calls(&self) -> Vec<RemoteCall> {
            self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        /// Recorded calls to one procedure.
        pub fn calls_to(&self, procedure: &str) -> Vec<RemoteCall> {
            self.calls()
                .into_iter()
                .filter(|c| c.procedure == procedure)
                .collect()
        }

        async fn delay(&self) {
            let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
        }
    }

    #[async_trait]
    impl Remote for MockRemote {
        async fn execute(&self, procedure: &str, args: &[Value]) -> Result<Value, RemoteError> {
            self.delay().await;
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(RemoteError::NetworkUnavailable);
            }
            self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(RemoteCall {
                procedure: procedure.to_string(),
                args: args.to_vec(),
            });
            let scripted = self
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_mut(procedure)
                .and_then(VecDeque::pop_front);
            match scripted {
                Some(err) => Err(err),
                None => Ok(args.last().cloned().unwrap_or(Value::Null)),
            }
        }

        async fn fetch_current(
            &self,
            entity: &str,
            entity_id: &str,
        ) -> Result<Option<RemoteSnapshot>, RemoteError> {
            self.delay().await;
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(RemoteError::NetworkUnavailable);
            }
            let scripted = self
                .fetch_failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            if let Some(err) = scripted {
                return Err(err);
            }
            Ok(self
                .snapshots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&(entity.to_string(), entity_id.to_string()))
                .cloned())
        }
    }

    /// Collects resolution records; can be told to fail.
    #[derive(Default)]
    pub struct MockAuditSink {
        records: Mutex<Vec<ResolutionRecord>>,
        failing: AtomicBool,
    }

    impl MockAuditSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn records(&self) -> Vec<ResolutionRecord> {
            self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    #[async_trait]
    impl AuditSink for MockAuditSink {
        async fn record(&self, record: ResolutionRecord) -> Result<(), String> {
            if self.failing.load(Ordering::SeqCst) {
                return Err("audit log unavailable".to_string());
            }
            self.records.lock().unwrap_or_else(PoisonError::into_inner).push(record);
            Ok(())
        }
    }
}
