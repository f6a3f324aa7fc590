//! The mutation outbox: an insertion-ordered, durable queue of writes that
//! the remote collaborator has not confirmed yet.
//!
//! Entries are never reordered. A failed attempt bumps the entry's retry
//! bookkeeping in place, so a later mutation of the same entity can never
//! overtake it. The whole queue is persisted as the `outbox` namespace, one
//! entry per position key, and the in-memory copy stays authoritative when
//! storage is failing.

use crate::cache::QueryKey;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::state::StateCell;
use driftsync_store::{DurableStore, Namespace, StoreError};
use driftsync_types::{MutationId, MutationKind, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Field of `original_data` holding the base version of the record.
pub const BASE_VERSION_FIELD: &str = "updatedAt";

/// A write waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    pub id: MutationId,
    #[serde(rename = "type")]
    pub kind: MutationKind,
    pub entity: String,
    pub entity_id: String,
    pub data: Value,
    /// Snapshot of the record the local edit was based on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_data: Option<Value>,
    pub timestamp: Timestamp,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The remote collaborator refused this write for good.
    #[serde(default)]
    pub rejected: bool,
    pub procedure: String,
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<QueryKey>,
}

impl QueuedMutation {
    /// The base version captured in `original_data`, if any.
    pub fn base_version(&self) -> Option<Timestamp> {
        self.original_data
            .as_ref()
            .and_then(|data| Timestamp::from_field(data, BASE_VERSION_FIELD))
    }

    /// The cached read this mutation makes stale.
    pub fn read_key(&self) -> QueryKey {
        self.cache_key.clone().unwrap_or_else(|| {
            QueryKey::new(format!("{}.get", self.entity), vec![json!(self.entity_id)])
        })
    }

    /// Whether `other` targets the same record.
    pub fn same_target(&self, entity: &str, entity_id: &str) -> bool {
        self.entity == entity && self.entity_id == entity_id
    }
}

/// A write as issued by the caller, before it gets an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub kind: MutationKind,
    pub entity: String,
    pub entity_id: String,
    pub data: Value,
    pub original_data: Option<Value>,
    pub procedure: String,
    pub args: Vec<Value>,
    pub cache_key: Option<QueryKey>,
}

impl NewMutation {
    /// A create; arguments default to `[data]`.
    pub fn create(
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        procedure: impl Into<String>,
        data: Value,
    ) -> Self {
        let args = vec![data.clone()];
        Self::build(MutationKind::Create, entity, entity_id, procedure, data, args)
    }

    /// An update; arguments default to `[entity_id, data]`.
    pub fn update(
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        procedure: impl Into<String>,
        data: Value,
    ) -> Self {
        let entity_id = entity_id.into();
        let args = vec![json!(entity_id), data.clone()];
        Self::build(MutationKind::Update, entity, entity_id, procedure, data, args)
    }

    /// A delete; arguments default to `[entity_id]`.
    pub fn delete(
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        procedure: impl Into<String>,
    ) -> Self {
        let entity_id = entity_id.into();
        let args = vec![json!(entity_id)];
        Self::build(MutationKind::Delete, entity, entity_id, procedure, Value::Null, args)
    }

    fn build(
        kind: MutationKind,
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        procedure: impl Into<String>,
        data: Value,
        args: Vec<Value>,
    ) -> Self {
        Self {
            kind,
            entity: entity.into(),
            entity_id: entity_id.into(),
            data,
            original_data: None,
            procedure: procedure.into(),
            args,
            cache_key: None,
        }
    }

    /// Records the snapshot the edit was based on (enables conflict detection).
    #[must_use]
    pub fn with_original(mut self, original: Value) -> Self {
        self.original_data = Some(original);
        self
    }

    /// Overrides the remote call arguments.
    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Overrides the cached read this mutation affects.
    #[must_use]
    pub fn with_cache_key(mut self, key: QueryKey) -> Self {
        self.cache_key = Some(key);
        self
    }

    /// Assigns an id and an issue time.
    pub fn into_queued(self) -> QueuedMutation {
        QueuedMutation {
            id: MutationId::new(),
            kind: self.kind,
            entity: self.entity,
            entity_id: self.entity_id,
            data: self.data,
            original_data: self.original_data,
            timestamp: Timestamp::now(),
            retry_count: 0,
            last_attempt: None,
            error: None,
            rejected: false,
            procedure: self.procedure,
            args: self.args,
            cache_key: self.cache_key,
        }
    }
}

/// Replay classification of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    /// Never attempted, or reset by the user.
    Pending,
    /// Failed transiently, still within the retry budget.
    Retrying,
    /// Rejected or out of retries; waits for the user.
    Failed,
}

/// Counts shown by the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub total: usize,
    pub pending: usize,
    pub failed: usize,
    pub retrying: usize,
}

/// Capped exponential backoff, a pure function of the retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Delay before the next attempt of an entry that failed `retry_count` times.
    pub fn delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry_count - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// The durable outbox.
pub struct Outbox {
    store: Arc<dyn DurableStore>,
    state: Arc<StateCell>,
    queue: Mutex<Vec<QueuedMutation>>,
    max_retries: u32,
    backoff: BackoffPolicy,
}

impl Outbox {
    /// Loads the persisted queue and publishes its counts.
    pub(crate) async fn load(
        store: Arc<dyn DurableStore>,
        state: Arc<StateCell>,
        config: &SyncConfig,
    ) -> Self {
        let queue = match store.entries(Namespace::Outbox).await {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|(key, value)| match serde_json::from_value(value) {
                    Ok(mutation) => Some(mutation),
                    Err(e) => {
                        warn!("Skipping unreadable outbox entry {}: {}", key, e);
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!("Failed to load outbox, starting empty: {}", e);
                Vec::new()
            }
        };
        info!("Loaded {} queued mutations", queue.len());

        let outbox = Self {
            store,
            state,
            queue: Mutex::new(Vec::new()),
            max_retries: config.max_retries,
            backoff: BackoffPolicy {
                base: Duration::from_millis(config.backoff_base_ms),
                max: Duration::from_millis(config.backoff_max_ms),
            },
        };
        let (total, failed) = outbox.counts(&queue);
        *outbox.queue.lock().await = queue;
        outbox
            .state
            .update(|s| {
                s.pending_mutations = total;
                s.failed_mutations = failed;
            })
            .await;
        outbox
    }

    // ── Queue operations ─────────────────────────────────────────

    /// Appends a mutation to the tail and returns its id.
    ///
    /// The id is assigned when the write is issued, so a write that failed
    /// its immediate attempt keeps the id it was first attempted under.
    pub(crate) async fn enqueue(&self, mutation: QueuedMutation) -> MutationId {
        let id = mutation.id;
        let mut queue = self.queue.lock().await;
        debug!(
            "Enqueued {} {} {} as {}",
            mutation.kind, mutation.entity, mutation.entity_id, id
        );
        queue.push(mutation);
        self.persist(&queue).await;
        id
    }

    /// Returns the head of the queue without removing it.
    pub async fn drain_next(&self) -> Option<QueuedMutation> {
        self.queue.lock().await.first().cloned()
    }

    /// Removes a mutation the remote collaborator confirmed.
    pub(crate) async fn mark_succeeded(&self, id: MutationId) -> SyncResult<QueuedMutation> {
        let removed = self.remove(id).await?;
        debug!("Mutation {} confirmed", id);
        Ok(removed)
    }

    /// Records a transient failure. The entry keeps its position.
    pub(crate) async fn mark_failed(&self, id: MutationId, error: &str) -> SyncResult<MutationStatus> {
        let mut queue = self.queue.lock().await;
        let entry = queue
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(SyncError::MutationNotFound(id))?;
        entry.retry_count += 1;
        entry.last_attempt = Some(Timestamp::now());
        entry.error = Some(error.to_string());
        let status = self.classify(entry);
        if status == MutationStatus::Failed {
            warn!(
                "Mutation {} exhausted its retries after {} attempts: {}",
                id, entry.retry_count, error
            );
        } else {
            debug!("Mutation {} failed (attempt {}): {}", id, entry.retry_count, error);
        }
        self.persist(&queue).await;
        Ok(status)
    }

    /// Records a definitive rejection. The entry is never retried
    /// automatically.
    pub(crate) async fn mark_rejected(&self, id: MutationId, error: &str) -> SyncResult<()> {
        let mut queue = self.queue.lock().await;
        let entry = queue
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(SyncError::MutationNotFound(id))?;
        entry.rejected = true;
        entry.last_attempt = Some(Timestamp::now());
        entry.error = Some(error.to_string());
        warn!("Mutation {} rejected by remote: {}", id, error);
        self.persist(&queue).await;
        Ok(())
    }

    /// Removes a mutation that is now represented by a conflict.
    pub(crate) async fn take_for_conflict(&self, id: MutationId) -> SyncResult<QueuedMutation> {
        self.remove(id).await
    }

    /// Puts a failed mutation back into the replay rotation.
    pub(crate) async fn retry(&self, id: MutationId) -> SyncResult<()> {
        let mut queue = self.queue.lock().await;
        let entry = queue
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(SyncError::MutationNotFound(id))?;
        entry.retry_count = 0;
        entry.rejected = false;
        entry.error = None;
        info!("Mutation {} reset for manual retry", id);
        self.persist(&queue).await;
        Ok(())
    }

    /// Drops a failed mutation at the user's request.
    pub(crate) async fn discard(&self, id: MutationId) -> SyncResult<QueuedMutation> {
        let mut queue = self.queue.lock().await;
        let index = queue
            .iter()
            .position(|m| m.id == id)
            .ok_or(SyncError::MutationNotFound(id))?;
        if self.classify(&queue[index]) != MutationStatus::Failed {
            return Err(SyncError::MutationNotFailed(id));
        }
        let removed = queue.remove(index);
        info!(
            "Discarded failed mutation {} ({} {}): {}",
            id,
            removed.kind,
            removed.entity_id,
            removed.error.as_deref().unwrap_or("no error recorded")
        );
        self.persist(&queue).await;
        Ok(removed)
    }

    // ── Reads ────────────────────────────────────────────────────

    /// A copy of every entry in queue order.
    pub async fn entries(&self) -> Vec<QueuedMutation> {
        self.queue.lock().await.clone()
    }

    /// The current version of one entry.
    pub async fn get(&self, id: MutationId) -> Option<QueuedMutation> {
        self.queue.lock().await.iter().find(|m| m.id == id).cloned()
    }

    /// Entries targeting one record, in queue order.
    pub async fn for_entity(&self, entity: &str, entity_id: &str) -> Vec<QueuedMutation> {
        self.queue
            .lock()
            .await
            .iter()
            .filter(|m| m.same_target(entity, entity_id))
            .cloned()
            .collect()
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Counts by classification.
    pub async fn stats(&self) -> OutboxStats {
        let queue = self.queue.lock().await;
        let mut stats = OutboxStats {
            total: queue.len(),
            ..OutboxStats::default()
        };
        for mutation in queue.iter() {
            match self.classify(mutation) {
                MutationStatus::Pending => stats.pending += 1,
                MutationStatus::Retrying => stats.retrying += 1,
                MutationStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Classifies an entry against the retry budget.
    pub fn classify(&self, mutation: &QueuedMutation) -> MutationStatus {
        if mutation.rejected || mutation.retry_count >= self.max_retries {
            MutationStatus::Failed
        } else if mutation.retry_count > 0 {
            MutationStatus::Retrying
        } else {
            MutationStatus::Pending
        }
    }

    /// Whether an entry may be attempted at `now`: it is not failed and its
    /// backoff has elapsed.
    pub fn is_due(&self, mutation: &QueuedMutation, now: Timestamp) -> bool {
        match self.classify(mutation) {
            MutationStatus::Failed => false,
            MutationStatus::Pending => true,
            MutationStatus::Retrying => {
                let delay = self.backoff.delay(mutation.retry_count);
                mutation
                    .last_attempt
                    .is_none_or(|at| !at.saturating_add(delay).is_after(&now))
            }
        }
    }

    /// Whether any entry is due now.
    pub async fn has_due(&self) -> bool {
        let now = Timestamp::now();
        self.queue.lock().await.iter().any(|m| self.is_due(m, now))
    }

    /// Rewrites the persisted queue from memory.
    pub(crate) async fn flush(&self) {
        let queue = self.queue.lock().await;
        self.persist(&queue).await;
    }

    // ── Internals ────────────────────────────────────────────────

    async fn remove(&self, id: MutationId) -> SyncResult<QueuedMutation> {
        let mut queue = self.queue.lock().await;
        let index = queue
            .iter()
            .position(|m| m.id == id)
            .ok_or(SyncError::MutationNotFound(id))?;
        let removed = queue.remove(index);
        self.persist(&queue).await;
        Ok(removed)
    }

    fn counts(&self, queue: &[QueuedMutation]) -> (usize, usize) {
        let failed = queue
            .iter()
            .filter(|m| self.classify(m) == MutationStatus::Failed)
            .count();
        (queue.len(), failed)
    }

    /// Writes the queue and the derived counts. Called with the queue lock
    /// held, so both land in the same logical operation.
    async fn persist(&self, queue: &[QueuedMutation]) {
        let written = self.write_namespace(queue).await;
        let ok = match written {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to persist outbox ({} entries): {}", queue.len(), e);
                false
            }
        };
        let (total, failed) = self.counts(queue);
        self.state
            .update(|s| {
                s.pending_mutations = total;
                s.failed_mutations = failed;
                s.note_write(Namespace::Outbox, ok);
            })
            .await;
    }

    async fn write_namespace(&self, queue: &[QueuedMutation]) -> Result<(), StoreError> {
        let entries = queue
            .iter()
            .enumerate()
            .map(|(position, m)| serde_json::to_value(m).map(|v| (format!("{position:010}"), v)))
            .collect::<Result<Vec<_>, _>>()?;
        self.store.replace_namespace(Namespace::Outbox, entries).await
    }
}
