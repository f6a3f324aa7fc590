//! The sync orchestrator.
//!
//! Owns every stateful component of one profile and drives replay:
//!
//! 1. A write arrives through [`SyncOrchestrator::submit`]. When connected and
//!    nothing for the same record is queued, it is attempted immediately;
//!    otherwise it is queued and its optimistic value written to the cache.
//! 2. When connectivity comes back, [`SyncOrchestrator::drain`] replays the
//!    outbox. Records are independent, so their queues run concurrently up to
//!    `drain_concurrency`; each record's own queue is strictly sequential.
//! 3. Each attempt ends in success (entry removed, cache invalidated), a
//!    conflict (entry moved to the conflict store), a transient failure
//!    (retry bookkeeping, the record's queue stops for this cycle) or a
//!    rejection (entry kept as permanently failed).
//!
//! Writes to one record hold that record's lock from the immediate attempt
//! until any re-queue, so a later write can never reach the remote ahead of
//! an earlier one that is still in flight.

use crate::cache::{CacheOptions, QueryCache};
use crate::config::SyncConfig;
use crate::conflict::{self, ConflictStore, DataConflict, FieldDiff};
use crate::error::{SyncError, SyncResult};
use crate::network::{NetworkEvent, NetworkMonitor};
use crate::outbox::{NewMutation, Outbox, OutboxStats, QueuedMutation};
use crate::remote::{AuditSink, Remote, RemoteError, RemoteSnapshot, ResolutionRecord};
use crate::state::{OfflineState, StateCell};
use driftsync_store::{DurableStore, Namespace, StorageUsage};
use driftsync_types::{ConflictId, MutationId, MutationKind, NetworkState, Resolution, Timestamp};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What happened to a submitted write.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Executed remotely; carries the remote result.
    Applied(Value),
    /// Waiting in the outbox.
    Queued(MutationId),
    /// The remote record moved on; the write is now a conflict.
    Conflicted(ConflictId),
}

/// Result of one remote attempt, before any bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Applied(Value),
    Conflicted(RemoteSnapshot),
    TransientFailure(String),
    Rejected(String),
    Unreachable,
}

impl From<RemoteError> for AttemptOutcome {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NetworkUnavailable => Self::Unreachable,
            RemoteError::Rejected(reason) => Self::Rejected(reason),
            RemoteError::Transient(reason) => Self::TransientFailure(reason),
        }
    }
}

/// How a drain cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DrainStatus {
    /// Every record's queue was visited.
    Completed,
    /// Connectivity dropped mid-cycle; the rest waits for the next one.
    Cancelled,
    /// Another cycle was already in flight; nothing was done.
    AlreadyRunning,
    /// Not connected; nothing was done.
    Offline,
}

/// Summary of a drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub status: DrainStatus,
    pub applied: usize,
    pub conflicted: usize,
    pub failed: usize,
    /// Entries not attempted (backoff, failed head, or cancellation).
    pub skipped: usize,
}

impl DrainReport {
    fn idle(status: DrainStatus) -> Self {
        Self {
            status,
            applied: 0,
            conflicted: 0,
            failed: 0,
            skipped: 0,
        }
    }

    /// Number of entries that reached the remote collaborator.
    pub fn attempted(&self) -> usize {
        self.applied + self.conflicted + self.failed
    }
}

#[derive(Default)]
struct GroupReport {
    applied: usize,
    conflicted: usize,
    failed: usize,
    skipped: usize,
    cancelled: bool,
}

/// Offline-first sync engine for one profile.
pub struct SyncOrchestrator {
    config: SyncConfig,
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn Remote>,
    audit: Option<Arc<dyn AuditSink>>,
    state: Arc<StateCell>,
    network: NetworkMonitor,
    cache: QueryCache,
    outbox: Outbox,
    conflicts: ConflictStore,
    drain_lock: Mutex<()>,
    resolve_lock: Mutex<()>,
    record_locks: Mutex<HashMap<RecordKey, Arc<Mutex<()>>>>,
}

type RecordKey = (String, String);

impl SyncOrchestrator {
    /// Loads a profile from `store`.
    ///
    /// `initial` is the connectivity known at startup; `Syncing` is treated
    /// as `Online`. Nothing is drained until asked.
    pub async fn open(
        config: SyncConfig,
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn Remote>,
        initial: NetworkState,
    ) -> Self {
        let initial = match initial {
            NetworkState::Syncing => NetworkState::Online,
            other => other,
        };
        let state = Arc::new(StateCell::load(store.clone()).await);
        state.update(|s| s.network_state = initial).await;

        let outbox = Outbox::load(store.clone(), state.clone(), &config).await;
        let conflicts = ConflictStore::load(store.clone(), state.clone()).await;
        let cache = QueryCache::load(
            store.clone(),
            state.clone(),
            config.default_cache_ttl(),
            config.cache_version,
        )
        .await;
        let network = NetworkMonitor::new(state.clone(), initial);
        info!(
            "Sync engine ready ({}, {} queued, {} unresolved conflicts)",
            initial,
            outbox.len().await,
            conflicts.pending().await.len()
        );

        Self {
            config,
            store,
            remote,
            audit: None,
            state,
            network,
            cache,
            outbox,
            conflicts,
            drain_lock: Mutex::new(()),
            resolve_lock: Mutex::new(()),
            record_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Sends every conflict resolution to `sink` as well.
    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Submits a write.
    ///
    /// Only a remote rejection of an immediate attempt is returned as an
    /// error; network and transient failures end up queued.
    pub async fn submit(&self, mutation: NewMutation) -> SyncResult<SubmitOutcome> {
        self.repair_storage().await;
        self.dispatch(mutation.into_queued()).await
    }

    /// Replays the outbox once.
    pub async fn drain(&self) -> SyncResult<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("Drain already in flight, skipping");
            return Ok(DrainReport::idle(DrainStatus::AlreadyRunning));
        };
        self.repair_storage().await;
        if self.network.current() != NetworkState::Online {
            debug!("Not draining while {}", self.network.current());
            return Ok(DrainReport::idle(DrainStatus::Offline));
        }

        if let Err(e) = self.network.apply(NetworkEvent::SyncStarted).await {
            debug!("Connectivity changed before the drain started: {}", e);
            return Ok(DrainReport::idle(DrainStatus::Offline));
        }
        let swept = self.cache.clear_expired().await;
        if swept > 0 {
            debug!("Swept {} expired cache entries before draining", swept);
        }

        let groups = group_by_record(self.outbox.entries().await);
        info!("Draining outbox: {} records", groups.len());
        let reports: Vec<GroupReport> = stream::iter(groups)
            .map(|group| self.drain_group(group))
            .buffer_unordered(self.config.concurrency())
            .collect()
            .await;

        if let Err(e) = self.network.apply(NetworkEvent::SyncFinished).await {
            // Connectivity was lost and restored during the cycle.
            debug!("Drain finished outside syncing: {}", e);
        }

        let cancelled = reports.iter().any(|r| r.cancelled);
        let mut report = DrainReport::idle(if cancelled {
            DrainStatus::Cancelled
        } else {
            DrainStatus::Completed
        });
        for r in &reports {
            report.applied += r.applied;
            report.conflicted += r.conflicted;
            report.failed += r.failed;
            report.skipped += r.skipped;
        }
        info!(
            "Drain {:?}: {} applied, {} conflicted, {} failed, {} skipped",
            report.status, report.applied, report.conflicted, report.failed, report.skipped
        );
        Ok(report)
    }

    /// Resolves a conflict.
    ///
    /// `Local` re-issues the local write without a conflict check; `Remote`
    /// drops it and invalidates the cached record. `Merged` is refused.
    ///
    /// A conflict does not hold back the record's later queued writes, which
    /// may already have been applied. `Local` re-issues the conflicted data
    /// as a new write at the tail, so it lands on top of them: choosing the
    /// local side means the conflicted version wins over everything queued
    /// after it.
    pub async fn resolve(
        &self,
        id: ConflictId,
        resolution: Resolution,
        audit_entry: Option<Value>,
    ) -> SyncResult<DataConflict> {
        if resolution == Resolution::Merged {
            return Err(SyncError::MergeNotSupported);
        }
        let _guard = self.resolve_lock.lock().await;
        let conflict = self.conflicts.unresolved(id).await?;

        match resolution {
            Resolution::Local => {
                let outcome = self.dispatch(conflict.local_write().into_queued()).await?;
                debug!("Local side of conflict {} re-issued: {:?}", id, outcome);
            }
            Resolution::Remote => self.cache.invalidate_key(&conflict.read_key()).await,
            Resolution::Merged => return Err(SyncError::MergeNotSupported),
        }

        let record = ResolutionRecord::new(id, resolution, audit_entry.clone());
        let resolved = self
            .conflicts
            .mark_resolved(id, resolution, audit_entry)
            .await?;
        if let Some(sink) = &self.audit
            && let Err(e) = sink.record(record).await
        {
            warn!("Audit sink refused resolution of conflict {}: {}", id, e);
        }
        Ok(resolved)
    }

    /// Puts a failed mutation back into rotation and drains if connected.
    pub async fn retry_mutation(&self, id: MutationId) -> SyncResult<()> {
        self.outbox.retry(id).await?;
        if self.network.current() == NetworkState::Online {
            self.drain().await?;
        }
        Ok(())
    }

    /// Drops a failed mutation and its optimistic cache entry.
    pub async fn discard_mutation(&self, id: MutationId) -> SyncResult<QueuedMutation> {
        let discarded = self.outbox.discard(id).await?;
        self.cache.invalidate_key(&discarded.read_key()).await;
        Ok(discarded)
    }

    /// Connectivity went away.
    pub async fn connectivity_lost(&self) -> NetworkState {
        match self.network.apply(NetworkEvent::ConnectivityLost).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Unexpected refusal of connectivity loss: {}", e);
                self.network.current()
            }
        }
    }

    /// Connectivity came back: go online and drain.
    pub async fn connectivity_restored(&self) -> SyncResult<DrainReport> {
        self.network
            .apply(NetworkEvent::ConnectivityRestored)
            .await?;
        self.drain().await
    }

    /// Background loop: follows a connectivity signal, sweeps the cache and
    /// retries due mutations on every maintenance tick. Returns when the
    /// signal's sender is dropped.
    pub async fn run(self: Arc<Self>, mut connectivity: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.maintenance_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let online = *connectivity.borrow_and_update();
        self.follow_connectivity(online).await;

        loop {
            tokio::select! {
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        info!("Connectivity signal closed, stopping sync loop");
                        break;
                    }
                    let online = *connectivity.borrow_and_update();
                    self.follow_connectivity(online).await;
                }
                _ = ticker.tick() => {
                    self.repair_storage().await;
                    let swept = self.cache.clear_expired().await;
                    if swept > 0 {
                        debug!("Maintenance swept {} cache entries", swept);
                    }
                    if self.network.current() == NetworkState::Online && self.outbox.has_due().await {
                        self.spawn_drain();
                    }
                }
            }
        }
    }

    /// Rewrites every namespace whose latest write failed from its
    /// in-memory copy. Returns whether storage is healthy afterwards.
    pub async fn repair_storage(&self) -> bool {
        let degraded = self.state.snapshot().await.degraded_namespaces;
        if degraded.is_empty() {
            return true;
        }
        for namespace in Namespace::ALL.into_iter().filter(|ns| degraded.contains(ns)) {
            debug!("Re-persisting {} after a failed write", namespace);
            match namespace {
                Namespace::Cache => self.cache.flush().await,
                Namespace::Outbox => self.outbox.flush().await,
                Namespace::Conflicts => self.conflicts.flush().await,
                Namespace::State => self.state.flush().await,
            }
        }
        let healthy = !self.state.snapshot().await.storage_degraded;
        if healthy {
            info!("Storage recovered, {} namespaces re-persisted", degraded.len());
        }
        healthy
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Snapshot of the offline state.
    pub async fn offline_state(&self) -> OfflineState {
        self.state.snapshot().await
    }

    /// Every conflict, resolved ones included.
    pub async fn conflicts(&self) -> Vec<DataConflict> {
        self.conflicts.all().await
    }

    pub async fn unresolved_conflicts(&self) -> Vec<DataConflict> {
        self.conflicts.pending().await
    }

    pub async fn conflict(&self, id: ConflictId) -> SyncResult<DataConflict> {
        self.conflicts
            .get(id)
            .await
            .ok_or(SyncError::ConflictNotFound(id))
    }

    /// The fields a user has to decide between.
    pub async fn conflict_fields(&self, id: ConflictId) -> SyncResult<Vec<FieldDiff>> {
        Ok(self.conflict(id).await?.conflicting_fields())
    }

    pub async fn outbox_stats(&self) -> OutboxStats {
        self.outbox.stats().await
    }

    pub async fn outbox_entries(&self) -> Vec<QueuedMutation> {
        self.outbox.entries().await
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Bytes used by the profile and, when bounded, the bytes left.
    pub async fn storage_size(&self) -> SyncResult<StorageUsage> {
        Ok(self.store.usage().await?)
    }

    pub fn network_state(&self) -> NetworkState {
        self.network.current()
    }

    pub fn subscribe_network(&self) -> watch::Receiver<NetworkState> {
        self.network.subscribe()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ── Internals ────────────────────────────────────────────────

    /// Attempts `mutation` now or queues it, holding the record's lock
    /// throughout.
    async fn dispatch(&self, mutation: QueuedMutation) -> SyncResult<SubmitOutcome> {
        let key = (mutation.entity.clone(), mutation.entity_id.clone());
        let lock = self
            .record_locks
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .clone();
        let outcome = {
            let _guard = lock.lock().await;
            self.dispatch_locked(mutation).await
        };
        drop(lock);

        let mut locks = self.record_locks.lock().await;
        if locks.get(&key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&key);
        }
        outcome
    }

    async fn dispatch_locked(&self, mutation: QueuedMutation) -> SyncResult<SubmitOutcome> {
        let queued_ahead = !self
            .outbox
            .for_entity(&mutation.entity, &mutation.entity_id)
            .await
            .is_empty();
        if !self.network.current().is_connected() || queued_ahead {
            return Ok(SubmitOutcome::Queued(self.queue(mutation).await));
        }

        match self.attempt(&mutation).await {
            AttemptOutcome::Applied(result) => {
                self.invalidate_after_write(&mutation).await;
                Ok(SubmitOutcome::Applied(result))
            }
            AttemptOutcome::Conflicted(snapshot) => {
                let conflict = DataConflict::from_mutation(&mutation, &snapshot);
                Ok(SubmitOutcome::Conflicted(self.conflicts.record(conflict).await))
            }
            AttemptOutcome::TransientFailure(reason) => {
                let id = self.queue(mutation).await;
                self.outbox.mark_failed(id, &reason).await?;
                Ok(SubmitOutcome::Queued(id))
            }
            AttemptOutcome::Unreachable => {
                self.connectivity_lost().await;
                Ok(SubmitOutcome::Queued(self.queue(mutation).await))
            }
            AttemptOutcome::Rejected(reason) => {
                warn!(
                    "Remote rejected {} {} {}: {}",
                    mutation.kind, mutation.entity, mutation.entity_id, reason
                );
                Err(SyncError::RemoteRejected(reason))
            }
        }
    }

    /// One remote attempt: conflict check for versioned updates and
    /// deletes, then the write itself.
    async fn attempt(&self, mutation: &QueuedMutation) -> AttemptOutcome {
        if mutation.kind.needs_conflict_check() && mutation.base_version().is_some() {
            match self
                .remote
                .fetch_current(&mutation.entity, &mutation.entity_id)
                .await
            {
                Ok(snapshot) => {
                    if let Some(snapshot) =
                        snapshot.filter(|s| conflict::detect(mutation, Some(s)))
                    {
                        return AttemptOutcome::Conflicted(snapshot);
                    }
                }
                Err(e) => return e.into(),
            }
        }
        match self.remote.execute(&mutation.procedure, &mutation.args).await {
            Ok(result) => AttemptOutcome::Applied(result),
            Err(e) => e.into(),
        }
    }

    /// Replays one record's queue in order.
    async fn drain_group(&self, group: Vec<QueuedMutation>) -> GroupReport {
        let mut report = GroupReport::default();
        let total = group.len();

        for (index, queued) in group.into_iter().enumerate() {
            let remaining = total - index;
            if self.network.current() == NetworkState::Offline {
                report.skipped += remaining;
                report.cancelled = true;
                break;
            }
            // Re-read: the user may have retried or discarded it meanwhile.
            let Some(mutation) = self.outbox.get(queued.id).await else {
                continue;
            };
            if !self.outbox.is_due(&mutation, Timestamp::now()) {
                debug!(
                    "{} {} blocked behind {} ({} entries)",
                    mutation.entity, mutation.entity_id, mutation.id, remaining
                );
                report.skipped += remaining;
                break;
            }

            match self.attempt(&mutation).await {
                AttemptOutcome::Applied(_) => {
                    if let Err(e) = self.outbox.mark_succeeded(mutation.id).await {
                        debug!("Applied mutation left the outbox early: {}", e);
                    }
                    self.invalidate_after_write(&mutation).await;
                    report.applied += 1;
                }
                AttemptOutcome::Conflicted(snapshot) => {
                    let conflict = DataConflict::from_mutation(&mutation, &snapshot);
                    self.conflicts.record(conflict).await;
                    if let Err(e) = self.outbox.take_for_conflict(mutation.id).await {
                        debug!("Conflicted mutation left the outbox early: {}", e);
                    }
                    report.conflicted += 1;
                }
                AttemptOutcome::TransientFailure(reason) => {
                    if let Err(e) = self.outbox.mark_failed(mutation.id, &reason).await {
                        debug!("Could not record failure: {}", e);
                    }
                    report.failed += 1;
                    report.skipped += remaining - 1;
                    break;
                }
                AttemptOutcome::Rejected(reason) => {
                    if let Err(e) = self.outbox.mark_rejected(mutation.id, &reason).await {
                        debug!("Could not record rejection: {}", e);
                    }
                    report.failed += 1;
                    report.skipped += remaining - 1;
                    break;
                }
                AttemptOutcome::Unreachable => {
                    debug!("Remote unreachable while draining {}", mutation.id);
                    self.connectivity_lost().await;
                    report.skipped += remaining;
                    report.cancelled = true;
                    break;
                }
            }
        }
        report
    }

    /// Appends to the outbox and shows the write optimistically.
    async fn queue(&self, mutation: QueuedMutation) -> MutationId {
        let key = mutation.read_key();
        match mutation.kind {
            MutationKind::Create | MutationKind::Update => {
                self.cache
                    .set(&key.procedure, &key.args, mutation.data.clone(), CacheOptions::default())
                    .await
            }
            MutationKind::Delete => self.cache.invalidate_key(&key).await,
        }
        self.outbox.enqueue(mutation).await
    }

    async fn invalidate_after_write(&self, mutation: &QueuedMutation) {
        self.cache.invalidate_key(&mutation.read_key()).await;
        let list = format!("{}.list", mutation.entity);
        // A procedure without args is always a valid invalidation.
        let _ = self.cache.invalidate(Some(&list), None).await;
    }

    async fn follow_connectivity(self: &Arc<Self>, online: bool) {
        let current = self.network.current();
        if online && current == NetworkState::Offline {
            self.spawn_restore();
        } else if !online && current != NetworkState::Offline {
            self.connectivity_lost().await;
        }
    }

    fn spawn_restore(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.connectivity_restored().await {
                warn!("Drain after reconnect failed: {}", e);
            }
        });
    }

    fn spawn_drain(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.drain().await {
                warn!("Scheduled drain failed: {}", e);
            }
        });
    }
}

/// Splits a queue snapshot into per-record queues, keeping first-appearance
/// order between records and queue order within each.
fn group_by_record(entries: Vec<QueuedMutation>) -> Vec<Vec<QueuedMutation>> {
    let mut index: HashMap<RecordKey, usize> = HashMap::new();
    let mut groups: Vec<Vec<QueuedMutation>> = Vec::new();
    for mutation in entries {
        let key = (mutation.entity.clone(), mutation.entity_id.clone());
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(mutation);
    }
    groups
}
