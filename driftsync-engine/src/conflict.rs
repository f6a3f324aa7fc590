//! Conflict detection, storage and field comparison.
//!
//! A conflict is detected, never assumed: a queued update or delete carries
//! the `updatedAt` of the record it was based on, and only when the remote
//! record is strictly newer does the write turn into a [`DataConflict`].
//! Conflicts are kept after resolution for traceability.

use crate::cache::QueryKey;
use crate::error::{SyncError, SyncResult};
use crate::outbox::{NewMutation, QueuedMutation};
use crate::remote::RemoteSnapshot;
use crate::state::StateCell;
use driftsync_store::{DurableStore, Namespace, StoreError};
use driftsync_types::{ConflictId, MutationKind, Resolution, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Identity and audit fields that never count as a difference.
pub const IGNORED_FIELDS: [&str; 3] = ["id", "createdAt", "updatedAt"];

/// A divergence between a queued local write and the current remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConflict {
    pub id: ConflictId,
    pub entity: String,
    pub entity_id: String,
    pub local_data: Value,
    pub remote_data: Value,
    pub local_timestamp: Timestamp,
    pub remote_timestamp: Timestamp,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_entry: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<Timestamp>,
    /// The originating write, kept so the local side can be re-issued.
    pub kind: MutationKind,
    pub procedure: String,
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<QueryKey>,
}

impl DataConflict {
    /// Builds the conflict that replaces `mutation`.
    pub fn from_mutation(mutation: &QueuedMutation, remote: &RemoteSnapshot) -> Self {
        Self {
            id: ConflictId::new(),
            entity: mutation.entity.clone(),
            entity_id: mutation.entity_id.clone(),
            local_data: mutation.data.clone(),
            remote_data: remote.data.clone(),
            local_timestamp: mutation.timestamp,
            remote_timestamp: remote.updated_at,
            resolved: false,
            resolution: None,
            audit_entry: None,
            resolved_at: None,
            kind: mutation.kind,
            procedure: mutation.procedure.clone(),
            args: mutation.args.clone(),
            cache_key: mutation.cache_key.clone(),
        }
    }

    /// The fields that differ between the two sides.
    pub fn conflicting_fields(&self) -> Vec<FieldDiff> {
        conflicting_fields(&self.local_data, &self.remote_data)
    }

    /// The local write, re-issued without a base version so it applies
    /// unconditionally.
    pub fn local_write(&self) -> NewMutation {
        NewMutation {
            kind: self.kind,
            entity: self.entity.clone(),
            entity_id: self.entity_id.clone(),
            data: self.local_data.clone(),
            original_data: None,
            procedure: self.procedure.clone(),
            args: self.args.clone(),
            cache_key: self.cache_key.clone(),
        }
    }

    /// The cached read showing this entity.
    pub fn read_key(&self) -> QueryKey {
        self.cache_key.clone().unwrap_or_else(|| {
            QueryKey::new(format!("{}.get", self.entity), vec![json!(self.entity_id)])
        })
    }
}

/// Whether replaying `mutation` would overwrite a newer remote record.
///
/// Creates never conflict. Mutations without a base version, and records the
/// remote side no longer has, proceed.
pub fn detect(mutation: &QueuedMutation, remote: Option<&RemoteSnapshot>) -> bool {
    if !mutation.kind.needs_conflict_check() {
        return false;
    }
    match (mutation.base_version(), remote) {
        (Some(base), Some(snapshot)) => snapshot.updated_at.is_after(&base),
        _ => false,
    }
}

/// One differing field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    /// Local value, `None` when the field is absent locally.
    pub local: Option<Value>,
    /// Remote value, `None` when the field is absent remotely.
    pub remote: Option<Value>,
}

/// Compares two records key by key with deep equality.
///
/// Ignores [`IGNORED_FIELDS`]. Results are sorted by field name. Values that
/// are not both objects are compared whole and reported as field `"value"`.
pub fn conflicting_fields(local: &Value, remote: &Value) -> Vec<FieldDiff> {
    let (Value::Object(local), Value::Object(remote)) = (local, remote) else {
        if local == remote {
            return Vec::new();
        }
        return vec![FieldDiff {
            field: "value".to_string(),
            local: Some(local.clone()),
            remote: Some(remote.clone()),
        }];
    };

    let fields: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
    fields
        .into_iter()
        .filter(|field| !IGNORED_FIELDS.contains(&field.as_str()))
        .filter_map(|field| {
            let l = local.get(field);
            let r = remote.get(field);
            (l != r).then(|| FieldDiff {
                field: field.clone(),
                local: l.cloned(),
                remote: r.cloned(),
            })
        })
        .collect()
}

/// Durable record of detected conflicts, persisted in the `conflicts`
/// namespace in detection order.
pub struct ConflictStore {
    store: Arc<dyn DurableStore>,
    state: Arc<StateCell>,
    conflicts: Mutex<Vec<DataConflict>>,
}

impl ConflictStore {
    /// Loads persisted conflicts and publishes the unresolved count.
    pub(crate) async fn load(store: Arc<dyn DurableStore>, state: Arc<StateCell>) -> Self {
        let conflicts: Vec<DataConflict> = match store.entries(Namespace::Conflicts).await {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|(key, value)| match serde_json::from_value(value) {
                    Ok(conflict) => Some(conflict),
                    Err(e) => {
                        warn!("Skipping unreadable conflict {}: {}", key, e);
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!("Failed to load conflicts, starting empty: {}", e);
                Vec::new()
            }
        };
        let unresolved = conflicts.iter().filter(|c| !c.resolved).count();
        state.update(|s| s.unresolved_conflicts = unresolved).await;

        Self {
            store,
            state,
            conflicts: Mutex::new(conflicts),
        }
    }

    /// Stores a newly detected conflict.
    pub(crate) async fn record(&self, conflict: DataConflict) -> ConflictId {
        let id = conflict.id;
        let mut conflicts = self.conflicts.lock().await;
        info!(
            "Conflict {} detected on {} {} (remote updated {})",
            id, conflict.entity, conflict.entity_id, conflict.remote_timestamp
        );
        conflicts.push(conflict);
        self.persist(&conflicts).await;
        id
    }

    /// Returns the conflict if it exists and is still unresolved.
    pub async fn unresolved(&self, id: ConflictId) -> SyncResult<DataConflict> {
        let conflicts = self.conflicts.lock().await;
        let conflict = conflicts
            .iter()
            .find(|c| c.id == id)
            .ok_or(SyncError::ConflictNotFound(id))?;
        if conflict.resolved {
            return Err(SyncError::ConflictAlreadyResolved(id));
        }
        Ok(conflict.clone())
    }

    /// Records a resolution. `Merged` is refused.
    pub(crate) async fn mark_resolved(
        &self,
        id: ConflictId,
        resolution: Resolution,
        audit_entry: Option<Value>,
    ) -> SyncResult<DataConflict> {
        if resolution == Resolution::Merged {
            return Err(SyncError::MergeNotSupported);
        }
        let mut conflicts = self.conflicts.lock().await;
        let conflict = conflicts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(SyncError::ConflictNotFound(id))?;
        if conflict.resolved {
            return Err(SyncError::ConflictAlreadyResolved(id));
        }
        conflict.resolved = true;
        conflict.resolution = Some(resolution);
        conflict.resolved_at = Some(Timestamp::now());
        conflict.audit_entry = audit_entry;
        let resolved = conflict.clone();
        info!("Conflict {} resolved as {}", id, resolution);
        self.persist(&conflicts).await;
        Ok(resolved)
    }

    /// Looks up any conflict, resolved or not.
    pub async fn get(&self, id: ConflictId) -> Option<DataConflict> {
        self.conflicts.lock().await.iter().find(|c| c.id == id).cloned()
    }

    /// Every conflict in detection order.
    pub async fn all(&self) -> Vec<DataConflict> {
        self.conflicts.lock().await.clone()
    }

    /// Unresolved conflicts in detection order.
    pub async fn pending(&self) -> Vec<DataConflict> {
        self.conflicts
            .lock()
            .await
            .iter()
            .filter(|c| !c.resolved)
            .cloned()
            .collect()
    }

    /// Rewrites the persisted conflicts from memory.
    pub(crate) async fn flush(&self) {
        let conflicts = self.conflicts.lock().await;
        self.persist(&conflicts).await;
    }

    async fn persist(&self, conflicts: &[DataConflict]) {
        let written = self.write_namespace(conflicts).await;
        let ok = match written {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to persist conflicts: {}", e);
                false
            }
        };
        let unresolved = conflicts.iter().filter(|c| !c.resolved).count();
        self.state
            .update(|s| {
                s.unresolved_conflicts = unresolved;
                s.note_write(Namespace::Conflicts, ok);
            })
            .await;
    }

    async fn write_namespace(&self, conflicts: &[DataConflict]) -> Result<(), StoreError> {
        let entries = conflicts
            .iter()
            .enumerate()
            .map(|(position, c)| serde_json::to_value(c).map(|v| (format!("{position:010}"), v)))
            .collect::<Result<Vec<_>, _>>()?;
        self.store.replace_namespace(Namespace::Conflicts, entries).await
    }
}
