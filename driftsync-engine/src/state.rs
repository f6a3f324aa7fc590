//! Offline state tracking.
//!
//! [`OfflineState`] is the single per-profile summary the UI polls: network
//! state, when we were last online, and the sizes of the outbox and the
//! conflict store. The engine owns the only mutable copy inside a
//! [`StateCell`]; every component that changes one of the counted stores
//! updates the cell inside the same logical operation, and readers only ever
//! see cloned snapshots.
//!
//! Storage health is tracked per namespace: a failed write marks its
//! namespace degraded until that same namespace is written successfully, so
//! a healthy write elsewhere never hides a queue that is missing on disk.

use driftsync_store::{DurableStore, Namespace, StoreError};
use driftsync_types::{NetworkState, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const STATE_KEY: &str = "offline";

/// Message shown to the user while persistence is failing.
pub const STORAGE_WARNING: &str = "changes may not be saved for offline use";

/// Snapshot of the engine's offline state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineState {
    /// Current connectivity.
    pub network_state: NetworkState,
    /// Last time the state machine left `online`.
    pub last_online: Option<Timestamp>,
    /// Mutations in the outbox, failed ones included.
    pub pending_mutations: usize,
    /// Outbox entries classified failed (rejected or out of retries).
    pub failed_mutations: usize,
    /// Conflicts still waiting for a resolution.
    pub unresolved_conflicts: usize,
    /// Some namespace on disk lags behind its in-memory copy.
    pub storage_degraded: bool,
    /// The namespaces whose latest write failed.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub degraded_namespaces: BTreeSet<Namespace>,
}

impl Default for OfflineState {
    fn default() -> Self {
        Self {
            network_state: NetworkState::Offline,
            last_online: None,
            pending_mutations: 0,
            failed_mutations: 0,
            unresolved_conflicts: 0,
            storage_degraded: false,
            degraded_namespaces: BTreeSet::new(),
        }
    }
}

impl OfflineState {
    /// The user-facing storage warning, if one applies.
    pub fn storage_warning(&self) -> Option<&'static str> {
        self.storage_degraded.then_some(STORAGE_WARNING)
    }

    /// Records the outcome of a write to `namespace`.
    pub(crate) fn note_write(&mut self, namespace: Namespace, ok: bool) {
        if ok {
            self.degraded_namespaces.remove(&namespace);
        } else {
            self.degraded_namespaces.insert(namespace);
        }
        self.storage_degraded = !self.degraded_namespaces.is_empty();
    }
}

/// Owner of the mutable [`OfflineState`].
pub(crate) struct StateCell {
    store: Arc<dyn DurableStore>,
    inner: Mutex<OfflineState>,
}

impl StateCell {
    /// Loads the persisted state, falling back to defaults.
    ///
    /// Counts are not trusted from disk; the outbox and conflict store
    /// overwrite them as soon as they load. Degradation starts clear because
    /// every component is about to load what is actually on disk.
    pub(crate) async fn load(store: Arc<dyn DurableStore>) -> Self {
        let state = match store.get(Namespace::State, STATE_KEY).await {
            Ok(Some(value)) => serde_json::from_value(value)
                .map(|persisted: OfflineState| OfflineState {
                    storage_degraded: false,
                    degraded_namespaces: BTreeSet::new(),
                    ..persisted
                })
                .unwrap_or_else(|e| {
                    warn!("Discarding unreadable offline state: {}", e);
                    OfflineState::default()
                }),
            Ok(None) => OfflineState::default(),
            Err(e) => {
                warn!("Failed to load offline state: {}", e);
                let mut state = OfflineState::default();
                state.note_write(Namespace::State, false);
                state
            }
        };
        Self {
            store,
            inner: Mutex::new(state),
        }
    }

    /// Returns a copy of the current state.
    pub(crate) async fn snapshot(&self) -> OfflineState {
        self.inner.lock().await.clone()
    }

    /// Applies `f` and persists the result.
    ///
    /// A failed persist leaves the in-memory state updated and marks the
    /// `state` namespace degraded.
    pub(crate) async fn update<F>(&self, f: F) -> OfflineState
    where
        F: FnOnce(&mut OfflineState),
    {
        let mut state = self.inner.lock().await;
        f(&mut state);

        let persisted = match serde_json::to_value(&*state) {
            Ok(value) => self.store.set(Namespace::State, STATE_KEY, value).await,
            Err(e) => Err(StoreError::Serialization(e)),
        };
        if let Err(e) = persisted {
            warn!("Failed to persist offline state: {}", e);
            state.note_write(Namespace::State, false);
        } else {
            state.note_write(Namespace::State, true);
            debug!(
                "Offline state: {} pending, {} failed, {} conflicts, {}",
                state.pending_mutations,
                state.failed_mutations,
                state.unresolved_conflicts,
                state.network_state
            );
        }
        state.clone()
    }

    /// Persists the current state unchanged.
    pub(crate) async fn flush(&self) {
        self.update(|_| {}).await;
    }
}
