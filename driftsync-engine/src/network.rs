//! Network state machine.
//!
//! ```text
//!             ConnectivityLost (from any state)
//!   ┌──────────────────────────────────────────────┐
//!   ▼                                              │
//! Offline ──ConnectivityRestored──▶ Online ──SyncStarted──▶ Syncing
//!                                     ▲                       │
//!                                     └─────SyncFinished──────┘
//! ```
//!
//! `last_online` is stamped every time the machine leaves `Online`.

use crate::error::{SyncError, SyncResult};
use crate::state::StateCell;
use driftsync_types::{NetworkState, Timestamp};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkEvent {
    ConnectivityLost,
    ConnectivityRestored,
    SyncStarted,
    SyncFinished,
}

impl fmt::Display for NetworkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnectivityLost => "connectivity-lost",
            Self::ConnectivityRestored => "connectivity-restored",
            Self::SyncStarted => "sync-started",
            Self::SyncFinished => "sync-finished",
        };
        f.write_str(name)
    }
}

/// The transition table.
///
/// - `ConnectivityLost` moves any state to `Offline`.
/// - `ConnectivityRestored` moves `Offline` to `Online`; it is a no-op while
///   already `Online` or `Syncing`.
/// - `SyncStarted` is only valid from `Online`.
/// - `SyncFinished` returns `Syncing` to `Online`. After connectivity was lost
///   mid-drain it leaves `Offline` alone.
pub fn next_state(from: NetworkState, event: NetworkEvent) -> SyncResult<NetworkState> {
    use NetworkEvent::*;
    use NetworkState::*;

    match (from, event) {
        (_, ConnectivityLost) => Ok(Offline),
        (Offline | Online, ConnectivityRestored) => Ok(Online),
        (Syncing, ConnectivityRestored) => Ok(Syncing),
        (Online, SyncStarted) => Ok(Syncing),
        (Syncing, SyncFinished) => Ok(Online),
        (Offline, SyncFinished) => Ok(Offline),
        (from, event) => Err(SyncError::InvalidTransition {
            from,
            event: event.to_string(),
        }),
    }
}

/// Holds the current [`NetworkState`] and publishes every change.
pub struct NetworkMonitor {
    state: Arc<StateCell>,
    // Serialises transitions so read-check-write is atomic.
    lock: Mutex<()>,
    tx: watch::Sender<NetworkState>,
}

impl NetworkMonitor {
    pub(crate) fn new(state: Arc<StateCell>, initial: NetworkState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            state,
            lock: Mutex::new(()),
            tx,
        }
    }

    /// Applies an event, persisting the new state and stamping
    /// `last_online` when leaving `Online`.
    pub(crate) async fn apply(&self, event: NetworkEvent) -> SyncResult<NetworkState> {
        let _guard = self.lock.lock().await;
        let from = *self.tx.borrow();
        let to = next_state(from, event)?;
        if from == to {
            debug!("Network {} unchanged on {}", from, event);
            return Ok(to);
        }

        let now = Timestamp::now();
        self.state
            .update(|s| {
                s.network_state = to;
                if from == NetworkState::Online {
                    s.last_online = Some(now);
                }
            })
            .await;
        self.tx.send_replace(to);
        info!("Network {} -> {} ({})", from, to, event);
        Ok(to)
    }

    /// The current state.
    pub fn current(&self) -> NetworkState {
        *self.tx.borrow()
    }

    /// A receiver that observes every subsequent transition.
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}
