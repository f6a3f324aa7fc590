//! Small enums shared by persisted records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of write a queued mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    /// Whether a mutation of this kind targets an existing remote record and
    /// therefore has to be checked for concurrent remote edits.
    #[must_use]
    pub const fn needs_conflict_check(&self) -> bool {
        matches!(self, Self::Update | Self::Delete)
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// How a conflict was (or is to be) resolved.
///
/// `Merged` is reserved for a future field-level merge. It round-trips
/// through storage but the resolver refuses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Local,
    Remote,
    Merged,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::Merged => write!(f, "merged"),
        }
    }
}

impl FromStr for Resolution {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "merged" => Ok(Self::Merged),
            other => Err(crate::Error::UnknownVariant {
                kind: "resolution",
                value: other.to_string(),
            }),
        }
    }
}

/// Connectivity as seen by the network state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    Online,
    Offline,
    Syncing,
}

impl NetworkState {
    /// Whether the remote collaborator is reachable in this state.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Online | Self::Syncing)
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::Syncing => write!(f, "syncing"),
        }
    }
}
