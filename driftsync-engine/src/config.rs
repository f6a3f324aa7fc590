//! Engine configuration.

use serde::Deserialize;
use std::time::Duration;

/// Configuration for the sync engine.
///
/// Every field has a default, so a partial JSON document (or none at all)
/// is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts after which a mutation is classified failed.
    pub max_retries: u32,
    /// First backoff step in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff cap in milliseconds.
    pub backoff_max_ms: u64,
    /// How many entities are drained concurrently.
    pub drain_concurrency: usize,
    /// TTL applied to cache writes that do not pass their own.
    pub default_cache_ttl_ms: Option<u64>,
    /// Period of the background cache sweep / retry tick, in seconds.
    pub maintenance_interval_secs: u64,
    /// Cache entries written under another version are treated as stale.
    pub cache_version: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            drain_concurrency: 4,
            default_cache_ttl_ms: None,
            maintenance_interval_secs: 30,
            cache_version: 1,
        }
    }
}

impl SyncConfig {
    /// Parses a configuration from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub(crate) fn default_cache_ttl(&self) -> Option<Duration> {
        self.default_cache_ttl_ms.map(Duration::from_millis)
    }

    pub(crate) fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    pub(crate) fn concurrency(&self) -> usize {
        self.drain_concurrency.max(1)
    }
}
