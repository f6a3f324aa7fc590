//! Commands of the `driftsync` profile tool.
//!
//! Every command runs against a profile opened offline, so nothing here ever
//! talks to the remote collaborator: resolving a conflict as `local` queues
//! the authoritative write for the next online session.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use driftsync_engine::{
    ConflictId, MutationId, MutationStatus, OfflineState, OutboxStats, Resolution,
    SyncOrchestrator,
};
use driftsync_store::StorageUsage;
use serde::Serialize;
use serde_json::{Value, json};

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Offline state, outbox counts and storage usage
    Status,
    /// List queued mutations in replay order
    Outbox,
    /// List conflicts (unresolved only unless --all)
    Conflicts {
        #[arg(long)]
        all: bool,
    },
    /// Show the differing fields of a conflict
    Diff { id: String },
    /// Resolve a conflict: local or remote
    Resolve {
        id: String,
        resolution: String,
        /// Free-form note recorded with the resolution
        #[arg(long)]
        note: Option<String>,
    },
    /// Put a failed mutation back into the replay queue
    Retry { id: String },
    /// Drop a failed mutation
    Discard { id: String },
    /// Remove expired cache entries
    SweepCache,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    offline_state: OfflineState,
    outbox: OutboxStats,
    storage: Option<StorageUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<&'static str>,
}

/// Runs one command and returns its JSON result.
pub async fn run(engine: &SyncOrchestrator, command: &Command) -> Result<Value> {
    match command {
        Command::Status => {
            let offline_state = engine.offline_state().await;
            let warning = offline_state.storage_warning();
            let report = StatusReport {
                outbox: engine.outbox_stats().await,
                storage: engine.storage_size().await.ok(),
                warning,
                offline_state,
            };
            Ok(serde_json::to_value(report)?)
        }
        Command::Outbox => {
            let outbox = engine.outbox();
            let rows: Vec<Value> = engine
                .outbox_entries()
                .await
                .into_iter()
                .map(|m| {
                    let status: MutationStatus = outbox.classify(&m);
                    json!({
                        "id": m.id,
                        "status": status,
                        "type": m.kind,
                        "entity": m.entity,
                        "entityId": m.entity_id,
                        "retryCount": m.retry_count,
                        "error": m.error,
                        "timestamp": m.timestamp,
                    })
                })
                .collect();
            Ok(Value::Array(rows))
        }
        Command::Conflicts { all } => {
            let conflicts = if *all {
                engine.conflicts().await
            } else {
                engine.unresolved_conflicts().await
            };
            Ok(serde_json::to_value(conflicts)?)
        }
        Command::Diff { id } => {
            let fields = engine.conflict_fields(parse_conflict(id)?).await?;
            Ok(serde_json::to_value(fields)?)
        }
        Command::Resolve {
            id,
            resolution,
            note,
        } => {
            let resolution = parse_resolution(resolution)?;
            let entry = note.as_ref().map(|note| json!({ "note": note }));
            let resolved = engine
                .resolve(parse_conflict(id)?, resolution, entry)
                .await?;
            Ok(serde_json::to_value(resolved)?)
        }
        Command::Retry { id } => {
            let id = parse_mutation(id)?;
            engine.retry_mutation(id).await?;
            Ok(json!({ "retried": id }))
        }
        Command::Discard { id } => {
            let discarded = engine.discard_mutation(parse_mutation(id)?).await?;
            Ok(serde_json::to_value(discarded)?)
        }
        Command::SweepCache => {
            let removed = engine.cache().clear_expired().await;
            Ok(json!({ "removed": removed }))
        }
    }
}

fn parse_conflict(id: &str) -> Result<ConflictId> {
    ConflictId::parse(id).with_context(|| format!("Invalid conflict id: {id}"))
}

fn parse_mutation(id: &str) -> Result<MutationId> {
    MutationId::parse(id).with_context(|| format!("Invalid mutation id: {id}"))
}

fn parse_resolution(value: &str) -> Result<Resolution> {
    match value.parse::<Resolution>() {
        Ok(Resolution::Merged) => bail!("merged resolution is not supported yet; use local or remote"),
        Ok(resolution) => Ok(resolution),
        Err(e) => Err(e).context("Resolution must be local or remote"),
    }
}
