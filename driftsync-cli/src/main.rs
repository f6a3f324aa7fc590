//! driftsync profile tool
//!
//! Inspects and repairs the offline sync state of a client profile:
//! outbox contents, conflicts, failed mutations and the query cache.
//!
//! Usage:
//!   driftsync --db profile.db status
//!   driftsync --db profile.db resolve <conflict-id> remote
//!
//! The profile is opened offline. Writes made here (a `local` resolution,
//! a manual retry) are replayed by the client the next time it is online.

use std::{fs, path::PathBuf, sync::Arc};
use anyhow::{Context, Result};
use clap::Parser;
use driftsync_cli::{Command, run};
use driftsync_engine::{Disconnected, NetworkState, SyncConfig, SyncOrchestrator};
use driftsync_store::SqliteStore;
use tracing::{Level, debug, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "driftsync")]
#[command(about = "Inspect and repair a driftsync offline profile")]
struct Args {
    /// Path to the profile database
    #[arg(short, long, default_value = "driftsync.db")]
    db: PathBuf,

    /// Path to a JSON engine configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = load_config(args.config.as_ref())?;
    debug!("Engine config: {:?}", config);

    let store = SqliteStore::open(&args.db)
        .with_context(|| format!("Failed to open profile {}", args.db.display()))?;
    info!("Opened profile {}", args.db.display());

    let engine = SyncOrchestrator::open(
        config,
        Arc::new(store),
        Arc::new(Disconnected),
        NetworkState::Offline,
    )
    .await;

    let output = run(&engine, &args.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    SyncConfig::from_json(&text).context("Failed to parse engine config")
}
