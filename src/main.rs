//! # Sendlane — Broadcast Delivery Engine
//!
//! Drains campaign and sequence queues through fleets of sending devices,
//! with human-like pacing and cross-process deduplication.
//!
//! Usage:
//!   sendlane                           # Start the engine with defaults
//!   sendlane --config ./custom.toml    # Custom config file
//!   sendlane --db ./sendlane.db        # Database path override
//!   sendlane tick-once                 # Run one trigger pass and exit
//!   sendlane status campaign:42        # Delivery progress of one broadcast
//!   sendlane depth dev-1               # Pending queue depth of one device

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sendlane_broadcast::{
    BroadcastManager, DryRunTransport, TemplateComposer, WorkerContext, start_broadcast_processor,
};
use sendlane_core::config::SendlaneConfig;
use sendlane_core::traits::{CoordinationStore, MessageStore};
use sendlane_core::types::{BroadcastKind, PoolKey};
use sendlane_scheduler::{SequenceStateMachine, TriggerScheduler, start_trigger_scheduler};
use sendlane_store::SqliteStore;

#[derive(Parser)]
#[command(name = "sendlane", version, about = "📬 Sendlane — Broadcast Delivery Engine")]
struct Cli {
    /// Config file path (default: ~/.sendlane/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path override
    #[arg(long)]
    db: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the delivery engine (the default)
    Run,
    /// Run the campaign and sequence triggers once, then exit
    TickOnce,
    /// Delivery progress of one broadcast ("campaign:<id>" or "sequence:<id>")
    Status { broadcast: String },
    /// How many pending messages a device still owns
    Depth { device: String },
}

/// "campaign:42" / "sequence:s1" → the pool key those messages route through.
fn parse_pool_key(s: &str) -> Result<PoolKey> {
    let (kind, id) = s
        .split_once(':')
        .with_context(|| format!("expected <kind>:<id> (e.g. campaign:42), got '{s}'"))?;
    let kind = match kind {
        "campaign" => BroadcastKind::Campaign,
        "sequence" => BroadcastKind::Sequence,
        other => anyhow::bail!("unknown broadcast kind '{other}' (campaign or sequence)"),
    };
    Ok(PoolKey::new(kind, id))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "sendlane=debug" } else { "sendlane=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => SendlaneConfig::load_from(path)?,
        None => SendlaneConfig::load()?,
    };
    if let Some(db) = cli.db {
        config.store.path = db;
    }
    if let Some(parent) = config.store.path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    // One SQLite file carries both capabilities: the queue of record and
    // the coordination locks every engine process shares
    let sqlite = Arc::new(
        SqliteStore::open(&config.store.path)
            .with_context(|| format!("opening store at {}", config.store.path.display()))?,
    );
    let store: Arc<dyn MessageStore> = sqlite.clone();
    let coord: Arc<dyn CoordinationStore> = sqlite;
    tracing::info!("💾 Store opened at {}", config.store.path.display());

    match cli.command.unwrap_or(Command::Run) {
        Command::TickOnce => {
            let scheduler = TriggerScheduler::new(store, config.scheduler);
            let (campaigns, sequences) = scheduler.tick_once().await?;
            println!("Triggered {campaigns} campaign and {sequences} sequence messages");
            Ok(())
        }
        Command::Status { broadcast } => {
            let key = parse_pool_key(&broadcast)?;
            let counts = store.broadcast_counts(&key).await?;
            println!(
                "{key}: {:.1}% complete — {} sent, {} failed, {} pending, {} queued ({} total)",
                counts.completion_percent(),
                counts.sent,
                counts.failed,
                counts.pending,
                counts.queued,
                counts.total
            );
            Ok(())
        }
        Command::Depth { device } => {
            let depth = store.pending_depth(&device).await?;
            println!("{device}: {depth} pending");
            Ok(())
        }
        Command::Run => {
            let ctx = Arc::new(WorkerContext {
                store: store.clone(),
                coord,
                transport: Arc::new(DryRunTransport::new()),
                composer: Arc::new(TemplateComposer::new()),
                state_machine: Arc::new(SequenceStateMachine::new(store.clone())),
                delivery: config.delivery.clone(),
                process_id: format!("sendlane-{}", std::process::id()),
            });

            let manager = BroadcastManager::initialize(ctx, config.pools.clone()).await?;
            start_trigger_scheduler(store.clone(), config.scheduler.clone());
            start_broadcast_processor(manager.clone(), store, config.scheduler.clone());

            tracing::info!("🚀 Sendlane engine running — Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;

            tracing::info!("Shutting down...");
            manager.shutdown_all().await;
            Ok(())
        }
    }
}
