use anyhow::anyhow;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chainmirror::crypto::NodeKey;
use chainmirror::explorer::{Explorer, ExplorerMessage};
use chainmirror::node::Node;
use chainmirror::{config, metrics, storage};

#[derive(Parser)]
#[command(author, version, about = "chainmirror: replays a ledger's finalize effects into a local mapping store")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Use the dev genesis and tolerate peer hash mismatches
    #[arg(long, default_value_t = false)]
    dev_mode: bool,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Sync from the configured peer (default)
    Run,
    /// Roll the local state back, then exit
    Revert {
        /// Target height; defaults to the newest cache backup
        #[arg(long)]
        height: Option<u32>,
    },
}

fn load_config(path: &str) -> anyhow::Result<config::Config> {
    match config::load(path) {
        Ok(c) => Ok(c),
        Err(e1) => {
            eprintln!("⚠️  Could not read config from '{path}': {e1:#}, using the built-in defaults");
            const EMBEDDED_CONFIG: &str = include_str!("../config.toml");
            config::load_from_str(EMBEDDED_CONFIG).map_err(|e2| anyhow!("failed to load configuration: {e1} / {e2}"))
        }
    }
}

fn log_messages(mut rx: mpsc::UnboundedReceiver<ExplorerMessage>) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                ExplorerMessage::NodeConnectError(e) => warn!("peer connect failed: {e}"),
                ExplorerMessage::NodeConnected => info!("peer connected"),
                ExplorerMessage::NodeDisconnected(reason) => warn!("peer disconnected: {reason}"),
                ExplorerMessage::DatabaseError(e) => error!("🔥 database error: {e}"),
                ExplorerMessage::BlockAdded(h) => tracing::debug!("block {h} committed"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = load_config(&cli.config)?;
    if cli.dev_mode {
        cfg.node.dev_mode = true;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log.level))
        .map_err(|e| anyhow!("invalid log filter: {e}"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("--- chainmirror ---");
    let db = storage::open(&cfg.storage)?;
    info!("🗄️  database opened at '{}'", cfg.storage.path);

    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    log_messages(msg_rx);

    let mut explorer = Explorer::open(db.clone(), &cfg, Some(msg_tx.clone()))?;
    explorer.startup()?;

    if let Some(Cmd::Revert { height }) = cli.cmd {
        // A half-applied revert is worse than a slow one.
        let ignore_interrupts = tokio::spawn(async {
            while tokio::signal::ctrl_c().await.is_ok() {
                warn!("revert in progress, interrupt ignored");
            }
        });
        let summary = tokio::task::spawn_blocking(move || explorer.revert(height)).await;
        ignore_interrupts.abort();
        let summary = summary.map_err(|e| anyhow!("revert task failed: {e}"))??;
        info!(
            "✅ reverted to height {}: {} blocks undone, {} replayed, {} history records removed",
            summary.height, summary.blocks_reverted, summary.blocks_replayed, summary.history_removed
        );
        db.close()?;
        return Ok(());
    }

    metrics::serve(cfg.metrics.clone())?;
    let key = Arc::new(NodeKey::load_or_create(&db)?);
    let (chain, explorer_task) = explorer.spawn(cfg.explorer.mailbox_size);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let node = Node::new(&cfg, chain, key, Some(msg_tx))?;
    let mut node_task = tokio::spawn(node.run(shutdown_tx.subscribe()));

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        res = &mut node_task => Some(res),
    };
    let outcome = match finished {
        Some(res) => res,
        None => {
            info!("🛑 shutting down");
            let _ = shutdown_tx.send(());
            node_task.await
        }
    };
    let outcome = outcome.map_err(|e| anyhow!("node task failed: {e}"))?;

    // The controller stops once every handle is gone; wait so an in-flight block commits.
    if let Err(e) = explorer_task.await {
        warn!("chain controller task ended abnormally: {e}");
    }
    db.close()?;
    outcome
}
