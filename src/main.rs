// ============================================================================
// LEDGER NODE
// ============================================================================
//
// Runs a single-writer ledger node: produces a block every
// `producer.block_interval_ms`, prunes expired pool entries, and mirrors
// committed state to the configured store.
//
// Configuration:
//   LEDGER_CONFIG=<file.json>    node config (defaults otherwise)
//   LEDGER_GENESIS=<file.json>   genesis allocation (fresh keys otherwise)
//                                a data_dir only reopens with the genesis it was built from
//   LEDGER_*                     individual overrides, see config.rs
//
// Run:  RUST_LOG=info,ledger_core=debug cargo run

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ledger_core::config::NodeConfig;
use ledger_core::consensus::HeuristicJudge;
use ledger_core::crypto::Keypair;
use ledger_core::ledger::GenesisConfig;
use ledger_core::protocol::now_millis;
use ledger_core::Node;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const POOL_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

fn load_config() -> Result<NodeConfig, ledger_core::Error> {
    match std::env::var("LEDGER_CONFIG") {
        Ok(path) => {
            let mut config = NodeConfig::from_json_file(&path)?;
            config.apply_env()?;
            config.validate()?;
            info!(path = %path, "Loaded config file");
            Ok(config)
        }
        Err(_) => Ok(NodeConfig::from_env()?),
    }
}

fn load_genesis() -> Result<GenesisConfig, Box<dyn std::error::Error>> {
    if let Ok(path) = std::env::var("LEDGER_GENESIS") {
        let raw = std::fs::read_to_string(&path)?;
        let genesis: GenesisConfig = serde_json::from_str(&raw)?;
        info!(path = %path, allocations = genesis.allocations.len(), "Loaded genesis file");
        return Ok(genesis);
    }

    let genesis = Keypair::generate();
    let faucet = Keypair::generate();
    let treasury = Keypair::generate();
    info!(genesis = %genesis.address(), faucet = %faucet.address(), treasury = %treasury.address(), "Generated genesis accounts");
    Ok(GenesisConfig::standard(
        genesis.address(),
        faucet.address(),
        treasury.address(),
        now_millis(),
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    warn!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ledger_core=debug")))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .init();

    info!(version = VERSION, "Starting ledger node");

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    let genesis = match load_genesis() {
        Ok(genesis) => genesis,
        Err(e) => {
            error!(error = %e, "Failed to load genesis");
            return ExitCode::FAILURE;
        }
    };

    let node = match Node::new(config, genesis, Arc::new(HeuristicJudge::new())) {
        Ok(node) => Arc::new(node),
        Err(e) => {
            error!(error = %e, "Failed to initialize node");
            return ExitCode::FAILURE;
        }
    };

    let producer_task = node.spawn_producer();

    let pruner = Arc::clone(&node);
    let prune_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POOL_PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            pruner.prune_pool();
        }
    });

    info!(
        interval_ms = node.config().producer.block_interval_ms,
        state_root = %node.state_root(),
        "Node running"
    );

    shutdown_signal().await;

    producer_task.abort();
    prune_task.abort();
    let _ = producer_task.await;
    let _ = prune_task.await;

    let stats = node.chain_stats();
    let durability_gaps = node.durability_gaps();
    match Arc::try_unwrap(node) {
        Ok(node) => node.shutdown().await,
        Err(node) => {
            warn!("Node still shared at shutdown, flushing only");
            node.flush().await;
        }
    }
    info!(
        height = stats.height,
        reorganizations = stats.reorganizations,
        durability_gaps,
        "Node stopped"
    );
    ExitCode::SUCCESS
}
