//! shard-pool command line.
//!
//! ```text
//! shard-pool check <file>       parse a configuration document, print the result as JSON
//! shard-pool run --config <file> [--identity <id>] [--metrics-address <addr>]
//!                               keep a pool for the document alive, reload on change / SIGHUP
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;

use shard_pool::config::{parse, FileConfigSource};
use shard_pool::lifecycle::{next_signal, Shutdown, Signal};
use shard_pool::node::TcpConnector;
use shard_pool::observability::{logging, metrics};
use shard_pool::pool::PoolRegistry;
use shard_pool::ShardedClient;

#[derive(Parser)]
#[command(name = "shard-pool")]
#[command(about = "Connection pools for a sharded cache cluster", long_about = None)]
struct Cli {
    /// Default log level when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration document
    Check {
        path: PathBuf,
    },
    /// Keep a pool alive and follow configuration changes
    Run {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long, default_value = "shards/default")]
        identity: String,

        /// Serve Prometheus metrics on this address
        #[arg(long)]
        metrics_address: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.command {
        Commands::Check { path } => check(path),
        Commands::Run {
            config,
            identity,
            metrics_address,
        } => run(config, identity, metrics_address).await,
    }
}

fn check(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(&path)?;
    let (topology, policy) = parse(&raw)?;

    let report = json!({
        "path": path.display().to_string(),
        "fingerprint": topology.fingerprint(),
        "nodes": topology.endpoints().map(|e| e.to_string()).collect::<Vec<_>>(),
        "policy": policy,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run(
    config: PathBuf,
    identity: String,
    metrics_address: Option<SocketAddr>,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(config = %config.display(), identity = %identity, "shard-pool starting");

    if let Some(addr) = metrics_address {
        metrics::init_metrics(addr)?;
    }

    let source = Arc::new(FileConfigSource::open(&config)?);
    source.watch()?;

    let shutdown = Shutdown::new();
    let registry = Arc::new(PoolRegistry::new());
    let client = ShardedClient::connect(
        identity,
        source.clone(),
        Arc::new(TcpConnector::new()),
        registry.clone(),
        &shutdown,
    )
    .await?;

    let pool = client.current()?;
    tracing::info!(
        identity = %client.identity(),
        generation = pool.generation(),
        topology = %pool.topology(),
        "Pool ready"
    );
    drop(pool);

    loop {
        match next_signal().await? {
            Signal::Reload => {
                tracing::info!(path = %source.path().display(), "Re-reading configuration");
                source.reload();
            }
            Signal::Terminate => break,
        }
    }

    tracing::info!("Shutdown signal received");
    let stats = client.reload_stats();
    shutdown.trigger();
    let closed = registry.shutdown().await;

    if let Some(stats) = stats {
        tracing::info!(
            rebuilds = stats.rebuilds(),
            skipped = stats.skipped(),
            failed = stats.failed(),
            "Reload summary"
        );
    }
    tracing::info!(pools = closed, "Shutdown complete");
    Ok(())
}
