//! Forkline node binary.
//!
//! Opens the RocksDB store for one network, recovers the chain from the
//! store and the newest usable snapshot, then follows chain events until
//! interrupted. A final snapshot is written on shutdown.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use forkline_core::constants::NetworkType;
use forkline_core::error::ForklineError;
use forkline_node_lib::{ChainEvent, Node, NodeConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// Forkline node: consensus and ledger core.
#[derive(Parser, Debug)]
#[command(name = "forkline-node", version, about = "Forkline node with RocksDB storage")]
struct Args {
    /// Config file (toml, yaml or json), layered under FORKLINE_* variables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root data directory; each network gets a subdirectory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long)]
    log_format: Option<String>,

    /// Blocks held in memory before a flush
    #[arg(long)]
    cache_limit: Option<usize>,

    /// Most blocks written per flush
    #[arg(long)]
    batch_size: Option<usize>,

    /// Seconds a flush waits for the store batch (0 waits forever)
    #[arg(long)]
    batch_timeout: Option<u64>,

    /// Index every address instead of contracts and watched ones only
    #[arg(long)]
    full_address_index: bool,

    /// Extra addresses to index (comma-separated)
    #[arg(long, value_delimiter = ',')]
    watch_address: Vec<String>,

    /// Skip fsync on batch commit
    #[arg(long)]
    no_sync_writes: bool,

    /// Use the public test network.
    #[arg(long, conflicts_with = "regtest")]
    testnet: bool,

    /// Use the local regression-test network (constant difficulty).
    #[arg(long, conflicts_with = "testnet")]
    regtest: bool,
}

impl Args {
    /// Layer command-line overrides over the file and environment config.
    fn into_config(self) -> Result<NodeConfig, ForklineError> {
        let mut config = NodeConfig::load(self.config.as_deref())?;
        if self.regtest {
            config.network = NetworkType::Regtest;
        } else if self.testnet {
            config.network = NetworkType::Testnet;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(limit) = self.cache_limit {
            config.cache_limit = limit;
        }
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        if let Some(secs) = self.batch_timeout {
            config.batch_timeout_secs = secs;
        }
        config.full_address_index |= self.full_address_index;
        config.watch_addresses.extend(self.watch_address);
        if self.no_sync_writes {
            config.sync_writes = false;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            process::exit(2);
        }
    };

    init_logging(&config.log_level, &config.log_format);

    info!("Forkline Node v{}", env!("CARGO_PKG_VERSION"));
    info!("network: {:?}", config.network);
    info!("chain_dir: {:?}", config.chain_dir());
    info!(
        cache_limit = config.cache_limit,
        batch_size = config.batch_size,
        full_address_index = config.full_address_index,
        watched = config.watch_addresses.len(),
        "storage settings"
    );

    let node = match Node::open(config) {
        Ok(node) => node,
        Err(e) => {
            error!("failed to open node: {}", e);
            process::exit(1);
        }
    };

    if let Some((hash, height)) = node.chain().root() {
        info!("stored_root: height={} hash={}", height, hash);
    }
    node.finish_initial_sync();

    let mut events = node.chain().subscribe();
    let follower = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ChainEvent::BestChainChanged { tip, height, removed, .. }) => {
                    info!(%tip, height, reorg_depth = removed.len(), "best chain changed");
                }
                Ok(ChainEvent::Flushed { root, height, count }) => {
                    info!(%root, height, count, "blocks flushed");
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "chain event follower lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("Forkline node running (Ctrl+C to stop)");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down..."),
        Err(e) => error!("failed to listen for Ctrl+C: {}", e),
    }

    follower.abort();
    if let Err(e) = node.close() {
        error!("failed to close node: {}", e);
        process::exit(1);
    }
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `format = "json"` selects structured JSON output; any other value gives
/// human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
