#![forbid(unsafe_code)]
//! TopayChain node: storage, ledger, replication and the HTTP API

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use topaychain::node::{Node, NodeOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file (defaults to config.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,
    /// API port, overriding the config
    #[arg(long)]
    port: Option<u16>,
    /// Directory holding the database and backups
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Start auto-mining to this address once the node is up
    #[arg(long)]
    miner_address: Option<String>,
    /// Fail instead of creating a new chain when storage is empty
    #[arg(long)]
    restore: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let options = NodeOptions {
        config_path: cli.config,
        api_port: cli.port,
        data_dir: cli.data_dir,
        miner_address: cli.miner_address,
        require_restore: cli.restore,
    };

    let node = Arc::new(Node::init(options).await?);
    node.run().await?;
    Ok(())
}
