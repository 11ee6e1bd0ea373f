//! bllvm-connman: run the connection manager standalone
//!
//! Usage:
//!   bllvm-connman --config connman.toml --listen 0.0.0.0:18444 --connect 10.0.0.2:18444

use anyhow::Context;
use bllvm_connman::config::NodeConfig;
use bllvm_connman::network::handshake::HandshakeHandler;
use bllvm_connman::network::protocol::ChainNetwork;
use bllvm_connman::network::ConnectionManager;
use bllvm_connman::utils::{create_shutdown_channel, init_logging_from_config, wait_for_shutdown_signal};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "bllvm-connman", version, about = "Peer connection manager with an inline firewall")]
struct Args {
    /// Configuration file (JSON, or TOML by extension)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for banlist.dat and peers.dat
    #[arg(long)]
    datadir: Option<PathBuf>,

    /// Address to accept inbound peers on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Outbound peer to dial at start (repeatable)
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// mainnet, testnet or regtest
    #[arg(long)]
    network: Option<ChainNetwork>,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => NodeConfig::default(),
        };
        if let Some(dir) = &self.datadir {
            config.storage.data_dir = dir.to_string_lossy().into_owned();
        }
        if let Some(addr) = self.listen {
            config.network.listen_addr = Some(addr);
        }
        if !self.connect.is_empty() {
            config.network.connect = self.connect.clone();
        }
        if let Some(network) = self.network {
            config.network.network = network;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    init_logging_from_config(config.logging.as_ref());

    info!("Data directory: {}", config.storage.data_dir);
    let manager = Arc::new(ConnectionManager::new(
        config,
        Box::new(HandshakeHandler::default()),
    ));
    {
        let manager = Arc::clone(&manager);
        tokio::task::spawn_blocking(move || manager.start())
            .await
            .context("Startup task failed")??;
    }
    if let Some(addr) = manager.local_addr() {
        info!("Listening on {}", addr);
    }

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let maintenance = tokio::spawn(Arc::clone(&manager).run_maintenance(shutdown_rx));

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = maintenance.await {
        warn!("Maintenance task failed: {}", e);
    }
    tokio::task::spawn_blocking(move || manager.shutdown())
        .await
        .context("Shutdown task failed")?;
    Ok(())
}
