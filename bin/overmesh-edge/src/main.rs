//! Overmesh edge daemon
//!
//! Brings up the tun device, serves the data plane for inbound peers, and
//! keeps the control connection to the controller alive.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use overmesh::EdgeConfig;

/// Overmesh edge daemon
#[derive(Parser)]
#[command(name = "overmesh-edge", version, about = "Overmesh edge daemon")]
struct Cli {
    /// Path to the edge configuration file
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overmesh=info,overmesh_edge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = EdgeConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    run(config).await
}

#[cfg(target_os = "linux")]
async fn run(config: EdgeConfig) -> Result<()> {
    use std::sync::Arc;

    use overmesh::{
        DataPlaneServer, EdgeClient, OsRoutes, OsTun, PeerManager, StatCollector, TunDevice,
    };

    let tun: Arc<dyn TunDevice> =
        Arc::new(OsTun::open(&config.tun.name, config.tun.mtu).context("opening tun device")?);
    tracing::info!(dev = tun.name(), mtu = config.tun.mtu, "tun device up");

    let stats = Arc::new(StatCollector::new());
    let peers = PeerManager::new(
        Arc::clone(&tun),
        Arc::clone(&stats),
        Arc::new(OsRoutes),
        config.peer_config(),
    );

    let data_plane = DataPlaneServer::new(Arc::clone(&tun), Arc::clone(&stats));
    let listen_addr = config.listen_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = data_plane.serve(&listen_addr).await {
            tracing::error!(error = %e, "data plane stopped");
            std::process::exit(1);
        }
    });

    tokio::spawn(Arc::clone(&peers).run_outbound());

    let client = EdgeClient::new(config.client_config(), peers, stats);
    client.run().await;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_config: EdgeConfig) -> Result<()> {
    anyhow::bail!("the edge daemon needs a linux tun device")
}
