use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use spacesync::{crypto::derive_peer_id, http, relay::Relay};
use tokio::{
    task::spawn_blocking,
    time::{interval, Duration},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "spacesync-node")]
#[command(about = "Relay node hosting replicated spaces", long_about = None)]
struct Cli {
    /// HTTP listen address (e.g., 127.0.0.1:1004)
    #[arg(short, long, default_value = "127.0.0.1:1004")]
    addr: SocketAddr,

    /// Directory for space descriptors, WALs and snapshots
    #[arg(short, long, env = "SPACESYNC_NODE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Network this relay belongs to; requests from other networks are refused
    #[arg(short, long, default_value = "spacesync-dev")]
    network_id: String,

    /// Peer id of this relay; derived from the identity seed when omitted
    #[arg(short, long)]
    peer_id: Option<String>,

    /// Seed for the derived peer id
    #[arg(long, env = "SPACESYNC_SEED")]
    seed: Option<String>,

    /// Seconds between snapshots of changed spaces
    #[arg(long, default_value_t = 10)]
    persist_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let peer_id = cli
        .peer_id
        .unwrap_or_else(|| derive_peer_id(cli.seed.as_deref(), 0));

    let relay = Arc::new(match &cli.data_dir {
        Some(dir) => Relay::open(peer_id, &cli.network_id, dir)?,
        None => Relay::new(peer_id, &cli.network_id),
    });
    info!(
        "Starting relay {} on network {}",
        relay.id(),
        relay.network_id()
    );

    if cli.data_dir.is_some() {
        // Periodic snapshot task: persist every space that changed
        let relay_for_persist = relay.clone();
        let period = Duration::from_secs(cli.persist_interval.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let relay = relay_for_persist.clone();
                match spawn_blocking(move || relay.persist_dirty()).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(n)) => info!("Periodic persist: wrote {n} snapshots"),
                    Ok(Err(err)) => error!("Periodic persist failed: {err:#}"),
                    Err(join_err) => error!("Periodic persist task panicked: {join_err}"),
                }
            }
        });
    }

    let app = http::router(relay.clone());
    info!("HTTP server listening on {}", cli.addr);
    axum::serve(tokio::net::TcpListener::bind(cli.addr).await?, app).await?;

    Ok(())
}
