use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clipmesh_core::{
    parse_peers, uses_crypto, Config, Identity, Result, SystemClipboard, TrustStore,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_PORT,
};
use clipmesh_daemon::{Node, NodeOptions};
use futures_util::stream::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tracing::info;

mod service;

#[derive(Parser)]
#[command(name = "clipmesh")]
#[command(about = "Peer-to-peer clipboard synchronization daemon")]
#[command(version)]
struct Args {
    /// TCP port for peer connections
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Comma-separated peers; `|` groups addresses of one peer, a `noise:`
    /// prefix marks an endpoint as encrypted
    #[arg(long, default_value = "")]
    peers: String,

    /// Clipboard poll interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    poll: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Generate the platform autostart descriptor and exit
    #[arg(long)]
    service: bool,

    /// Read port/peers/poll from a TOML config file instead of the flags
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let (port, peers, poll) = match &args.config {
        Some(path) => {
            let config = Config::load_from(std::path::Path::new(path)).await?;
            (config.port, config.peers, config.poll_interval_ms)
        }
        None => (args.port, args.peers.clone(), args.poll),
    };

    if args.service {
        service::generate_autostart(port, &peers, poll)?;
        return Ok(());
    }

    let specs = parse_peers(&peers);

    // Any noise: endpoint means this node needs its identity keypair and
    // trust store; a failure here is fatal before any socket is opened.
    let (identity, trust) = if uses_crypto(&specs) {
        let config_dir = Config::config_dir()?;
        let identity = Identity::load_or_create(&config_dir)?;
        info!(
            "loaded identity {} from {}",
            identity.fingerprint(),
            config_dir.display()
        );
        let trust = TrustStore::load(&config_dir).await?;
        (Some(identity), Some(Arc::new(trust)))
    } else {
        (None, None)
    };

    let clipboard = Arc::new(SystemClipboard::new()?);

    let node = Node::new(NodeOptions {
        port,
        peers: specs,
        poll_interval: Duration::from_millis(poll),
        clipboard,
        identity,
        trust,
    });

    node.start().await?;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    if let Some(signal) = signals.next().await {
        info!("received signal {}, shutting down", signal);
    }

    node.stop().await;
    Ok(())
}
