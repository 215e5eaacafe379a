use std::sync::Arc;

use anyhow::{Context, Result};
use chainlib::chainbuilder::{ChainBuilder, EventQueue};
use chainlib::protocol::Network;
use clap::Parser;

/// A relay/observer peer: validates and rebroadcasts what it hears, but
/// never mines. Same wiring as `miner`, minus the proof-of-work thread.
#[derive(Parser)]
#[command(name = "node", about = "Relays and validates blocks and transactions")]
struct Cli {
    /// Address to accept incoming peer connections on.
    #[arg(long, default_value = "0.0.0.0:9000")]
    listen_addr: String,

    /// Peers to dial on startup, e.g. --bootstrap-peer 1.2.3.4:9000 (repeatable).
    #[arg(long = "bootstrap-peer")]
    bootstrap_peers: Vec<String>,

    /// Maximum number of simultaneous peer connections.
    #[arg(long, default_value_t = chainlib::config::MAX_PEERS)]
    max_peers: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let queue = EventQueue::new();
    let genesis_hash = chainlib::genesis::genesis_block().hash();
    let listen_port: u16 = cli
        .listen_addr
        .rsplit_once(':')
        .and_then(|(_, p)| p.parse().ok())
        .unwrap_or(0);

    let shared_head = chainlib::chainbuilder::new_shared_head();
    let network = Arc::new(Network::with_shared_head(
        genesis_hash,
        listen_port,
        cli.max_peers,
        queue.clone(),
        shared_head.clone(),
    ));
    network.listen(&cli.listen_addr).context("binding listen_addr")?;
    for peer in &cli.bootstrap_peers {
        if let Err(err) = network.connect(peer) {
            tracing::warn!(%peer, %err, "failed to connect to bootstrap peer");
        }
    }

    let mut builder = ChainBuilder::with_shared_head(Box::new(network), None, Some(shared_head));
    tracing::info!(height = builder.primary().height(), "chain builder ready");
    builder.run(&queue)
}
