use std::fs;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use chainlib::chainbuilder::{ChainBuilder, EventQueue};
use chainlib::crypto::PublicKey;
use chainlib::miner::Miner;
use chainlib::protocol::Network;
use clap::Parser;

/// A full node that also mines: wires the peer protocol, the chain builder
/// and a proof-of-work miner together and blocks on the event loop.
#[derive(Parser)]
#[command(name = "miner", about = "Mines blocks and relays them to peers")]
struct Cli {
    /// Address to accept incoming peer connections on.
    #[arg(long, default_value = "0.0.0.0:9000")]
    listen_addr: String,

    /// Peers to dial on startup, e.g. --bootstrap-peer 1.2.3.4:9000 (repeatable).
    #[arg(long = "bootstrap-peer")]
    bootstrap_peers: Vec<String>,

    /// Path to the public key file the block reward is paid to.
    #[arg(long)]
    reward_pubkey_path: String,

    /// Maximum number of simultaneous peer connections.
    #[arg(long, default_value_t = chainlib::config::MAX_PEERS)]
    max_peers: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let reward_pubkey_hex =
        fs::read_to_string(&cli.reward_pubkey_path).context("reading reward pubkey file")?;
    let reward_pubkey =
        PublicKey::from_hex(reward_pubkey_hex.trim()).map_err(|e| anyhow::anyhow!(e.to_string()))?;

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

    let (primary_changed_tx, primary_changed_rx) = mpsc::channel();
    let mut builder = ChainBuilder::with_shared_head(
        Box::new(network.clone()),
        Some(primary_changed_tx.clone()),
        Some(shared_head),
    );
    tracing::info!(height = builder.primary().height(), "chain builder ready");

    // Prime the miner with the genesis-only chain so it starts working
    // immediately instead of waiting for the first real primary swap.
    primary_changed_tx
        .send(chainlib::chainbuilder::ChainSnapshot {
            chain: builder.primary().clone(),
            mempool: builder.mempool().clone(),
        })
        .ok();

    let miner = Miner::new(reward_pubkey);
    let miner_queue = queue.clone();
    let miner_broadcaster: Arc<dyn chainlib::chainbuilder::Broadcaster> = network.clone();
    thread::Builder::new()
        .name("miner".into())
        .spawn(move || miner.run(primary_changed_rx, miner_queue, miner_broadcaster))
        .context("spawning miner thread")?;

    builder.run(&queue)
}
