use std::fs;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chainlib::chainbuilder::{ChainBuilder, EventQueue};
use chainlib::crypto::{PrivateKey, PublicKey};
use chainlib::protocol::Network;
use chainlib::script;
use chainlib::transaction::{Transaction, TransactionInput, TransactionTarget};
use clap::{Parser, Subcommand};

/// A minimal wallet: talks to exactly one peer over the wire protocol
/// (C8), never to an RPC surface. It has no persistent chain state of its
/// own — each invocation reconnects and rebuilds what it needs from
/// whatever the peer gossips during a short listening window.
#[derive(Parser)]
#[command(name = "wallet", about = "A minimal peer-protocol wallet")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generates a new keypair and writes `<out>` (private key) and `<out>.pub` (public key).
    NewKey {
        out: String,
    },
    /// Reports the spendable balance owned by a public key.
    Balance {
        pubkey_file: String,
        #[arg(long)]
        peer: String,
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
        #[arg(long)]
        key: String,
        #[arg(long)]
        peer: String,
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::NewKey { out } => new_key(&out),
        Commands::Balance {
            pubkey_file,
            peer,
            timeout_secs,
        } => balance(&pubkey_file, &peer, timeout_secs),
        Commands::Send {
            to,
            amount,
            key,
            peer,
            timeout_secs,
        } => send(&to, amount, &key, &peer, timeout_secs),
    }
}

fn new_key(out: &str) -> Result<()> {
    let key = PrivateKey::generate();
    fs::write(out, key.to_hex()).with_context(|| format!("writing {out}"))?;
    let pub_path = format!("{out}.pub");
    fs::write(&pub_path, key.public_key().to_hex()).with_context(|| format!("writing {pub_path}"))?;
    println!("wrote {out} and {pub_path}");
    Ok(())
}

fn read_pubkey(path: &str) -> Result<PublicKey> {
    let hex = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    PublicKey::from_hex(hex.trim()).map_err(|e| anyhow::anyhow!(e.to_string()))
}

/// Connects to `peer`, collects whatever blocks and transactions it
/// gossips for `timeout_secs`, then hands back the resulting chain builder.
/// This only sees coins confirmed (or mempool transactions proposed) during
/// the listening window, not the peer's full history.
fn observe(peer: &str, timeout_secs: u64) -> Result<Arc<Mutex<ChainBuilder>>> {
    let queue = EventQueue::new();
    let genesis_hash = chainlib::genesis::genesis_block().hash();
    let shared_head = chainlib::chainbuilder::new_shared_head();
    let network = Arc::new(Network::with_shared_head(genesis_hash, 0, 8, queue.clone(), shared_head.clone()));
    network.connect(peer).with_context(|| format!("connecting to {peer}"))?;

    let builder = Arc::new(Mutex::new(ChainBuilder::with_shared_head(
        Box::new(network.clone()),
        None,
        Some(shared_head),
    )));
    let worker_builder = builder.clone();
    let worker_queue = queue.clone();
    thread::Builder::new().name("wallet-observer".into()).spawn(move || loop {
        let event = worker_queue.pop_blocking();
        worker_builder.lock().unwrap().dispatch(event);
    })?;

    thread::sleep(Duration::from_secs(timeout_secs));
    Ok(builder)
}

fn balance(pubkey_file: &str, peer: &str, timeout_secs: u64) -> Result<()> {
    let pubkey = read_pubkey(pubkey_file)?;
    let builder = observe(peer, timeout_secs)?;
    let builder = builder.lock().unwrap();
    let lock_script = script::pay_to_pubkey(&pubkey);
    let total: u64 = builder
        .primary()
        .unspent_coins()
        .values()
        .filter(|target| target.script == lock_script)
        .map(|target| target.amount)
        .sum();
    println!("{total}");
    Ok(())
}

fn send(to: &str, amount: u64, key_path: &str, peer: &str, timeout_secs: u64) -> Result<()> {
    let to_pubkey = read_pubkey(to)?;
    let key_hex = fs::read_to_string(key_path).with_context(|| format!("reading {key_path}"))?;
    let key = PrivateKey::from_hex(key_hex.trim()).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let from_pubkey = key.public_key();

    let builder = observe(peer, timeout_secs)?;
    let chain = builder.lock().unwrap().primary().clone();

    let lock_script = script::pay_to_pubkey(&from_pubkey);
    let mut inputs = Vec::new();
    let mut collected = 0u64;
    for (output_key, target) in chain.unspent_coins() {
        if target.script != lock_script {
            continue;
        }
        inputs.push(TransactionInput {
            prev_tx_hash: output_key.0,
            output_index: output_key.1,
            unlock_script: String::new(),
        });
        collected += target.amount;
        if collected >= amount {
            break;
        }
    }
    if collected < amount {
        anyhow::bail!("insufficient funds: have {collected}, need {amount}");
    }

    let mut targets = vec![TransactionTarget {
        script: script::pay_to_pubkey(&to_pubkey),
        amount,
    }];
    if collected > amount {
        targets.push(TransactionTarget {
            script: script::pay_to_pubkey(&from_pubkey),
            amount: collected - amount,
        });
    }

    let unsigned = Transaction::new(inputs, targets, chrono::Utc::now(), None);
    let tx_hash = unsigned.hash();
    let mut tx = unsigned;
    for input in &mut tx.inputs {
        input.unlock_script = script::sign_pay_to_pubkey(&key, &tx_hash);
    }

    let queue = EventQueue::new();
    let genesis_hash = chainlib::genesis::genesis_block().hash();
    let network = Arc::new(Network::new(genesis_hash, 0, 8, queue));
    network.connect(peer).with_context(|| format!("connecting to {peer}"))?;
    // Give the handshake a moment to complete before sending on the
    // writer-thread channel.
    thread::sleep(Duration::from_millis(200));
    use chainlib::chainbuilder::Broadcaster;
    network.broadcast_transaction(&tx);
    thread::sleep(Duration::from_millis(200));

    println!("broadcast {}", tx.hash().to_hex());
    Ok(())
}
