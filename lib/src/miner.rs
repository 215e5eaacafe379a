//! Drives proof-of-work from chain-builder state and publishes winners.
//!
//! A listener thread waits for "primary changed" notifications and owns a
//! single active proof-of-work session at a time, aborting and restarting
//! it whenever the chain it was mining against has moved on.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::block::{Block, BlockHeader};
use crate::blockchain::Blockchain;
use crate::chainbuilder::{Broadcaster, ChainSnapshot, EventKind, EventQueue, Priority};
use crate::crypto::PublicKey;
use crate::merkle::MerkleRoot;
use crate::pow::ProofOfWork;
use crate::transaction::{OutputKey, Transaction};
use chrono::Utc;
use std::collections::HashMap;

/// Assembles a candidate block from the mempool: highest-fee transactions
/// first, skipping any that conflict with an already-selected one or no
/// longer validate against the chain's UTXO snapshot.
pub fn assemble_candidate(
    chain: &Blockchain,
    mempool: &HashMap<crate::sha256::Hash, Transaction>,
    reward_pubkey: &PublicKey,
    block_id: u64,
) -> Block {
    let utxo = chain.unspent_coins();
    let mut candidates: Vec<&Transaction> = mempool.values().collect();
    candidates.sort_by_key(|tx| std::cmp::Reverse(tx.fee(utxo)));

    let mut selected: Vec<Transaction> = Vec::new();
    let mut spent: std::collections::HashSet<OutputKey> = std::collections::HashSet::new();
    let mut fees: u64 = 0;
    for tx in candidates {
        if tx.check_conflict(&spent) {
            continue;
        }
        if tx.validate(utxo).is_err() {
            continue;
        }
        fees += tx.fee(utxo);
        for input in &tx.inputs {
            spent.insert(input.output_key());
        }
        selected.push(tx.clone());
    }

    let reward = chain.expected_reward();
    let coinbase = Transaction::coinbase(
        format!("{} OP_CHECKSIG", reward_pubkey.to_hex()),
        reward + fees,
        Utc::now(),
        block_id.to_le_bytes().to_vec(),
    );

    let mut transactions = vec![coinbase];
    transactions.extend(selected);

    let header = BlockHeader {
        prev_block_hash: chain.head().hash(),
        merkle_root: MerkleRoot::calculate(&transactions),
        time: Utc::now().max(chain.head().header.time + chrono::Duration::microseconds(1)),
        nonce: 0,
        height: chain.height() + 1,
        target: chain.expected_target(),
    };

    Block::new(block_id, header, transactions)
}

/// Owns at most one active proof-of-work session, restarted every time the
/// primary chain changes.
pub struct Miner {
    reward_pubkey: PublicKey,
    current_abort: Option<Arc<AtomicBool>>,
    next_block_id: u64,
}

impl Miner {
    pub fn new(reward_pubkey: PublicKey) -> Self {
        Miner {
            reward_pubkey,
            current_abort: None,
            next_block_id: 1,
        }
    }

    fn abort_current(&mut self) {
        if let Some(flag) = self.current_abort.take() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Runs the miner loop: blocks on `primary_changed_rx`, restarting the
    /// proof-of-work search each time, and pushes a winning block back onto
    /// `queue` at `Priority::Local` so it is delivered to the event thread
    /// ahead of any same-instant remote events, then broadcasts it.
    pub fn run(
        mut self,
        primary_changed_rx: mpsc::Receiver<ChainSnapshot>,
        queue: Arc<EventQueue>,
        broadcaster: Arc<dyn Broadcaster>,
    ) {
        while let Ok(snapshot) = primary_changed_rx.recv() {
            self.abort_current();
            let candidate = assemble_candidate(
                &snapshot.chain,
                &snapshot.mempool,
                &self.reward_pubkey,
                self.next_block_id,
            );
            self.next_block_id += 1;

            let pow = ProofOfWork::new();
            let abort_flag = pow.abort_handle();
            self.current_abort = Some(abort_flag);

            let queue = queue.clone();
            let broadcaster = broadcaster.clone();
            thread::spawn(move || {
                if let Some(winner) = pow.run(candidate) {
                    queue.push(Priority::Local, EventKind::Block(winner.clone()));
                    broadcaster.broadcast_block(&winner);
                }
            });
        }
    }
}
