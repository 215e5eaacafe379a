use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;

use crate::config;
use crate::error::{BtcError, Result};
use crate::merkle::MerkleRoot;
use crate::sha256::{Hash, PartialHasher};
use crate::transaction::{OutputKey, Transaction, TransactionTarget};
use crate::U256;

/// Far-future tolerance for a block's timestamp.
const MAX_FUTURE_DRIFT: ChronoDuration = ChronoDuration::hours(2);

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub prev_block_hash: Hash,
    pub merkle_root: MerkleRoot,
    pub time: DateTime<Utc>,
    pub nonce: u64,
    pub height: u64,
    pub target: U256,
}

impl BlockHeader {
    /// Full header hash, defined in terms of `partial_hash` so the two can
    /// never disagree on what bytes a winning nonce actually commits to.
    pub fn hash(&self) -> Hash {
        self.partial_hash().finalize_with_nonce(self.nonce)
    }

    /// Hash state over everything but the nonce, for cheap nonce iteration (C7).
    pub fn partial_hash(&self) -> PartialHasher {
        let mut serialized = Vec::new();
        ciborium::into_writer(
            &(self.prev_block_hash, self.merkle_root, self.time, self.target),
            &mut serialized,
        )
        .expect("serialization into an in-memory buffer cannot fail");
        let mut hasher = PartialHasher::new();
        hasher.absorb(&serialized);
        hasher
    }

    pub fn verify_proof_of_work(&self) -> bool {
        self.hash().matches_target(self.target)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Informational sequence number, not consensus-relevant.
    pub id: u64,
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(id: u64, header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Block {
            id,
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn verify_proof_of_work(&self) -> bool {
        self.header.verify_proof_of_work()
    }

    pub fn verify_merkle(&self) -> bool {
        MerkleRoot::calculate(&self.transactions) == self.header.merkle_root
    }

    /// `time > now + 2h` (far-future) or `time <= prev_time` (non-monotonic) is rejected.
    pub fn verify_time(&self, prev_time: DateTime<Utc>) -> bool {
        let now = Utc::now();
        self.header.time <= now + MAX_FUTURE_DRIFT && self.header.time > prev_time
    }

    pub fn verify_prev(&self, prev_header: &BlockHeader, expected_target: U256) -> bool {
        self.header.prev_block_hash == prev_header.hash()
            && self.header.target == expected_target
            && self.header.height == prev_header.height + 1
    }

    /// Full verification sequence against a known-good predecessor: PoW,
    /// Merkle, prev/height/target, time, then per-transaction.
    pub fn verify(
        &self,
        prev_header: &BlockHeader,
        expected_target: U256,
        snapshot_utxo: &HashMap<OutputKey, TransactionTarget>,
        expected_reward: u64,
    ) -> Result<()> {
        if !self.verify_proof_of_work() {
            return Err(BtcError::InvalidProofOfWork);
        }
        if !self.verify_merkle() {
            return Err(BtcError::InvalidMerkleRoot);
        }
        if !self.verify_prev(prev_header, expected_target) {
            return Err(BtcError::InvalidPrevBlock);
        }
        if !self.verify_time(prev_header.time) {
            return Err(BtcError::InvalidTimestamp);
        }
        self.verify_transactions(snapshot_utxo, expected_reward)
    }

    /// Verifies every transaction in this block against `snapshot_utxo`, the
    /// single-coinbase rule, the reward+fee cap, and that no two inputs in
    /// this block reference the same coin.
    pub fn verify_transactions(
        &self,
        snapshot_utxo: &HashMap<OutputKey, TransactionTarget>,
        expected_reward: u64,
    ) -> Result<()> {
        if self.transactions.is_empty() {
            return Err(BtcError::InvalidBlock);
        }

        let coinbases: Vec<&Transaction> = self.transactions.iter().filter(|t| t.is_coinbase()).collect();
        if coinbases.len() != 1 {
            return Err(BtcError::InvalidBlock);
        }
        let coinbase = coinbases[0];

        let mut seen_inputs: HashSet<OutputKey> = HashSet::new();
        let mut fees: u64 = 0;
        for tx in &self.transactions {
            for input in &tx.inputs {
                if input.is_coinbase() {
                    continue;
                }
                if !seen_inputs.insert(input.output_key()) {
                    return Err(BtcError::InvalidTransaction);
                }
            }
            tx.validate(snapshot_utxo)?;
            if !tx.is_coinbase() {
                fees = fees
                    .checked_add(tx.fee(snapshot_utxo))
                    .ok_or(BtcError::InvalidTransaction)?;
            }
        }

        let cap = expected_reward.checked_add(fees).ok_or(BtcError::InvalidCoinbase)?;
        if coinbase.total_output() > cap {
            return Err(BtcError::InvalidCoinbase);
        }

        Ok(())
    }
}

/// Block reward at `height`, halving every `REWARD_HALF_LIFE` blocks.
pub fn block_reward(height: u64) -> u64 {
    let halvings = height / config::REWARD_HALF_LIFE;
    if halvings >= u64::BITS as u64 {
        0
    } else {
        config::GENESIS_REWARD >> halvings
    }
}

/// Recomputes the difficulty target given the chain prefix ending at
/// `prev_height` (inclusive): every `DIFFICULTY_BLOCK_INTERVAL` blocks,
/// scale the target linearly by how far actual mining time was from the
/// target window, clamped so the target never becomes easier than genesis.
pub fn next_target(
    prev_height: u64,
    prev_target: U256,
    window_start_time: DateTime<Utc>,
    window_end_time: DateTime<Utc>,
) -> U256 {
    let next_height = prev_height + 1;
    if !next_height.is_multiple_of(config::DIFFICULTY_BLOCK_INTERVAL) {
        return prev_target;
    }

    let actual = (window_end_time - window_start_time)
        .num_milliseconds()
        .max(1) as u64;
    let target_ms = config::DIFFICULTY_TARGET_TIMEDELTA.as_millis().max(1) as u64;

    let genesis = config::genesis_target();
    let scaled = prev_target
        .checked_mul(U256::from(actual))
        .map(|product| product / U256::from(target_ms))
        .unwrap_or(genesis);
    scaled.min(genesis)
}
