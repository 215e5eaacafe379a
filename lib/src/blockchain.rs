use std::collections::HashMap;
use std::sync::Arc;

use crate::block::{block_reward, next_target, Block};
use crate::config;
use crate::error::Result;
use crate::genesis::genesis_block;
use crate::sha256::Hash;
use crate::transaction::{OutputKey, TransactionTarget};
use crate::U256;

/// An immutable append-only chain plus its derived UTXO set.
///
/// Cloning a `Blockchain` is cheap: the block list, block index and UTXO map
/// are each held behind an `Arc`, so `try_append` can hand back a brand-new
/// chain while every existing reader keeps its own unaffected view of the
/// old one. This lets the chain builder hold several candidate forks at
/// once without deep-copying or invalidating any of them.
#[derive(Clone)]
pub struct Blockchain {
    blocks: Arc<Vec<Arc<Block>>>,
    block_index: Arc<HashMap<Hash, usize>>,
    unspent_coins: Arc<HashMap<OutputKey, TransactionTarget>>,
    total_work: U256,
}

impl Blockchain {
    /// A fresh chain containing only the genesis block.
    pub fn new() -> Self {
        let genesis = genesis_block();
        let hash = genesis.hash();
        Blockchain {
            blocks: Arc::new(vec![Arc::new(genesis)]),
            block_index: Arc::new(HashMap::from([(hash, 0)])),
            unspent_coins: Arc::new(HashMap::new()),
            total_work: U256::zero(),
        }
    }

    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    pub fn head(&self) -> &Block {
        self.blocks.last().expect("a chain always has at least genesis")
    }

    pub fn total_work(&self) -> U256 {
        self.total_work
    }

    pub fn unspent_coins(&self) -> &HashMap<OutputKey, TransactionTarget> {
        &self.unspent_coins
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Option<&Arc<Block>> {
        self.block_index.get(hash).map(|&i| &self.blocks[i])
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.block_index.contains_key(hash)
    }

    pub fn height(&self) -> u64 {
        self.head().header.height
    }

    /// The target the next block must satisfy.
    pub fn expected_target(&self) -> U256 {
        let next_height = self.height() + 1;
        if !next_height.is_multiple_of(config::DIFFICULTY_BLOCK_INTERVAL) {
            return self.head().header.target;
        }
        let window_start_idx = self
            .blocks
            .len()
            .saturating_sub(config::DIFFICULTY_BLOCK_INTERVAL as usize);
        let window_start_time = self.blocks[window_start_idx].header.time;
        next_target(
            self.height(),
            self.head().header.target,
            window_start_time,
            self.head().header.time,
        )
    }

    /// The block reward the next block's coinbase may claim (before fees).
    pub fn expected_reward(&self) -> u64 {
        block_reward(self.height() + 1)
    }

    /// Attempts to extend this chain with `block`. On success, returns a new
    /// `Blockchain` instance; `self` is left untouched for any other holder.
    pub fn try_append(&self, block: Block) -> Result<Blockchain> {
        let expected_target = self.expected_target();
        let expected_reward = self.expected_reward();

        block.verify(
            &self.head().header,
            expected_target,
            &self.unspent_coins,
            expected_reward,
        )?;

        let mut new_utxo = (*self.unspent_coins).clone();
        for tx in &block.transactions {
            for input in &tx.inputs {
                if !input.is_coinbase() {
                    new_utxo.remove(&input.output_key());
                }
            }
        }
        let tx_hash_cache: Vec<Hash> = block.transactions.iter().map(|t| t.hash()).collect();
        for (tx, tx_hash) in block.transactions.iter().zip(tx_hash_cache) {
            for (index, target) in tx.targets.iter().enumerate() {
                if is_burn_script(&target.script) {
                    continue;
                }
                new_utxo.insert((tx_hash, index as i64), target.clone());
            }
        }

        let mut new_blocks = (*self.blocks).clone();
        let new_index_entry = (block.hash(), new_blocks.len());
        new_blocks.push(Arc::new(block));

        let mut new_index = (*self.block_index).clone();
        new_index.insert(new_index_entry.0, new_index_entry.1);

        Ok(Blockchain {
            blocks: Arc::new(new_blocks),
            block_index: Arc::new(new_index),
            unspent_coins: Arc::new(new_utxo),
            total_work: self.total_work + work_contribution(expected_target),
        })
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

/// A pure `OP_RETURN` burn script's output is provably unspendable and is
/// intentionally not added to the UTXO set, to keep it from growing forever
/// with coins nobody can ever claim.
fn is_burn_script(script: &str) -> bool {
    script.split_whitespace().eq(["OP_RETURN"])
}

/// Work contributed by a block with the given target: inversely
/// proportional to the target, so a harder (smaller) target contributes
/// more work. Using `genesis_target / target` keeps genesis-era blocks at
/// a baseline contribution of 1.
fn work_contribution(target: U256) -> U256 {
    if target.is_zero() {
        return crate::config::genesis_target();
    }
    crate::config::genesis_target() / target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;
    use crate::transaction::{Transaction, TransactionInput, TransactionTarget};
    use chrono::Utc;

    fn pay_to(pk_hex: &str) -> String {
        format!("{} OP_CHECKSIG", pk_hex)
    }

    fn mine(mut block: crate::block::Block) -> crate::block::Block {
        let partial = block.header.partial_hash();
        let mut nonce = 0u64;
        loop {
            let hash = partial.finalize_with_nonce(nonce);
            if hash.matches_target(block.header.target) {
                block.header.nonce = nonce;
                return block;
            }
            nonce += 1;
        }
    }

    fn coinbase_block(chain: &Blockchain, id: u64, reward_key: &PrivateKey, amount: u64) -> crate::block::Block {
        let coinbase = Transaction::coinbase(
            pay_to(&reward_key.public_key().to_hex()),
            amount,
            Utc::now(),
            id.to_le_bytes().to_vec(),
        );
        let header = crate::block::BlockHeader {
            prev_block_hash: chain.head().hash(),
            merkle_root: crate::merkle::MerkleRoot::calculate(std::slice::from_ref(&coinbase)),
            time: chain.head().header.time + chrono::Duration::seconds(1),
            nonce: 0,
            height: chain.height() + 1,
            target: chain.expected_target(),
        };
        mine(crate::block::Block::new(id, header, vec![coinbase]))
    }

    #[test]
    fn exact_reward_accepted_excess_rejected() {
        let chain = Blockchain::new();
        let key = PrivateKey::generate();
        let reward = chain.expected_reward();

        let good = coinbase_block(&chain, 1, &key, reward);
        assert!(chain.try_append(good).is_ok());

        let bad = coinbase_block(&chain, 1, &key, reward + 1);
        assert!(chain.try_append(bad).is_err());
    }

    #[test]
    fn double_spend_across_blocks_rejected() {
        let chain = Blockchain::new();
        let key = PrivateKey::generate();
        let reward = chain.expected_reward();
        let b1 = coinbase_block(&chain, 1, &key, reward);
        let chain = chain.try_append(b1.clone()).unwrap();

        let coinbase_hash = b1.transactions[0].hash();
        let spend = |_chain: &Blockchain| {
            let unsigned = Transaction::new(
                vec![TransactionInput {
                    prev_tx_hash: coinbase_hash,
                    output_index: 0,
                    unlock_script: String::new(),
                }],
                vec![TransactionTarget {
                    script: pay_to(&PrivateKey::generate().public_key().to_hex()),
                    amount: reward,
                }],
                Utc::now(),
                None,
            );
            let sig = key.sign(&unsigned.hash());
            let mut tx = unsigned;
            tx.inputs[0].unlock_script = sig.to_hex();
            tx
        };

        let spend_tx = spend(&chain);
        let reward2 = chain.expected_reward();
        let coinbase2 = Transaction::coinbase(
            pay_to(&key.public_key().to_hex()),
            reward2,
            Utc::now(),
            2u64.to_le_bytes().to_vec(),
        );
        let header = crate::block::BlockHeader {
            prev_block_hash: chain.head().hash(),
            merkle_root: crate::merkle::MerkleRoot::calculate(&[coinbase2.clone(), spend_tx.clone()]),
            time: chain.head().header.time + chrono::Duration::seconds(1),
            nonce: 0,
            height: chain.height() + 1,
            target: chain.expected_target(),
        };
        let block2 = mine(crate::block::Block::new(2, header, vec![coinbase2.clone(), spend_tx.clone()]));
        let chain = chain.try_append(block2).unwrap();

        // Attempting to spend the same coinbase output again must be rejected.
        let reward3 = chain.expected_reward();
        let coinbase3 = Transaction::coinbase(
            pay_to(&key.public_key().to_hex()),
            reward3,
            Utc::now(),
            3u64.to_le_bytes().to_vec(),
        );
        let header3 = crate::block::BlockHeader {
            prev_block_hash: chain.head().hash(),
            merkle_root: crate::merkle::MerkleRoot::calculate(&[coinbase3.clone(), spend_tx.clone()]),
            time: chain.head().header.time + chrono::Duration::seconds(1),
            nonce: 0,
            height: chain.height() + 1,
            target: chain.expected_target(),
        };
        let block3 = mine(crate::block::Block::new(3, header3, vec![coinbase3, spend_tx]));
        assert!(chain.try_append(block3).is_err());
    }
}
