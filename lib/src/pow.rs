//! Cancellable nonce search over a candidate block's header.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::block::Block;

/// Number of nonce guesses tried between abort-flag checks. Irrelevant to
/// consensus; only affects cancellation latency.
const BATCH_SIZE: u64 = 1000;

/// A single proof-of-work search over one candidate block, cancellable from
/// another thread via `abort()`.
pub struct ProofOfWork {
    abort_flag: Arc<AtomicBool>,
}

impl ProofOfWork {
    pub fn new() -> Self {
        ProofOfWork {
            abort_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle that can be used to cancel this search from another thread.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort_flag.clone()
    }

    pub fn abort(&self) {
        self.abort_flag.store(true, Ordering::SeqCst);
    }

    /// Searches for a winning nonce for `block`, starting at `block.header.nonce`.
    /// Returns `Some(block)` with the header's `nonce` set to a winning value,
    /// or `None` if aborted first.
    pub fn run(&self, mut block: Block) -> Option<Block> {
        let partial = block.header.partial_hash();
        loop {
            for _ in 0..BATCH_SIZE {
                if self.abort_flag.load(Ordering::SeqCst) {
                    return None;
                }
                let hash = partial.finalize_with_nonce(block.header.nonce);
                if hash.matches_target(block.header.target) {
                    return Some(block);
                }
                block.header.nonce = block.header.nonce.wrapping_add(1);
            }
        }
    }
}

impl Default for ProofOfWork {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockHeader;
    use crate::merkle::MerkleRoot;
    use crate::sha256::Hash;
    use crate::U256;
    use chrono::Utc;

    fn easy_block() -> Block {
        Block::new(
            0,
            BlockHeader {
                prev_block_hash: Hash::zero(),
                merkle_root: MerkleRoot::empty(),
                time: Utc::now(),
                nonce: 0,
                height: 1,
                target: U256::max_value() / U256::from(4u64),
            },
            vec![],
        )
    }

    #[test]
    fn finds_a_winning_nonce() {
        let pow = ProofOfWork::new();
        let result = pow.run(easy_block()).expect("should find a nonce quickly");
        assert!(result.verify_proof_of_work());
    }

    #[test]
    fn abort_stops_the_search() {
        let pow = ProofOfWork::new();
        pow.abort();
        let mut impossible = easy_block();
        impossible.header.target = U256::zero();
        assert!(pow.run(impossible).is_none());
    }
}
