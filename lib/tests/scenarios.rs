//! End-to-end scenario tests, each driving `try_append` or the chain builder
//! directly rather than mocking internals.
use chainlib::block::{Block, BlockHeader};
use chainlib::blockchain::Blockchain;
use chainlib::chainbuilder::{ChainBuilder, EventKind, NullBroadcaster};
use chainlib::crypto::PrivateKey;
use chainlib::merkle::MerkleRoot;
use chainlib::transaction::{Transaction, TransactionInput, TransactionTarget};
use chrono::{Duration, Utc};

fn pay_to(pk_hex: &str) -> String {
    format!("{pk_hex} OP_CHECKSIG")
}

fn mine(mut block: Block) -> Block {
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

fn coinbase_tx(reward_key: &PrivateKey, amount: u64, id: u64) -> Transaction {
    Transaction::coinbase(
        pay_to(&reward_key.public_key().to_hex()),
        amount,
        Utc::now(),
        id.to_le_bytes().to_vec(),
    )
}

fn block_with(chain: &Blockchain, id: u64, transactions: Vec<Transaction>) -> Block {
    let header = BlockHeader {
        prev_block_hash: chain.head().hash(),
        merkle_root: MerkleRoot::calculate(&transactions),
        time: chain.head().header.time + Duration::seconds(1),
        nonce: 0,
        height: chain.height() + 1,
        target: chain.expected_target(),
    };
    mine(Block::new(id, header, transactions))
}

fn spend(coinbase_hash: chainlib::sha256::Hash, key: &PrivateKey, amount: u64, to: &PrivateKey) -> Transaction {
    let unsigned = Transaction::new(
        vec![TransactionInput {
            prev_tx_hash: coinbase_hash,
            output_index: 0,
            unlock_script: String::new(),
        }],
        vec![TransactionTarget {
            script: pay_to(&to.public_key().to_hex()),
            amount,
        }],
        Utc::now(),
        None,
    );
    let sig = key.sign(&unsigned.hash());
    let mut tx = unsigned;
    tx.inputs[0].unlock_script = sig.to_hex();
    tx
}

/// S2 — two transactions in the *same* block spending the same coin must be
/// rejected, even though each is individually well-formed.
#[test]
fn s2_double_spend_within_one_block_rejected() {
    let chain = Blockchain::new();
    let key = PrivateKey::generate();
    let reward = chain.expected_reward();
    let genesis_coinbase = coinbase_tx(&key, reward, 1);
    let chain = chain.try_append(block_with(&chain, 1, vec![genesis_coinbase.clone()])).unwrap();

    let coinbase_hash = genesis_coinbase.hash();
    let to1 = PrivateKey::generate();
    let to2 = PrivateKey::generate();
    let t1 = spend(coinbase_hash, &key, reward, &to1);
    let t2 = spend(coinbase_hash, &key, reward, &to2);

    let reward2 = chain.expected_reward();
    let coinbase2 = coinbase_tx(&key, reward2, 2);
    let block = block_with(&chain, 2, vec![coinbase2, t1, t2]);
    assert!(chain.try_append(block).is_err());
}

/// S5 — a coinbase may claim exactly reward + fees, no more.
#[test]
fn s5_reward_plus_fees_exact_accepted_excess_rejected() {
    let chain = Blockchain::new();
    let key = PrivateKey::generate();
    let reward = chain.expected_reward();
    let genesis_coinbase = coinbase_tx(&key, reward, 1);
    let chain = chain.try_append(block_with(&chain, 1, vec![genesis_coinbase.clone()])).unwrap();

    let coinbase_hash = genesis_coinbase.hash();
    let to = PrivateKey::generate();
    let fee = 7u64;
    let fee_tx = spend(coinbase_hash, &key, reward - fee, &to);

    let reward2 = chain.expected_reward();
    let good_coinbase = coinbase_tx(&key, reward2 + fee, 2);
    let good_block = block_with(&chain, 2, vec![good_coinbase, fee_tx.clone()]);
    assert!(chain.try_append(good_block).is_ok());

    let bad_coinbase = coinbase_tx(&key, reward2 + fee + 1, 3);
    let bad_block = block_with(&chain, 2, vec![bad_coinbase, fee_tx]);
    assert!(chain.try_append(bad_block).is_err());
}

/// S6 — a block timestamped before genesis, or more than two hours in the
/// future, is rejected regardless of everything else being valid.
#[test]
fn s6_non_monotonic_or_far_future_time_rejected() {
    let chain = Blockchain::new();
    let key = PrivateKey::generate();
    let reward = chain.expected_reward();
    let coinbase = coinbase_tx(&key, reward, 1);

    let mut past_header = BlockHeader {
        prev_block_hash: chain.head().hash(),
        merkle_root: MerkleRoot::calculate(std::slice::from_ref(&coinbase)),
        time: Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).single().unwrap(),
        nonce: 0,
        height: chain.height() + 1,
        target: chain.expected_target(),
    };
    past_header.nonce = 0;
    let past_block = mine(Block::new(1, past_header, vec![coinbase.clone()]));
    assert!(chain.try_append(past_block).is_err());

    let future_header = BlockHeader {
        prev_block_hash: chain.head().hash(),
        merkle_root: MerkleRoot::calculate(std::slice::from_ref(&coinbase)),
        time: Utc::now() + Duration::hours(3),
        nonce: 0,
        height: chain.height() + 1,
        target: chain.expected_target(),
    };
    let future_block = mine(Block::new(1, future_header, vec![coinbase]));
    assert!(chain.try_append(future_block).is_err());
}

use chrono::TimeZone;

/// S7 — wrong height or wrong difficulty target is rejected even when
/// proof-of-work, Merkle root and transactions are all otherwise valid.
#[test]
fn s7_wrong_height_or_difficulty_rejected() {
    let chain = Blockchain::new();
    let key = PrivateKey::generate();
    let reward = chain.expected_reward();
    let coinbase = coinbase_tx(&key, reward, 1);

    let same_height = block_with(&chain, 1, vec![coinbase.clone()]);
    let mut wrong_height = same_height.clone();
    wrong_height.header.height = chain.height();
    assert!(chain.try_append(wrong_height).is_err());

    let mut skipped_height = same_height.clone();
    skipped_height.header.height = chain.height() + 2;
    assert!(chain.try_append(skipped_height).is_err());

    let mut wrong_target = same_height;
    wrong_target.header.target /= chainlib::U256::from(2u64);
    assert!(chain.try_append(wrong_target).is_err());
}

/// S8 — two chains built independently from genesis converge once one is
/// handed the other's blocks: the chain builder adopts whichever has more
/// accumulated work.
#[test]
fn s8_fork_adoption_converges_on_more_work() {
    let mut node_a = ChainBuilder::new(Box::new(NullBroadcaster), None);
    let mut node_b = ChainBuilder::new(Box::new(NullBroadcaster), None);

    let key_a = PrivateKey::generate();
    let key_b = PrivateKey::generate();

    // node_a mines three blocks, node_b mines only one, from the same genesis.
    let mut chain = node_a.primary().clone();
    let mut a_blocks = Vec::new();
    for id in 1..=3u64 {
        let reward = chain.expected_reward();
        let coinbase = coinbase_tx(&key_a, reward, id);
        let block = block_with(&chain, id, vec![coinbase]);
        chain = chain.try_append(block.clone()).unwrap();
        a_blocks.push(block);
    }
    for block in &a_blocks {
        node_a.dispatch(EventKind::Block(block.clone()));
    }
    assert_eq!(node_a.primary().height(), 3);

    let b_chain = node_b.primary().clone();
    let reward = b_chain.expected_reward();
    let b_block = block_with(&b_chain, 1, vec![coinbase_tx(&key_b, reward, 1)]);
    node_b.dispatch(EventKind::Block(b_block));
    assert_eq!(node_b.primary().height(), 1);

    // Deliver node_a's blocks to node_b in causal order; the longer, more
    // work-bearing chain should win.
    for block in &a_blocks {
        node_b.dispatch(EventKind::Block(block.clone()));
    }

    assert_eq!(node_b.primary().height(), node_a.primary().height());
    assert_eq!(node_b.primary().head().hash(), node_a.primary().head().hash());
}

/// A `Broadcaster` that records every `getblock` request instead of sending
/// it over a socket, so a test can answer requests on its own schedule.
#[derive(Default)]
struct RequestRecorder {
    requested: std::sync::Mutex<Vec<chainlib::sha256::Hash>>,
}

impl chainlib::chainbuilder::Broadcaster for RequestRecorder {
    fn broadcast_block(&self, _block: &Block) {}
    fn broadcast_transaction(&self, _tx: &Transaction) {}
    fn request_block(&self, hash: chainlib::sha256::Hash) {
        self.requested.lock().unwrap().push(hash);
    }
}

/// Handing a chain builder only the tip of a chain it has never seen drives
/// it to request ancestors one hop at a time via `getblock`, until it
/// reaches genesis and adopts the whole chain.
#[test]
fn backfill_via_getblock_reaches_genesis() {
    let key = PrivateKey::generate();
    let mut chain = Blockchain::new();
    let mut blocks = Vec::new();
    for id in 1..=20u64 {
        let reward = chain.expected_reward();
        let coinbase = coinbase_tx(&key, reward, id);
        let block = block_with(&chain, id, vec![coinbase]);
        chain = chain.try_append(block.clone()).unwrap();
        blocks.push(block);
    }
    let by_hash: std::collections::HashMap<_, _> = blocks.iter().map(|b| (b.hash(), b.clone())).collect();

    let recorder = std::sync::Arc::new(RequestRecorder::default());
    let mut builder = ChainBuilder::new(Box::new(recorder.clone()), None);

    // Only the tip is delivered; nothing else has arrived via flood.
    builder.dispatch(EventKind::Block(blocks.last().unwrap().clone()));
    assert_eq!(builder.primary().height(), 0, "tip alone cannot attach to genesis yet");

    // Answer every outstanding getblock request until the builder stops
    // asking for anything new, simulating a peer that always has the block.
    loop {
        let pending: Vec<_> = recorder.requested.lock().unwrap().drain(..).collect();
        if pending.is_empty() {
            break;
        }
        for hash in pending {
            if let Some(block) = by_hash.get(&hash) {
                builder.dispatch(EventKind::Block(block.clone()));
            }
        }
    }

    assert_eq!(builder.primary().height(), 20);
    assert_eq!(builder.primary().head().hash(), chain.head().hash());
}
