use crate::block::{Block, BlockHeader};
use crate::config;
use crate::merkle::MerkleRoot;
use crate::sha256::Hash;
use chrono::{TimeZone, Utc};

/// The fixed genesis block, identical bit-for-bit on every node of a given
/// network. `prev_block_hash` is derived from the consensus constants so
/// that nodes configured with incompatible parameters fail to interoperate
/// instead of silently forking.
pub fn genesis_block() -> Block {
    let domain_separator = format!(
        "None; {} {:?}",
        config::DIFFICULTY_BLOCK_INTERVAL,
        config::DIFFICULTY_TARGET_TIMEDELTA
    );
    let time = Utc
        .with_ymd_and_hms(2017, 3, 3, 10, 35, 26)
        .single()
        .unwrap()
        + chrono::Duration::microseconds(922_898);

    Block::new(
        0,
        BlockHeader {
            prev_block_hash: Hash::hash(&domain_separator),
            merkle_root: MerkleRoot::empty(),
            time,
            nonce: 0,
            height: 0,
            target: config::genesis_target(),
        },
        vec![],
    )
}
