//! Consensus constants. Every node on one network must agree on these values.
use crate::U256;
use std::time::Duration;

/// Reward available for the first `REWARD_HALF_LIFE` blocks, starting with genesis.
pub const GENESIS_REWARD: u64 = 1000;

/// Number of blocks until the block reward is halved.
pub const REWARD_HALF_LIFE: u64 = 10_000;

/// Approximate interval after which an unanswered block request is retried.
pub const BLOCK_REQUEST_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Number of failed retries before a block request (and its dependent partial chains) is abandoned.
pub const BLOCK_REQUEST_RETRY_COUNT: u32 = 3;

/// Number of blocks between difficulty retargeting points.
pub const DIFFICULTY_BLOCK_INTERVAL: u64 = 10;

/// Wall-clock duration that `DIFFICULTY_BLOCK_INTERVAL` blocks should take to mine.
pub const DIFFICULTY_TARGET_TIMEDELTA: Duration = Duration::from_secs(600);

/// Upper bound on how many peers a node keeps connected at once.
pub const MAX_PEERS: usize = 16;

/// Fixed handshake prefix; see `protocol` module.
pub const HANDSHAKE_PREFIX: &str = "bl0ckch41n";

/// Genesis target is the maximal possible hash value: everything is a valid proof of work.
pub fn genesis_target() -> U256 {
    U256::max_value()
}
