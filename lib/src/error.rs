use thiserror::Error;

/// Errors produced while validating or assembling chain state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BtcError {
    #[error("invalid block")]
    InvalidBlock,
    #[error("invalid block: bad proof of work")]
    InvalidProofOfWork,
    #[error("invalid block: bad merkle root")]
    InvalidMerkleRoot,
    #[error("invalid block: non-monotonic or far-future timestamp")]
    InvalidTimestamp,
    #[error("invalid block: unexpected prev_block_hash, height or difficulty target")]
    InvalidPrevBlock,
    #[error("invalid transaction")]
    InvalidTransaction,
    #[error("invalid transaction: unlock script did not authorize spend")]
    InvalidSignature,
    #[error("invalid transaction: referenced output is not unspent")]
    InvalidCoin,
    #[error("invalid coinbase: reward plus fees exceeded")]
    InvalidCoinbase,
    #[error("script execution failed")]
    ScriptFailed,
}

pub type Result<T> = std::result::Result<T, BtcError>;
