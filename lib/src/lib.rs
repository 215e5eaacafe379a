use serde::{Deserialize, Serialize};
use uint::construct_uint;
construct_uint! {
    ///Construct a 256-bit unsigned integer.
    /// consist of 4 64-bit words.
    #[derive(Serialize, Deserialize)]
    pub struct U256(4);
}

pub mod block;
pub mod blockchain;
pub mod chainbuilder;
pub mod config;
pub mod crypto;
pub mod error;
pub mod genesis;
pub mod merkle;
pub mod miner;
pub mod pow;
pub mod protocol;
pub mod script;
pub mod sha256;
pub mod transaction;
