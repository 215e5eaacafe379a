use crate::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(U256);

impl Hash {
    /// Hash anything that can be serde-serialized, via a canonical CBOR encoding.
    ///
    /// CBOR self-describes the length of every field it encodes, so two
    /// different values can never serialize to the same bytes by having
    /// their fields run together.
    pub fn hash<T: serde::Serialize>(data: &T) -> Self {
        let mut serialized: Vec<u8> = vec![];
        ciborium::into_writer(data, &mut serialized)
            .expect("serialization into an in-memory buffer cannot fail");
        let digest = Sha256::digest(&serialized);
        Hash(U256::from_big_endian(&digest))
    }

    pub fn matches_target(&self, target: U256) -> bool {
        self.0 < target
    }

    pub fn zero() -> Self {
        Hash(U256::zero())
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }

    pub fn to_hex(&self) -> String {
        let mut bytes = [0u8; 32];
        self.0.to_big_endian(&mut bytes);
        hex::encode(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let mut buf = [0u8; 32];
        let start = 32usize.saturating_sub(bytes.len());
        buf[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(32)..]);
        Ok(Hash(U256::from_big_endian(&buf)))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental hash state absorbing everything but the nonce, so that a
/// proof-of-work search can clone the state cheaply per nonce guess instead
/// of re-serializing the whole header.
#[derive(Clone)]
pub struct PartialHasher(Sha256);

impl PartialHasher {
    pub fn new() -> Self {
        PartialHasher(Sha256::new())
    }

    pub fn absorb(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    /// Finalize with the given nonce absorbed last, without consuming `self`,
    /// so the same partial state can be reused for the next nonce guess. The
    /// nonce is CBOR-encoded like everything else absorbed into the hash, so
    /// this always agrees with hashing the whole value in one shot.
    pub fn finalize_with_nonce(&self, nonce: u64) -> Hash {
        let mut nonce_bytes = Vec::new();
        ciborium::into_writer(&nonce, &mut nonce_bytes)
            .expect("serialization into an in-memory buffer cannot fail");
        let mut clone = self.0.clone();
        clone.update(&nonce_bytes);
        let digest = clone.finalize();
        Hash(U256::from_big_endian(&digest))
    }
}

impl Default for PartialHasher {
    fn default() -> Self {
        Self::new()
    }
}
