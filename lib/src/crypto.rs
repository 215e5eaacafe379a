//! Asymmetric keypairs and signatures used to authorize spends.
use ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sha256::Hash;

/// A public key, usable to verify signatures and to receive funds.
///
/// Equality and hashing only ever consider the public component: two keys
/// wrapping the same point are the same key, regardless of how each was
/// decoded.
#[derive(Clone, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "pubkey_hex")] VerifyingKey);

impl PublicKey {
    pub fn as_bytes(&self) -> Vec<u8> {
        self.0.to_encoded_point(true).as_bytes().to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ecdsa::Error> {
        VerifyingKey::from_sec1_bytes(bytes).map(PublicKey)
    }

    pub fn from_hex(s: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let bytes = hex::decode(s)?;
        Ok(Self::from_bytes(&bytes)?)
    }

    pub fn verify(&self, hash: &Hash, signature: &Signature) -> bool {
        self.0
            .verify(&hash.to_hex().into_bytes(), &signature.0)
            .is_ok()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}
impl Eq for PublicKey {}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// A keypair that can sign. Only ever held by the key's owner.
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    pub fn generate() -> Self {
        PrivateKey(SigningKey::random(&mut OsRng))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(*self.0.verifying_key())
    }

    pub fn sign(&self, hash: &Hash) -> Signature {
        Signature(self.0.sign(hash.to_hex().as_bytes()))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ecdsa::Error> {
        SigningKey::from_slice(bytes).map(PrivateKey)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let bytes = hex::decode(s)?;
        Ok(Self::from_bytes(&bytes)?)
    }
}

/// A signature over a transaction hash.
#[derive(Clone, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "sig_hex")] EcdsaSignature);

impl Signature {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let bytes = hex::decode(s)?;
        Ok(Signature(EcdsaSignature::from_slice(&bytes)?))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

mod pubkey_hex {
    use k256::ecdsa::VerifyingKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(key: &VerifyingKey, ser: S) -> Result<S::Ok, S::Error> {
        hex::encode(key.to_encoded_point(true).as_bytes()).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<VerifyingKey, D::Error> {
        let s = String::deserialize(de)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        VerifyingKey::from_sec1_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

mod sig_hex {
    use k256::ecdsa::Signature;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(sig: &Signature, ser: S) -> Result<S::Ok, S::Error> {
        hex::encode(sig.to_bytes()).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Signature, D::Error> {
        let s = String::deserialize(de)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        Signature::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}
