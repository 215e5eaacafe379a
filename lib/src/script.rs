//! A minimal, non-looping stack-based script interpreter.
//!
//! Tokens are whitespace separated; unrecognized tokens are pushed as data.
//! The four opcodes below are the only ones consensus requires.
use crate::crypto::{PrivateKey, PublicKey, Signature};
use crate::sha256::Hash;
use chrono::{TimeZone, Utc};
use sha2::{Digest, Sha256};

const TRUE: &str = "1";
const FALSE: &str = "0";

/// The canonical pay-to-pubkey lock script: `"<pubkey> OP_CHECKSIG"`.
pub fn pay_to_pubkey(pubkey: &PublicKey) -> String {
    format!("{} OP_CHECKSIG", pubkey.to_hex())
}

/// The unlock script that satisfies a `pay_to_pubkey` lock script signed
/// with `key` over `tx_hash`.
pub fn sign_pay_to_pubkey(key: &PrivateKey, tx_hash: &Hash) -> String {
    format!("{} {}", key.sign(tx_hash).to_hex(), key.public_key().to_hex())
}

/// Executes `unlock_script` followed by `lock_script` against `tx_hash`.
///
/// Returns `true` iff the stack holds exactly `["1"]` once every token has
/// been consumed.
pub fn execute(unlock_script: &str, lock_script: &str, tx_hash: &Hash) -> bool {
    let mut stack: Vec<String> = Vec::new();
    let tokens = unlock_script.split_whitespace().chain(lock_script.split_whitespace());

    for token in tokens {
        let ok = match token {
            "OP_SHA256" => op_sha256(&mut stack),
            "OP_CHECKSIG" => op_checksig(&mut stack, tx_hash),
            "OP_RETURN" => op_return(&mut stack),
            "OP_CHECKLOCKTIME" => op_checklocktime(&mut stack),
            data => {
                stack.push(data.to_string());
                true
            }
        };
        if !ok {
            return false;
        }
    }

    stack.len() == 1 && stack[0] == TRUE
}

fn op_sha256(stack: &mut Vec<String>) -> bool {
    let Some(top) = stack.pop() else {
        tracing::warn!("OP_SHA256: stack is empty");
        return false;
    };
    let digest = Sha256::digest(top.as_bytes());
    stack.push(hex::encode(digest));
    true
}

fn op_checksig(stack: &mut Vec<String>, tx_hash: &Hash) -> bool {
    if stack.len() < 2 {
        tracing::warn!("OP_CHECKSIG: not enough arguments");
        stack.push(FALSE.to_string());
        return false;
    }
    let pubkey_hex = stack.pop().unwrap();
    let sig_hex = stack.pop().unwrap();

    let verified = (|| -> Option<bool> {
        let pubkey = PublicKey::from_hex(&pubkey_hex).ok()?;
        let signature = Signature::from_hex(&sig_hex).ok()?;
        Some(pubkey.verify(tx_hash, &signature))
    })()
    .unwrap_or(false);

    if verified {
        stack.push(TRUE.to_string());
        true
    } else {
        tracing::warn!("OP_CHECKSIG: signature not verified");
        stack.push(FALSE.to_string());
        false
    }
}

fn op_return(stack: &mut Vec<String>) -> bool {
    tracing::warn!("OP_RETURN: output is provably unspendable");
    stack.push(FALSE.to_string());
    false
}

fn op_checklocktime(stack: &mut Vec<String>) -> bool {
    let Some(top) = stack.pop() else {
        tracing::warn!("OP_CHECKLOCKTIME: stack is empty");
        stack.push(FALSE.to_string());
        return false;
    };
    let Ok(timestamp) = top.parse::<i64>() else {
        tracing::warn!("OP_CHECKLOCKTIME: top of stack is not a unix timestamp");
        stack.push(FALSE.to_string());
        return false;
    };
    let Some(lock_time) = Utc.timestamp_opt(timestamp, 0).single() else {
        stack.push(FALSE.to_string());
        return false;
    };
    if Utc::now() < lock_time {
        tracing::warn!("OP_CHECKLOCKTIME: lock time has not elapsed yet");
        stack.push(FALSE.to_string());
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;

    #[test]
    fn checksig_accepts_matching_signature() {
        let key = PrivateKey::generate();
        let tx_hash = Hash::hash(&"some transaction");
        let sig = key.sign(&tx_hash);
        let unlock = format!("{} {}", sig.to_hex(), key.public_key().to_hex());
        assert!(execute(&unlock, "OP_CHECKSIG", &tx_hash));
    }

    #[test]
    fn checksig_rejects_wrong_key() {
        let key = PrivateKey::generate();
        let other = PrivateKey::generate();
        let tx_hash = Hash::hash(&"some transaction");
        let sig = key.sign(&tx_hash);
        let unlock = format!("{} {}", sig.to_hex(), other.public_key().to_hex());
        assert!(!execute(&unlock, "OP_CHECKSIG", &tx_hash));
    }

    #[test]
    fn op_return_is_always_unspendable() {
        let tx_hash = Hash::hash(&"x");
        assert!(!execute("anything", "OP_RETURN", &tx_hash));
    }

    #[test]
    fn checklocktime_gates_on_wall_clock() {
        let key = PrivateKey::generate();
        let tx_hash = Hash::hash(&"locked");
        let sig = key.sign(&tx_hash);
        let future = (Utc::now().timestamp() + 3600).to_string();
        let past = (Utc::now().timestamp() - 3600).to_string();

        let unlock = format!("{} {}", sig.to_hex(), key.public_key().to_hex());
        let lock_future = format!("{} OP_CHECKLOCKTIME OP_CHECKSIG", future);
        let lock_past = format!("{} OP_CHECKLOCKTIME OP_CHECKSIG", past);

        assert!(!execute(&unlock, &lock_future, &tx_hash));
        assert!(execute(&unlock, &lock_past, &tx_hash));
    }
}
