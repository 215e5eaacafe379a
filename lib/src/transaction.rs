use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{BtcError, Result};
use crate::script;
use crate::sha256::Hash;
use chrono::{DateTime, Utc};

/// Sentinel `output_index` marking a transaction input as a coinbase claim.
pub const COINBASE_OUTPUT_INDEX: i64 = -1;

/// Identifies a spendable coin: the transaction that created it, and which
/// of its targets.
pub type OutputKey = (Hash, i64);

/// One input: either a pointer to a previously created, unspent coin plus
/// the script that unlocks it, or (when `output_index == -1`) a coinbase claim.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransactionInput {
    pub prev_tx_hash: Hash,
    pub output_index: i64,
    pub unlock_script: String,
}

impl TransactionInput {
    pub fn is_coinbase(&self) -> bool {
        self.output_index == COINBASE_OUTPUT_INDEX
    }

    pub fn output_key(&self) -> OutputKey {
        (self.prev_tx_hash, self.output_index)
    }

    /// The part of an input that is included in the transaction hash.
    /// `unlock_script` is deliberately excluded so spenders can sign the
    /// hash and fill in the unlock script afterwards.
    fn hashable(&self) -> (Hash, i64) {
        (self.prev_tx_hash, self.output_index)
    }
}

/// One target ("coin"): a lock script plus the amount it carries.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TransactionTarget {
    pub script: String,
    pub amount: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub inputs: Vec<TransactionInput>,
    pub targets: Vec<TransactionTarget>,
    pub timestamp: DateTime<Utc>,
    /// Disambiguates otherwise-identical coinbase transactions (same height,
    /// same reward pubkey, same amount would hash identically without this).
    pub iv: Option<Vec<u8>>,
}

/// The subset of a transaction that its hash is computed over: everything
/// except signatures and unlock scripts, so a spender can sign the hash
/// before the unlock script that carries the signature even exists.
#[derive(Serialize)]
struct Hashable<'a> {
    iv: &'a Option<Vec<u8>>,
    targets: &'a [TransactionTarget],
    inputs: Vec<(Hash, i64)>,
}

impl Transaction {
    pub fn new(
        inputs: Vec<TransactionInput>,
        targets: Vec<TransactionTarget>,
        timestamp: DateTime<Utc>,
        iv: Option<Vec<u8>>,
    ) -> Self {
        Transaction {
            inputs,
            targets,
            timestamp,
            iv,
        }
    }

    pub fn coinbase(reward_script: String, amount: u64, timestamp: DateTime<Utc>, iv: Vec<u8>) -> Self {
        Transaction {
            inputs: vec![TransactionInput {
                prev_tx_hash: Hash::zero(),
                output_index: COINBASE_OUTPUT_INDEX,
                unlock_script: String::new(),
            }],
            targets: vec![TransactionTarget {
                script: reward_script,
                amount,
            }],
            timestamp,
            iv: Some(iv),
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    pub fn hash(&self) -> Hash {
        let hashable = Hashable {
            iv: &self.iv,
            targets: &self.targets,
            inputs: self.inputs.iter().map(TransactionInput::hashable).collect(),
        };
        Hash::hash(&hashable)
    }

    pub fn total_output(&self) -> u64 {
        self.targets.iter().map(|t| t.amount).sum()
    }

    /// Validates this transaction against a UTXO snapshot: every input must
    /// reference a coin that exists and unlock it, and inputs must cover
    /// outputs. Coinbase acceptance of the reward amount is the enclosing
    /// block's responsibility, not this transaction's.
    pub fn validate(&self, utxo: &std::collections::HashMap<OutputKey, TransactionTarget>) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let tx_hash = self.hash();
        let mut input_total: u64 = 0;
        for input in &self.inputs {
            if input.is_coinbase() {
                return Err(BtcError::InvalidTransaction);
            }
            let prev_target = utxo
                .get(&input.output_key())
                .ok_or(BtcError::InvalidCoin)?;

            if !script::execute(&input.unlock_script, &prev_target.script, &tx_hash) {
                return Err(BtcError::InvalidSignature);
            }
            input_total = input_total
                .checked_add(prev_target.amount)
                .ok_or(BtcError::InvalidTransaction)?;
        }

        let output_total = self.total_output();
        if input_total < output_total {
            return Err(BtcError::InvalidTransaction);
        }
        Ok(())
    }

    /// The fee this transaction pays: the gap between inputs spent and
    /// outputs created. Requires `validate` to have already succeeded
    /// (coinbase transactions have no meaningful fee and return 0).
    pub fn fee(&self, utxo: &std::collections::HashMap<OutputKey, TransactionTarget>) -> u64 {
        if self.is_coinbase() {
            return 0;
        }
        let input_total: u64 = self
            .inputs
            .iter()
            .filter_map(|i| utxo.get(&i.output_key()))
            .map(|t| t.amount)
            .sum();
        input_total.saturating_sub(self.total_output())
    }

    /// True iff any input of this transaction is also spent by a transaction
    /// in `others`. Used for mempool admission and same-block double-spend
    /// detection.
    pub fn check_conflict(&self, others: &HashSet<OutputKey>) -> bool {
        self.inputs.iter().any(|i| others.contains(&i.output_key()))
    }

    #[cfg(test)]
    pub fn new_test_unspendable(nonce: u64) -> Self {
        Transaction::coinbase(
            "OP_RETURN".to_string(),
            nonce,
            Utc::now(),
            nonce.to_le_bytes().to_vec(),
        )
    }
}
