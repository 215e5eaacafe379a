use crate::sha256::Hash;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct MerkleRoot(Hash);

impl MerkleRoot {
    /// Calculates the Merkle root from a slice of transactions.
    ///
    /// Hashes each transaction into the first layer, then repeatedly hashes
    /// adjacent pairs together until a single root hash remains. A layer with
    /// an odd count pairs its last element with the sentinel hash rather than
    /// duplicating it, so a block can't be cloned into a fake sibling to
    /// forge an equal-looking root.
    pub fn calculate(transactions: &[Transaction]) -> MerkleRoot {
        if transactions.is_empty() {
            return MerkleRoot::empty();
        }

        let mut layer: Vec<Hash> = transactions.iter().map(Hash::hash).collect();
        while layer.len() > 1 {
            let mut new_layer = vec![];
            for pair in layer.chunks(2) {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or_else(sentinel_hash);
                new_layer.push(Hash::hash(&[left, right]));
            }
            layer = new_layer
        }
        MerkleRoot(layer[0])
    }

    /// The well-known root of an empty transaction list. Coincides with the
    /// sentinel hash: a tree of two missing children hashes the same as one.
    pub fn empty() -> MerkleRoot {
        MerkleRoot(sentinel_hash())
    }

    pub fn hash(&self) -> Hash {
        self.0
    }
}

/// Stand-in hash for a missing Merkle sibling or an empty transaction list.
fn sentinel_hash() -> Hash {
    Hash::hash(&Vec::<u8>::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_has_well_known_root() {
        assert_eq!(MerkleRoot::calculate(&[]), MerkleRoot::empty());
    }

    #[test]
    fn order_sensitive() {
        let a = Transaction::new_test_unspendable(1);
        let b = Transaction::new_test_unspendable(2);
        let forward = MerkleRoot::calculate(&[a.clone(), b.clone()]);
        let backward = MerkleRoot::calculate(&[b, a]);
        assert_ne!(forward, backward);
    }

    #[test]
    fn odd_layer_pairs_with_sentinel_not_a_duplicate() {
        let a = Transaction::new_test_unspendable(1);
        let b = Transaction::new_test_unspendable(2);
        let c = Transaction::new_test_unspendable(3);

        let left = Hash::hash(&[Hash::hash(&a), Hash::hash(&b)]);
        let duplicated_root = Hash::hash(&[left, Hash::hash(&[Hash::hash(&c), Hash::hash(&c)])]);
        let sentinel_root = Hash::hash(&[left, Hash::hash(&[Hash::hash(&c), sentinel_hash()])]);

        let root = MerkleRoot::calculate(&[a, b, c]);
        assert_eq!(root.hash(), sentinel_root);
        assert_ne!(root.hash(), duplicated_root);
    }
}
