use crate::transaction::Transaction;
use sha2::{Digest, Sha256};

pub const GENESIS_PREVIOUS_HASH: &str = "0";
pub const GENESIS_VALIDATOR: &str = "system";
/// Fixed so that independently bootstrapped nodes agree on the genesis hash.
pub const GENESIS_TIMESTAMP: u64 = 1672531200000;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
    pub previous_hash: String,
    pub hash: String,
    pub nonce: u64,
    /// Hex signature of `hash` by `validator`; empty on genesis.
    pub signature: String,
    pub validator: String,
}

impl Block {
    /// A new unmined block on top of `previous_hash`.
    pub fn new(index: u64, previous_hash: String, transactions: Vec<Transaction>) -> Self {
        let timestamp = chrono::Utc::now().timestamp_millis() as u64;

        let mut block = Block {
            index,
            timestamp,
            transactions,
            previous_hash,
            hash: String::new(),
            nonce: 0,
            signature: String::new(),
            validator: String::new(),
        };
        block.refresh_hash();
        block
    }

    pub fn genesis() -> Self {
        let mut block = Block {
            index: 0,
            timestamp: GENESIS_TIMESTAMP,
            transactions: Vec::new(),
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            hash: String::new(),
            nonce: 0,
            signature: String::new(),
            validator: GENESIS_VALIDATOR.to_string(),
        };
        block.refresh_hash();
        block
    }

    /// H(index, timestamp, transactions, previous_hash, nonce).
    ///
    /// Pure: neither reads nor writes the cached `hash` field.
    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update((self.transactions.len() as u64).to_le_bytes());
        for tx in &self.transactions {
            hasher.update(tx.hash());
        }
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(self.nonce.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn refresh_hash(&mut self) {
        self.hash = self.calculate_hash();
    }

    /// True when the cached hash can be re-derived from the block's fields.
    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    pub fn leading_zero_digits(&self) -> usize {
        self.hash.chars().take_while(|c| *c == '0').count()
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
            && self.previous_hash == GENESIS_PREVIOUS_HASH
            && self.transactions.is_empty()
            && self.validator == GENESIS_VALIDATOR
    }

    pub fn involves(&self, address: &str) -> bool {
        self.transactions.iter().any(|tx| tx.involves(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use serde_json::json;

    fn sample_block() -> Block {
        let alice = Identity::new("alice", "alice@example.com").unwrap();
        let tx = Transaction::seal(&alice, alice.public_key(), "note", &json!({"a": 1})).unwrap();
        Block::new(1, Block::genesis().hash, vec![tx])
    }

    #[test]
    fn test_hash_is_pure() {
        let block = sample_block();
        assert_eq!(block.calculate_hash(), block.calculate_hash());
        assert_eq!(block.hash, block.calculate_hash());
        assert_eq!(block.hash.len(), 64);
    }

    #[test]
    fn test_nonce_changes_hash() {
        let mut block = sample_block();
        let before = block.calculate_hash();
        block.nonce += 1;
        assert_ne!(before, block.calculate_hash());
        assert!(!block.has_valid_hash());
        block.refresh_hash();
        assert!(block.has_valid_hash());
    }

    #[test]
    fn test_every_hashed_field_invalidates() {
        let original = sample_block();

        let mut b = original.clone();
        b.index = 2;
        assert!(!b.has_valid_hash());

        let mut b = original.clone();
        b.timestamp += 1;
        assert!(!b.has_valid_hash());

        let mut b = original.clone();
        b.previous_hash = "ff".to_string();
        assert!(!b.has_valid_hash());

        let mut b = original.clone();
        b.transactions[0].payload.push('A');
        assert!(!b.has_valid_hash());

        let mut b = original;
        b.transactions.clear();
        assert!(!b.has_valid_hash());
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let a = Block::genesis();
        let b = Block::genesis();
        assert_eq!(a, b);
        assert!(a.is_genesis());
        assert_eq!(a.previous_hash, "0");
        assert_eq!(a.validator, "system");
        assert!(a.has_valid_hash());
    }
}
