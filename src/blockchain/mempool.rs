//! Pending transactions waiting for the next mined block.

use crate::error::ChainError;
use crate::transaction::Transaction;
use std::collections::HashSet;
use uuid::Uuid;

/// Upper bound on queued transactions
pub const MAX_MEMPOOL_SIZE: usize = 10_000;

#[derive(Debug, Clone, Default)]
pub struct Mempool {
    transactions: Vec<Transaction>,
    seen: HashSet<Uuid>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transaction(&mut self, tx: Transaction) -> Result<(), ChainError> {
        tx.validate()?;
        if self.transactions.len() >= MAX_MEMPOOL_SIZE {
            return Err(ChainError::InvalidTransaction("Mempool is full".to_string()));
        }
        if !self.seen.insert(tx.process_id) {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction {} already pending",
                tx.process_id
            )));
        }
        self.transactions.push(tx);
        Ok(())
    }

    /// Pending transactions in arrival order.
    pub fn pending(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Drops every pending transaction that appears in `included`.
    pub fn remove_included(&mut self, included: &[Transaction]) {
        let ids: HashSet<Uuid> = included.iter().map(|tx| tx.process_id).collect();
        self.transactions.retain(|tx| !ids.contains(&tx.process_id));
        self.seen.retain(|id| !ids.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use serde_json::json;

    #[test]
    fn test_add_and_remove() {
        let alice = Identity::new("alice", "alice@example.com").unwrap();
        let mut pool = Mempool::new();
        let tx1 = Transaction::seal(&alice, alice.public_key(), "one", &json!(1)).unwrap();
        let tx2 = Transaction::seal(&alice, alice.public_key(), "two", &json!(2)).unwrap();

        pool.add_transaction(tx1.clone()).unwrap();
        pool.add_transaction(tx2.clone()).unwrap();
        assert!(pool.add_transaction(tx1.clone()).is_err());
        assert_eq!(pool.len(), 2);

        pool.remove_included(&[tx1]);
        assert_eq!(pool.pending(), &[tx2]);
    }
}
