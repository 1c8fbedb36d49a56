//! Pending transaction pool
//!
//! Keeps admission order so that mining takes the oldest transactions first.

use crate::error::ChainError;
use crate::transaction::Transaction;
use std::collections::{HashMap, VecDeque};

/// Upper bound on queued transactions.
pub const MAX_MEMPOOL_SIZE: usize = 10_000;

#[derive(Debug, Clone, Default)]
pub struct Mempool {
    order: VecDeque<String>,
    transactions: HashMap<String, Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transaction(&mut self, tx: Transaction) -> Result<(), ChainError> {
        if self.transactions.contains_key(&tx.hash) {
            return Err(ChainError::InvalidTransaction(format!(
                "Duplicate transaction {}",
                tx.hash
            )));
        }
        if self.transactions.len() >= MAX_MEMPOOL_SIZE {
            return Err(ChainError::CapacityError(format!(
                "Mempool is full ({} transactions)",
                MAX_MEMPOOL_SIZE
            )));
        }
        self.order.push_back(tx.hash.clone());
        self.transactions.insert(tx.hash.clone(), tx);
        Ok(())
    }

    pub fn remove_transaction(&mut self, hash: &str) -> Option<Transaction> {
        let removed = self.transactions.remove(hash)?;
        self.order.retain(|h| h != hash);
        Some(removed)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.transactions.contains_key(hash)
    }

    pub fn get(&self, hash: &str) -> Option<&Transaction> {
        self.transactions.get(hash)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Transactions in admission order.
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.order.iter().filter_map(|h| self.transactions.get(h))
    }

    pub fn get_all_transactions(&self) -> Vec<Transaction> {
        self.transactions().cloned().collect()
    }

    /// Sum of amounts `address` has queued as sender.
    pub fn pending_debits(&self, address: &str) -> u64 {
        self.transactions()
            .filter(|tx| tx.from.as_deref() == Some(address))
            .fold(0u64, |acc, tx| acc.saturating_add(tx.amount))
    }

    pub fn pending_count(&self, address: &str) -> u64 {
        self.transactions()
            .filter(|tx| tx.from.as_deref() == Some(address))
            .count() as u64
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.transactions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(from: &str, to: &str, amount: u64, ts: u64) -> Transaction {
        Transaction::with_timestamp(Some(from.to_string()), to.to_string(), amount, ts)
    }

    #[test]
    fn test_keeps_admission_order() {
        let mut pool = Mempool::new();
        let a = tx("alice", "bob", 1, 3);
        let b = tx("alice", "carol", 2, 1);
        let c = tx("dave", "bob", 3, 2);
        for t in [a.clone(), b.clone(), c.clone()] {
            pool.add_transaction(t).unwrap();
        }
        let hashes: Vec<_> = pool.transactions().map(|t| t.hash.clone()).collect();
        assert_eq!(hashes, vec![a.hash, b.hash.clone(), c.hash]);

        pool.remove_transaction(&b.hash);
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&b.hash));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut pool = Mempool::new();
        let a = tx("alice", "bob", 1, 1);
        pool.add_transaction(a.clone()).unwrap();
        assert!(matches!(
            pool.add_transaction(a),
            Err(ChainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_pending_debits_per_sender() {
        let mut pool = Mempool::new();
        pool.add_transaction(tx("alice", "bob", 10, 1)).unwrap();
        pool.add_transaction(tx("alice", "carol", 5, 2)).unwrap();
        pool.add_transaction(tx("bob", "alice", 7, 3)).unwrap();
        assert_eq!(pool.pending_debits("alice"), 15);
        assert_eq!(pool.pending_count("alice"), 2);
        assert_eq!(pool.pending_debits("carol"), 0);
    }
}
