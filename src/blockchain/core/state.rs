use crate::crypto::Address;
use crate::error::ChainError;
use crate::transaction::Transaction;
use std::collections::{HashMap, HashSet};

use super::chain::Block;

/// Confirmed account view derived from the applied blocks.
///
/// This is the cached projection used for admission checks; the replay in
/// `Blockchain::get_balance` stays the ground truth.
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    pub balances: HashMap<Address, u64>,
    /// Number of confirmed transfers sent per address.
    pub nonces: HashMap<Address, u64>,
    pub confirmed_hashes: HashSet<String>,
    pub total_transactions: u64,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_blocks(blocks: &[Block]) -> Result<Self, ChainError> {
        let mut state = Self::new();
        for block in blocks {
            state.apply_block(block)?;
        }
        Ok(state)
    }

    pub fn get_balance(&self, address: &str) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    pub fn get_nonce(&self, address: &str) -> u64 {
        self.nonces.get(address).copied().unwrap_or(0)
    }

    pub fn is_confirmed(&self, tx_hash: &str) -> bool {
        self.confirmed_hashes.contains(tx_hash)
    }

    pub fn apply_block(&mut self, block: &Block) -> Result<(), ChainError> {
        for tx in &block.transactions {
            self.apply_transaction(tx)?;
        }
        Ok(())
    }

    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), ChainError> {
        if !self.confirmed_hashes.insert(tx.hash.clone()) {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction {} already confirmed",
                tx.hash
            )));
        }

        if let Some(from) = &tx.from {
            let available = self.get_balance(from);
            if available < tx.amount {
                self.confirmed_hashes.remove(&tx.hash);
                return Err(ChainError::InsufficientBalance {
                    address: from.clone(),
                    available,
                    required: tx.amount,
                });
            }
            self.balances.insert(from.clone(), available - tx.amount);
            *self.nonces.entry(from.clone()).or_insert(0) += 1;
        }

        let receiver = self.balances.entry(tx.to.clone()).or_insert(0);
        *receiver = receiver.saturating_add(tx.amount);
        self.total_transactions += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reward_then_transfer() {
        let mut state = LedgerState::new();
        state
            .apply_transaction(&Transaction::with_timestamp(None, "alice".into(), 50, 1))
            .unwrap();
        state
            .apply_transaction(&Transaction::with_timestamp(
                Some("alice".into()),
                "bob".into(),
                20,
                2,
            ))
            .unwrap();
        assert_eq!(state.get_balance("alice"), 30);
        assert_eq!(state.get_balance("bob"), 20);
        assert_eq!(state.get_nonce("alice"), 1);
        assert_eq!(state.total_transactions, 2);
    }

    #[test]
    fn test_overdraft_leaves_state_untouched() {
        let mut state = LedgerState::new();
        let tx = Transaction::with_timestamp(Some("alice".into()), "bob".into(), 5, 1);
        let err = state.apply_transaction(&tx).unwrap_err();
        assert!(matches!(err, ChainError::InsufficientBalance { required: 5, .. }));
        assert!(!state.is_confirmed(&tx.hash));
        assert_eq!(state.get_balance("bob"), 0);
    }

    #[test]
    fn test_replayed_transaction_rejected() {
        let mut state = LedgerState::new();
        let reward = Transaction::with_timestamp(None, "alice".into(), 50, 1);
        state.apply_transaction(&reward).unwrap();
        assert!(state.apply_transaction(&reward).is_err());
        assert_eq!(state.get_balance("alice"), 50);
    }
}
