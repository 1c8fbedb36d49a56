use crate::transaction::Transaction;

use super::chain::{Block, Blockchain};

/// Hook invoked synchronously after each successful ledger mutation.
///
/// Implementations must not fail the mutation; anything that goes wrong on
/// their side stays on their side.
pub trait ChainObserver: Send + Sync {
    fn on_transaction_added(&self, tx: &Transaction);

    /// Called after `block` has been appended and difficulty adjusted.
    fn on_block_mined(&self, block: &Block, chain: &Blockchain);

    /// Called with the pending transactions a new block made stale, after
    /// `on_block_mined`.
    fn on_transactions_dropped(&self, _dropped: &[Transaction]) {}
}
