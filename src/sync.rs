//! Live-chain to storage synchronization
//!
//! `SyncManager` is the only component that reads the live chain and writes
//! through to storage:
//! - real-time mirroring via the ledger observer hooks
//! - periodic incremental sync for blocks that bypassed the hooks
//! - full resync, integrity verification and restore-from-storage
//!
//! Hook-path failures are logged and kept in the error list; they never
//! reach the ledger mutation that triggered them.

use crate::blockchain::{Block, Blockchain, ChainObserver};
use crate::config::LedgerConfig;
use crate::error::ChainError;
use crate::scheduler::{ScheduledTask, TaskControl};
use crate::storage::ChainStore;
use crate::transaction::{now_millis, Transaction};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Oldest entries are dropped past this many recorded errors.
pub const MAX_SYNC_ERRORS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Synced,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorRecord {
    pub timestamp: u64,
    pub operation: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_synced_block: Option<u64>,
    pub blocks_synced: u64,
    pub transactions_synced: u64,
    pub last_sync_time: Option<u64>,
    pub errors: Vec<SyncErrorRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMismatch {
    pub index: u64,
    pub live_hash: String,
    pub stored_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub checked_blocks: u64,
    pub mismatches: Vec<BlockMismatch>,
    pub chain_state_consistent: bool,
    pub is_valid: bool,
}

struct SyncInner {
    state: SyncState,
    last_synced_block: Option<u64>,
    blocks_synced: u64,
    transactions_synced: u64,
    last_sync_time: Option<u64>,
    errors: VecDeque<SyncErrorRecord>,
}

pub struct SyncManager {
    store: Arc<ChainStore>,
    inner: Mutex<SyncInner>,
}

impl SyncManager {
    /// Picks up where a previous run left off using the stored chain state.
    pub fn new(store: Arc<ChainStore>) -> Result<Self, ChainError> {
        let chain_state = store.get_chain_state()?;
        Ok(SyncManager {
            store,
            inner: Mutex::new(SyncInner {
                state: SyncState::Idle,
                last_synced_block: chain_state.latest_block_index,
                blocks_synced: 0,
                transactions_synced: 0,
                last_sync_time: None,
                errors: VecDeque::new(),
            }),
        })
    }

    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    pub fn status(&self) -> SyncStatus {
        let inner = self.inner.lock();
        SyncStatus {
            state: inner.state,
            last_synced_block: inner.last_synced_block,
            blocks_synced: inner.blocks_synced,
            transactions_synced: inner.transactions_synced,
            last_sync_time: inner.last_sync_time,
            errors: inner.errors.iter().cloned().collect(),
        }
    }

    pub fn errors(&self) -> Vec<SyncErrorRecord> {
        self.inner.lock().errors.iter().cloned().collect()
    }

    pub fn clear_errors(&self) {
        self.inner.lock().errors.clear();
    }

    fn record_error(inner: &mut SyncInner, operation: &str, err: &ChainError) {
        error!(operation, error = %err, "Storage sync failed");
        if inner.errors.len() >= MAX_SYNC_ERRORS {
            inner.errors.pop_front();
        }
        inner.errors.push_back(SyncErrorRecord {
            timestamp: now_millis(),
            operation: operation.to_string(),
            message: err.to_string(),
        });
    }

    /// Persists every live block past `last_synced_block`. Stops at the
    /// first failure and returns how many blocks were written.
    pub fn perform_incremental_sync(&self, chain: &Blockchain) -> Result<u64, ChainError> {
        let mut inner = self.inner.lock();
        let result = self.sync_blocks(&mut inner, chain);
        match &result {
            Ok(_) => inner.state = SyncState::Synced,
            Err(e) => {
                inner.state = SyncState::Failed;
                Self::record_error(&mut inner, "incremental_sync", e);
            }
        }
        result
    }

    fn sync_blocks(&self, inner: &mut SyncInner, chain: &Blockchain) -> Result<u64, ChainError> {
        if let Some(last) = inner.last_synced_block {
            let live = chain.get_block(last).map(|b| b.hash.clone());
            let stored = self.store.get_block(last)?.map(|b| b.hash);
            if live.is_some() && live != stored {
                return Err(ChainError::IntegrityError(format!(
                    "Live chain diverges from storage at block {}; a full resync is required",
                    last
                )));
            }
        }

        let start = inner.last_synced_block.map_or(0, |i| i + 1) as usize;
        if start >= chain.blocks.len() {
            return Ok(0);
        }

        inner.state = SyncState::Syncing;
        let mut synced = 0;
        for block in &chain.blocks[start..] {
            self.store.store_block(block)?;
            inner.last_synced_block = Some(block.index);
            inner.blocks_synced += 1;
            inner.transactions_synced += block.transactions.len() as u64;
            synced += 1;
        }
        inner.last_sync_time = Some(now_millis());
        if synced > 0 {
            debug!(blocks = synced, head = ?inner.last_synced_block, "Incremental sync complete");
        }
        Ok(synced)
    }

    /// Clears storage and rewrites it from the live chain and mempool.
    pub fn perform_full_resync(&self, chain: &Blockchain) -> Result<u64, ChainError> {
        let mut inner = self.inner.lock();
        inner.state = SyncState::Syncing;

        let result = self.store.clear().and_then(|_| {
            inner.last_synced_block = None;
            let synced = self.sync_blocks(&mut inner, chain)?;
            for tx in chain.pending_transactions() {
                self.store.store_transaction(&tx, None)?;
            }
            Ok(synced)
        });

        match &result {
            Ok(synced) => {
                inner.state = SyncState::Synced;
                info!(blocks = synced, "Full resync complete");
            }
            Err(e) => {
                inner.state = SyncState::Failed;
                Self::record_error(&mut inner, "full_resync", e);
            }
        }
        result
    }

    /// Rebuilds a chain from the stored blocks `0..totalBlocks`, then
    /// re-admits stored pending transactions that still apply. Returns
    /// `None` when storage holds no chain.
    pub fn restore_from_storage(&self, config: LedgerConfig) -> Result<Option<Blockchain>, ChainError> {
        let chain_state = self.store.get_chain_state()?;
        if chain_state.total_blocks == 0 {
            return Ok(None);
        }

        let mut blocks: Vec<Block> = Vec::with_capacity(chain_state.total_blocks as usize);
        for index in 0..chain_state.total_blocks {
            let block = self.store.get_block(index)?.ok_or_else(|| {
                ChainError::IntegrityError(format!(
                    "Stored chain state lists {} blocks but block {} is missing",
                    chain_state.total_blocks, index
                ))
            })?;
            blocks.push(block);
        }

        let mut chain = Blockchain::from_blocks(blocks, config)?;
        for tx in self.store.get_pending_transactions()? {
            let hash = tx.hash.clone();
            if let Err(e) = chain.add_transaction(tx) {
                warn!(tx_hash = %hash, error = %e, "Dropping stored pending transaction");
            }
        }

        let mut inner = self.inner.lock();
        inner.last_synced_block = chain.latest_block().map(|b| b.index);
        inner.state = SyncState::Synced;
        inner.last_sync_time = Some(now_millis());
        info!(
            blocks = chain.blocks.len(),
            pending = chain.mempool.len(),
            "Chain restored from storage"
        );
        Ok(Some(chain))
    }

    /// Compares every synced block's live hash with the stored one. Reports
    /// mismatches; does not fix them.
    pub fn verify_integrity(&self, chain: &Blockchain) -> Result<IntegrityReport, ChainError> {
        let last_synced = self.inner.lock().last_synced_block;
        let mut mismatches = Vec::new();
        let mut checked = 0;

        if let Some(last) = last_synced {
            for index in 0..=last {
                let Some(live) = chain.get_block(index) else {
                    break;
                };
                checked += 1;
                let stored = self.store.get_block(index)?.map(|b| b.hash);
                if stored.as_deref() != Some(live.hash.as_str()) {
                    warn!(index, live = %live.hash, stored = ?stored, "Stored block does not match live chain");
                    mismatches.push(BlockMismatch {
                        index,
                        live_hash: live.hash.clone(),
                        stored_hash: stored,
                    });
                }
            }
        }

        let chain_state = self.store.get_chain_state()?;
        let chain_state_consistent = chain_state.latest_block_index == last_synced
            && chain_state.total_blocks == last_synced.map_or(0, |i| i + 1);
        if !chain_state_consistent {
            warn!(
                stored_head = ?chain_state.latest_block_index,
                synced_head = ?last_synced,
                "Chain state summary disagrees with sync position"
            );
        }

        Ok(IntegrityReport {
            checked_blocks: checked,
            is_valid: mismatches.is_empty() && chain_state_consistent,
            mismatches,
            chain_state_consistent,
        })
    }

    /// Runs an incremental sync every `period` until cancelled.
    pub fn start_periodic_sync(self: &Arc<Self>, chain: Arc<RwLock<Blockchain>>, period: Duration) -> ScheduledTask {
        let manager = Arc::clone(self);
        ScheduledTask::spawn_periodic("storage-sync", period, move || {
            let manager = Arc::clone(&manager);
            let chain = Arc::clone(&chain);
            async move {
                let chain = chain.read().await;
                // Failures are already recorded in the error list.
                let _ = manager.perform_incremental_sync(&chain);
                TaskControl::Continue
            }
        })
    }
}

impl ChainObserver for SyncManager {
    fn on_transaction_added(&self, tx: &Transaction) {
        if let Err(e) = self.store.store_transaction(tx, None) {
            Self::record_error(&mut self.inner.lock(), "store_pending_transaction", &e);
        }
    }

    fn on_block_mined(&self, _block: &Block, chain: &Blockchain) {
        let _ = self.perform_incremental_sync(chain);
    }

    fn on_transactions_dropped(&self, dropped: &[Transaction]) {
        for tx in dropped {
            if let Err(e) = self.store.discard_pending_transaction(tx) {
                Self::record_error(&mut self.inner.lock(), "discard_pending_transaction", &e);
            }
        }
    }
}
