use crate::config::LedgerConfig;
use crate::crypto::{compute_hash, is_valid_address};
use crate::error::ChainError;
use crate::mempool::Mempool;
use crate::miner::mine_block;
use crate::transaction::{now_millis, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::observer::ChainObserver;
use super::state::LedgerState;
use super::validation::{
    validate_block_integrity, validate_chain, validate_link, validate_no_duplicate_transactions,
    validate_proof_of_work,
};

pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: u64,
    pub hash: String,
    pub previous_hash: String,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
    pub merkle_root: String,
    pub nonce: u64,
    pub difficulty: u32,
}

impl Block {
    /// Builds an unmined block stamped with the current time.
    pub fn new(index: u64, previous_hash: String, difficulty: u32, transactions: Vec<Transaction>) -> Self {
        let merkle_root = Block::calculate_merkle_root(&transactions);
        let mut block = Block {
            index,
            hash: String::new(),
            previous_hash,
            timestamp: now_millis(),
            transactions,
            merkle_root,
            nonce: 0,
            difficulty,
        };
        block.hash = block.calculate_hash();
        block
    }

    pub fn calculate_hash(&self) -> String {
        let preimage = format!(
            "{}|{}|{}|{}|{}|{}",
            self.index, self.previous_hash, self.timestamp, self.merkle_root, self.nonce, self.difficulty
        );
        compute_hash(preimage.as_bytes())
    }

    /// Pairwise SHA-256 tree over transaction hashes. An odd node is paired
    /// with itself; no transactions hash the empty string.
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> String {
        let mut level: Vec<String> = transactions.iter().map(|tx| tx.hash.clone()).collect();
        if level.is_empty() {
            return compute_hash(b"");
        }

        while level.len() > 1 {
            if level.len() % 2 == 1 {
                if let Some(last) = level.last().cloned() {
                    level.push(last);
                }
            }
            level = level
                .chunks(2)
                .map(|pair| compute_hash(format!("{}{}", pair[0], pair[1]).as_bytes()))
                .collect();
        }
        level.into_iter().next().unwrap_or_default()
    }
}

/// Serializable snapshot of the whole ledger, mempool included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainExport {
    pub blocks: Vec<Block>,
    pub pending_transactions: Vec<Transaction>,
    pub difficulty: u32,
    pub exported_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainInfo {
    pub height: u64,
    pub total_blocks: u64,
    pub latest_hash: String,
    pub difficulty: u32,
    pub pending_transactions: usize,
    pub total_transactions: u64,
    pub mining_reward: u64,
    pub is_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub block_index: Option<u64>,
    pub confirmed: bool,
}

#[derive(Clone)]
pub struct Blockchain {
    pub blocks: Vec<Block>,
    pub difficulty: u32,
    pub mempool: Mempool,
    pub state: LedgerState,
    config: LedgerConfig,
    observer: Option<Arc<dyn ChainObserver>>,
}

impl Blockchain {
    /// Creates a chain holding a freshly mined genesis block that carries the
    /// configured allocations.
    pub fn new(config: LedgerConfig) -> Result<Self, ChainError> {
        if let Some(bad) = config
            .genesis_allocations
            .iter()
            .find(|a| !is_valid_address(&a.address))
        {
            return Err(ChainError::ConfigError(format!(
                "Genesis allocation address is not a 64-character hex address: {}",
                bad.address
            )));
        }
        let timestamp = now_millis();
        let allocations: Vec<Transaction> = config
            .genesis_allocations
            .iter()
            .filter(|a| a.amount > 0)
            .enumerate()
            .map(|(i, a)| {
                Transaction::with_timestamp(None, a.address.clone(), a.amount, timestamp)
                    .with_nonce(i as u64)
            })
            .collect();

        let genesis = Block::new(
            0,
            GENESIS_PREVIOUS_HASH.to_string(),
            config.initial_difficulty,
            allocations,
        );
        let genesis = mine_block(genesis)?;
        let state = LedgerState::from_blocks(std::slice::from_ref(&genesis))?;
        info!(hash = %genesis.hash, allocations = genesis.transactions.len(), "Genesis block created");

        Ok(Blockchain {
            blocks: vec![genesis],
            difficulty: config.initial_difficulty,
            mempool: Mempool::new(),
            state,
            config,
            observer: None,
        })
    }

    /// Rebuilds a chain from an ordered block list, checking linkage and
    /// recomputing the confirmed state.
    pub fn from_blocks(blocks: Vec<Block>, config: LedgerConfig) -> Result<Self, ChainError> {
        validate_chain(&blocks)?;
        let state = LedgerState::from_blocks(&blocks)?;
        let difficulty = blocks
            .last()
            .map(|b| b.difficulty)
            .unwrap_or(config.initial_difficulty)
            .clamp(1, config.max_difficulty.max(1));

        let mut chain = Blockchain {
            blocks,
            difficulty,
            mempool: Mempool::new(),
            state,
            config,
            observer: None,
        };
        chain.adjust_difficulty();
        Ok(chain)
    }

    pub fn set_observer(&mut self, observer: Arc<dyn ChainObserver>) {
        self.observer = Some(observer);
    }

    pub fn clear_observer(&mut self) {
        self.observer = None;
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn latest_block(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn height(&self) -> u64 {
        self.latest_block().map_or(0, |b| b.index)
    }

    pub fn get_block(&self, index: u64) -> Option<&Block> {
        self.blocks.get(index as usize).filter(|b| b.index == index)
    }

    pub fn get_block_by_hash(&self, hash: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.hash == hash)
    }

    /// Confirmed balance minus what the address already has queued to send.
    pub fn available_balance(&self, address: &str) -> u64 {
        self.state
            .get_balance(address)
            .saturating_sub(self.mempool.pending_debits(address))
    }

    pub fn next_nonce(&self, address: &str) -> u64 {
        self.state.get_nonce(address) + self.mempool.pending_count(address)
    }

    pub fn add_transaction(&mut self, tx: Transaction) -> Result<(), ChainError> {
        let Some(from) = tx.from.clone() else {
            return Err(ChainError::InvalidTransaction(
                "Reward transactions can only be created by mining".to_string(),
            ));
        };

        tx.validate()?;

        if self.state.is_confirmed(&tx.hash) || self.mempool.contains(&tx.hash) {
            return Err(ChainError::InvalidTransaction(format!(
                "Duplicate transaction {}",
                tx.hash
            )));
        }

        if let Some(nonce) = tx.nonce {
            let expected = self.next_nonce(&from);
            if nonce != expected {
                return Err(ChainError::InvalidTransaction(format!(
                    "Invalid nonce for {}: expected {}, got {}",
                    from, expected, nonce
                )));
            }
        }

        let available = self.available_balance(&from);
        if tx.amount > available {
            return Err(ChainError::InsufficientBalance {
                address: from,
                available,
                required: tx.amount,
            });
        }

        self.mempool.add_transaction(tx.clone())?;
        debug!(tx_hash = %tx.hash, amount = tx.amount, "Transaction admitted to mempool");

        if let Some(observer) = self.observer.clone() {
            observer.on_transaction_added(&tx);
        }
        Ok(())
    }

    /// Selects up to the batch size of pending transactions that still fit
    /// their senders' balances, appends the reward and returns the unmined
    /// candidate on top of the current head.
    pub fn prepare_block(&self, reward_address: &str) -> Result<Block, ChainError> {
        if !is_valid_address(reward_address) {
            return Err(ChainError::InvalidTransaction(format!(
                "Reward address is not a 64-character hex address: {}",
                reward_address
            )));
        }
        let latest = self
            .latest_block()
            .ok_or_else(|| ChainError::InvalidBlock("Chain has no genesis block".to_string()))?;

        let mut running: HashMap<&str, u64> = HashMap::new();
        let mut selected = Vec::new();
        for tx in self.mempool.transactions() {
            if selected.len() >= self.config.max_block_transactions {
                break;
            }
            let Some(from) = tx.from.as_deref() else {
                continue;
            };
            let balance = *running
                .entry(from)
                .or_insert_with(|| self.state.get_balance(from));
            if balance < tx.amount {
                warn!(tx_hash = %tx.hash, "Skipping transaction that would overdraw its sender");
                continue;
            }
            running.insert(from, balance - tx.amount);
            let to = running
                .entry(tx.to.as_str())
                .or_insert_with(|| self.state.get_balance(&tx.to));
            *to = to.saturating_add(tx.amount);
            selected.push(tx.clone());
        }

        let index = latest.index + 1;
        selected.push(
            Transaction::reward(reward_address.to_string(), self.config.mining_reward)
                .with_nonce(index),
        );
        Ok(Block::new(index, latest.hash.clone(), self.difficulty, selected))
    }

    /// Mines the next block paying the reward to `reward_address`.
    ///
    /// The proof-of-work runs while `self` is exclusively borrowed; callers
    /// that share the chain should use `prepare_block` and `add_block`.
    pub fn mine_pending_transactions(&mut self, reward_address: &str) -> Result<Block, ChainError> {
        let candidate = self.prepare_block(reward_address)?;
        let block = mine_block(candidate)?;
        self.add_block(block.clone())?;
        Ok(block)
    }

    /// Validates and appends a block built on the current head.
    pub fn add_block(&mut self, block: Block) -> Result<(), ChainError> {
        let latest = self
            .latest_block()
            .ok_or_else(|| ChainError::InvalidBlock("Chain has no genesis block".to_string()))?;
        validate_link(latest, &block)?;
        validate_block_integrity(&block)?;
        if block.difficulty != self.difficulty {
            return Err(ChainError::InvalidBlock(format!(
                "Block difficulty {} does not match chain difficulty {}",
                block.difficulty, self.difficulty
            )));
        }
        validate_proof_of_work(&block)?;
        validate_no_duplicate_transactions(&block)?;

        let mut rewards = 0;
        for tx in &block.transactions {
            if tx.is_reward() {
                rewards += 1;
                if tx.amount > self.config.mining_reward {
                    return Err(ChainError::InvalidBlock(format!(
                        "Reward {} exceeds mining reward {}",
                        tx.amount, self.config.mining_reward
                    )));
                }
            }
            tx.validate()?;
        }
        if rewards > 1 {
            return Err(ChainError::InvalidBlock(
                "Block carries more than one reward transaction".to_string(),
            ));
        }

        let mut next_state = self.state.clone();
        next_state.apply_block(&block)?;
        self.state = next_state;

        for tx in &block.transactions {
            self.mempool.remove_transaction(&tx.hash);
        }
        info!(
            index = block.index,
            hash = %block.hash,
            transactions = block.transactions.len(),
            "Block added"
        );
        self.blocks.push(block);
        let dropped = self.prune_mempool();
        self.adjust_difficulty();

        if let Some(observer) = self.observer.clone() {
            if let Some(block) = self.blocks.last() {
                observer.on_block_mined(block, self);
            }
            if !dropped.is_empty() {
                observer.on_transactions_dropped(&dropped);
            }
        }
        Ok(())
    }

    /// Drops pending transactions that no longer fit their sender's
    /// confirmed balance or that were confirmed elsewhere. Returns them.
    fn prune_mempool(&mut self) -> Vec<Transaction> {
        let mut running: HashMap<&str, u64> = HashMap::new();
        let mut stale = Vec::new();
        for tx in self.mempool.transactions() {
            let Some(from) = tx.from.as_deref() else {
                stale.push(tx.hash.clone());
                continue;
            };
            if self.state.is_confirmed(&tx.hash) {
                stale.push(tx.hash.clone());
                continue;
            }
            let balance = running
                .entry(from)
                .or_insert_with(|| self.state.get_balance(from));
            if *balance < tx.amount {
                stale.push(tx.hash.clone());
            } else {
                *balance -= tx.amount;
            }
        }
        stale
            .into_iter()
            .filter_map(|hash| {
                warn!(tx_hash = %hash, "Dropping pending transaction that no longer applies");
                self.mempool.remove_transaction(&hash)
            })
            .collect()
    }

    /// Compares the gap between the two newest blocks with the target block
    /// time and nudges difficulty by one step within `[1, max_difficulty]`.
    fn adjust_difficulty(&mut self) {
        let n = self.blocks.len();
        if n < 2 {
            return;
        }
        let delta = self.blocks[n - 1]
            .timestamp
            .saturating_sub(self.blocks[n - 2].timestamp);
        let target = self.config.target_block_time_ms;
        let max = self.config.max_difficulty.max(1);

        let previous = self.difficulty;
        if delta < target / 2 {
            self.difficulty = (self.difficulty + 1).min(max);
        } else if delta > target.saturating_mul(2) {
            self.difficulty = self.difficulty.saturating_sub(1).max(1);
        }
        if self.difficulty != previous {
            debug!(from = previous, to = self.difficulty, delta_ms = delta, "Difficulty adjusted");
        }
    }

    /// Fail-fast walk over hash, merkle and linkage.
    pub fn validate_chain(&self) -> Result<(), ChainError> {
        validate_chain(&self.blocks)
    }

    pub fn is_chain_valid(&self) -> bool {
        match self.validate_chain() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Chain validation failed");
                false
            }
        }
    }

    /// Balance by replaying every confirmed transaction.
    pub fn get_balance(&self, address: &str) -> u64 {
        let mut balance: u64 = 0;
        for tx in self.blocks.iter().flat_map(|b| b.transactions.iter()) {
            if tx.to == address {
                balance = balance.saturating_add(tx.amount);
            }
            if tx.from.as_deref() == Some(address) {
                balance = balance.saturating_sub(tx.amount);
            }
        }
        balance
    }

    /// Newest first: pending entries, then confirmed ones from the head down.
    pub fn get_transaction_history(&self, address: &str, limit: usize, offset: usize) -> Vec<HistoryEntry> {
        let pending = self
            .mempool
            .get_all_transactions()
            .into_iter()
            .rev()
            .filter(|tx| tx.involves(address))
            .map(|transaction| HistoryEntry {
                transaction,
                block_index: None,
                confirmed: false,
            });

        let confirmed = self.blocks.iter().rev().flat_map(|block| {
            block
                .transactions
                .iter()
                .rev()
                .filter(|tx| tx.involves(address))
                .map(move |tx| HistoryEntry {
                    transaction: tx.clone(),
                    block_index: Some(block.index),
                    confirmed: true,
                })
        });

        pending.chain(confirmed).skip(offset).take(limit).collect()
    }

    pub fn get_transaction(&self, hash: &str) -> Option<HistoryEntry> {
        if let Some(tx) = self.mempool.get(hash) {
            return Some(HistoryEntry {
                transaction: tx.clone(),
                block_index: None,
                confirmed: false,
            });
        }
        self.blocks.iter().find_map(|block| {
            block.transactions.iter().find(|tx| tx.hash == hash).map(|tx| HistoryEntry {
                transaction: tx.clone(),
                block_index: Some(block.index),
                confirmed: true,
            })
        })
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.mempool.get_all_transactions()
    }

    pub fn export_chain(&self) -> ChainExport {
        ChainExport {
            blocks: self.blocks.clone(),
            pending_transactions: self.mempool.get_all_transactions(),
            difficulty: self.difficulty,
            exported_at: now_millis(),
        }
    }

    /// Replaces blocks, mempool and difficulty with `export` after checking
    /// it. The observer is not notified; storage catches up on the next
    /// incremental sync.
    pub fn import_chain(&mut self, export: ChainExport) -> Result<(), ChainError> {
        validate_chain(&export.blocks)?;
        if export.difficulty == 0 || export.difficulty > self.config.max_difficulty {
            return Err(ChainError::InvalidBlock(format!(
                "Imported difficulty {} outside 1..={}",
                export.difficulty, self.config.max_difficulty
            )));
        }
        let state = LedgerState::from_blocks(&export.blocks)?;

        let mut mempool = Mempool::new();
        for tx in export.pending_transactions {
            if tx.is_reward() {
                return Err(ChainError::InvalidTransaction(
                    "Imported mempool contains a reward transaction".to_string(),
                ));
            }
            tx.validate()?;
            if state.is_confirmed(&tx.hash) {
                return Err(ChainError::InvalidTransaction(format!(
                    "Imported pending transaction {} is already confirmed",
                    tx.hash
                )));
            }
            mempool.add_transaction(tx)?;
        }

        info!(blocks = export.blocks.len(), pending = mempool.len(), "Chain imported");
        self.blocks = export.blocks;
        self.state = state;
        self.mempool = mempool;
        self.difficulty = export.difficulty;
        Ok(())
    }

    pub fn chain_info(&self) -> ChainInfo {
        ChainInfo {
            height: self.height(),
            total_blocks: self.blocks.len() as u64,
            latest_hash: self.latest_block().map(|b| b.hash.clone()).unwrap_or_default(),
            difficulty: self.difficulty,
            pending_transactions: self.mempool.len(),
            total_transactions: self.state.total_transactions,
            mining_reward: self.config.mining_reward,
            is_valid: self.is_chain_valid(),
        }
    }
}
