//! Block, transaction and account-state storage built on the engine
//!
//! Every stored block is written as one batch: the block, its transactions,
//! the secondary indexes, the UTXO changes, the touched account states and
//! the chain-state summary commit together or not at all.

use crate::blockchain::Block;
use crate::cache::AccountStateCache;
use crate::error::ChainError;
use crate::storage::engine::{StorageEngine, StorageStats, WriteBatch};
use crate::transaction::{now_millis, Transaction};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const BLOCKS: &str = "blocks";
pub const TRANSACTIONS: &str = "transactions";
pub const ACCOUNTS: &str = "accounts";
pub const UTXO: &str = "utxo";
pub const SPENT: &str = "spent";
pub const PENDING: &str = "pending";
pub const META: &str = "meta";

pub const BLOCK_BY_HASH: &str = "block_by_hash";
pub const TX_BY_HASH: &str = "tx_by_hash";
pub const TX_BY_ADDRESS: &str = "tx_by_address";

const CHAIN_STATE_KEY: &str = "chain-state";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountState {
    pub address: String,
    pub balance: u64,
    pub nonce: u64,
    pub last_updated: u64,
}

impl AccountState {
    pub fn empty(address: &str) -> Self {
        AccountState {
            address: address.to_string(),
            balance: 0,
            nonce: 0,
            last_updated: now_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoEntry {
    pub address: String,
    pub amount: u64,
    pub tx_hash: String,
    pub block_index: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainState {
    pub latest_block_index: Option<u64>,
    pub total_blocks: u64,
    pub total_transactions: u64,
    pub chain_hash: String,
    pub last_updated: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTransaction {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub block_index: Option<u64>,
}

pub fn block_key(index: u64) -> String {
    format!("{:020}", index)
}

fn utxo_key(address: &str, tx_hash: &str) -> String {
    format!("{}:{}", address, tx_hash)
}

pub struct ChainStore {
    engine: Arc<StorageEngine>,
    accounts: AccountStateCache,
    write_lock: Mutex<()>,
}

impl ChainStore {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        ChainStore {
            engine,
            accounts: AccountStateCache::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Persists `block` and everything derived from it. Storing the block
    /// already held at that index is a no-op; blocks must arrive in order.
    pub fn store_block(&self, block: &Block) -> Result<(), ChainError> {
        let _guard = self.write_lock.lock();

        if let Some(existing) = self.engine.get::<Block>(BLOCKS, &block_key(block.index))? {
            if existing.hash == block.hash {
                debug!(index = block.index, "Block already stored");
                return Ok(());
            }
            return Err(ChainError::IntegrityError(format!(
                "Block {} already stored with hash {}, refusing {}",
                block.index, existing.hash, block.hash
            )));
        }

        let mut chain_state = self.get_chain_state()?;
        if block.index != chain_state.total_blocks {
            return Err(ChainError::InvalidBlock(format!(
                "Out of order block: storage expects index {}, got {}",
                chain_state.total_blocks, block.index
            )));
        }

        let mut batch = WriteBatch::new();
        batch.put(BLOCKS, &block_key(block.index), block)?;
        batch.add_index(BLOCK_BY_HASH, &block.hash, &block.index.to_string());

        let mut utxos: HashMap<String, BTreeMap<String, UtxoEntry>> = HashMap::new();
        let mut nonces: HashMap<String, u64> = HashMap::new();
        let timestamp = now_millis();

        for tx in &block.transactions {
            batch.put(
                TRANSACTIONS,
                &tx.hash,
                &StoredTransaction {
                    transaction: tx.clone(),
                    block_index: Some(block.index),
                },
            )?;
            batch.add_index(TX_BY_HASH, &tx.hash, &block.index.to_string());
            batch.add_index(TX_BY_ADDRESS, &tx.to, &tx.hash);
            batch.delete(PENDING, &tx.hash);

            if let Some(from) = &tx.from {
                batch.add_index(TX_BY_ADDRESS, from, &tx.hash);
                let nonce = match nonces.get(from) {
                    Some(n) => *n,
                    None => self.stored_nonce(from)?,
                };
                let sender = self.utxo_view(&mut utxos, from)?;
                let consumed: u64 = sender.values().map(|e| e.amount).sum();
                for key in sender.keys() {
                    batch.delete(UTXO, key);
                }
                sender.clear();

                if consumed < tx.amount {
                    warn!(address = %from, consumed, amount = tx.amount, "UTXO set short of transfer amount");
                }
                batch.put(
                    SPENT,
                    &format!("{}:{}", from, nonce),
                    &UtxoEntry {
                        address: from.clone(),
                        amount: consumed,
                        tx_hash: tx.hash.clone(),
                        block_index: block.index,
                        timestamp,
                    },
                )?;
                let change = consumed.saturating_sub(tx.amount);
                if change > 0 {
                    let entry = UtxoEntry {
                        address: from.clone(),
                        amount: change,
                        tx_hash: tx.hash.clone(),
                        block_index: block.index,
                        timestamp,
                    };
                    let key = utxo_key(from, &tx.hash);
                    batch.put(UTXO, &key, &entry)?;
                    sender.insert(key, entry);
                }
                nonces.insert(from.clone(), nonce + 1);
            }

            let entry = UtxoEntry {
                address: tx.to.clone(),
                amount: tx.amount,
                tx_hash: tx.hash.clone(),
                block_index: block.index,
                timestamp,
            };
            let key = utxo_key(&tx.to, &tx.hash);
            batch.put(UTXO, &key, &entry)?;
            self.utxo_view(&mut utxos, &tx.to)?.insert(key, entry);
        }

        let mut touched = Vec::with_capacity(utxos.len());
        for (address, entries) in &utxos {
            let nonce = match nonces.get(address) {
                Some(n) => *n,
                None => self.stored_nonce(address)?,
            };
            let state = AccountState {
                address: address.clone(),
                balance: entries.values().map(|e| e.amount).sum(),
                nonce,
                last_updated: timestamp,
            };
            batch.put(ACCOUNTS, address, &state)?;
            touched.push(state);
        }

        chain_state.latest_block_index = Some(block.index);
        chain_state.total_blocks += 1;
        chain_state.total_transactions += block.transactions.len() as u64;
        chain_state.chain_hash = block.hash.clone();
        chain_state.last_updated = timestamp;
        batch.put(META, CHAIN_STATE_KEY, &chain_state)?;

        self.engine.write_batch(batch)?;

        for state in touched {
            self.accounts.put(state.address.clone(), state);
        }
        debug!(index = block.index, hash = %block.hash, "Block stored");
        Ok(())
    }

    fn utxo_view<'a>(
        &self,
        utxos: &'a mut HashMap<String, BTreeMap<String, UtxoEntry>>,
        address: &str,
    ) -> Result<&'a mut BTreeMap<String, UtxoEntry>, ChainError> {
        if !utxos.contains_key(address) {
            let entries: BTreeMap<String, UtxoEntry> = self
                .engine
                .range::<UtxoEntry>(UTXO, &format!("{}:", address))?
                .into_iter()
                .filter(|(_, entry)| entry.address == address)
                .collect();
            utxos.insert(address.to_string(), entries);
        }
        utxos
            .get_mut(address)
            .ok_or_else(|| ChainError::NotFound(format!("UTXO view for {}", address)))
    }

    fn stored_nonce(&self, address: &str) -> Result<u64, ChainError> {
        Ok(self
            .engine
            .get::<AccountState>(ACCOUNTS, address)?
            .map_or(0, |s| s.nonce))
    }

    /// Stores a transaction record and its indexes without touching the
    /// UTXO set. `None` marks it as pending.
    pub fn store_transaction(&self, tx: &Transaction, block_index: Option<u64>) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        batch.put(
            TRANSACTIONS,
            &tx.hash,
            &StoredTransaction {
                transaction: tx.clone(),
                block_index,
            },
        )?;
        match block_index {
            Some(index) => batch.add_index(TX_BY_HASH, &tx.hash, &index.to_string()),
            None => batch.put(PENDING, &tx.hash, tx)?,
        }
        batch.add_index(TX_BY_ADDRESS, &tx.to, &tx.hash);
        if let Some(from) = &tx.from {
            batch.add_index(TX_BY_ADDRESS, from, &tx.hash);
        }
        self.engine.write_batch(batch)
    }

    /// Removes a transaction that left the mempool without being mined.
    /// Confirmed records are left alone. Returns whether anything was removed.
    pub fn discard_pending_transaction(&self, tx: &Transaction) -> Result<bool, ChainError> {
        let stored: Option<StoredTransaction> = self.engine.get(TRANSACTIONS, &tx.hash)?;
        let in_pending = self.engine.exists(PENDING, &tx.hash)?;
        match &stored {
            Some(record) if record.block_index.is_some() => return Ok(false),
            None if !in_pending => return Ok(false),
            _ => {}
        }

        let mut batch = WriteBatch::new();
        batch.delete(PENDING, &tx.hash);
        batch.delete(TRANSACTIONS, &tx.hash);
        batch.remove_index_entry(TX_BY_ADDRESS, &tx.to, &tx.hash);
        if let Some(from) = &tx.from {
            batch.remove_index_entry(TX_BY_ADDRESS, from, &tx.hash);
        }
        self.engine.write_batch(batch)?;
        debug!(tx_hash = %tx.hash, "Discarded pending transaction");
        Ok(true)
    }

    pub fn get_pending_transactions(&self) -> Result<Vec<Transaction>, ChainError> {
        let mut pending: Vec<Transaction> = self
            .engine
            .range::<Transaction>(PENDING, "")?
            .into_iter()
            .map(|(_, tx)| tx)
            .collect();
        pending.sort_by_key(|tx| tx.timestamp);
        Ok(pending)
    }

    pub fn get_block(&self, index: u64) -> Result<Option<Block>, ChainError> {
        self.engine.get(BLOCKS, &block_key(index))
    }

    pub fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, ChainError> {
        let Some(index) = self.engine.get_index(BLOCK_BY_HASH, hash)?.into_iter().next() else {
            return Ok(None);
        };
        let index: u64 = index
            .parse()
            .map_err(|_| ChainError::IntegrityError(format!("Corrupt block index entry for {}", hash)))?;
        self.get_block(index)
    }

    pub fn get_transaction(&self, hash: &str) -> Result<Option<StoredTransaction>, ChainError> {
        self.engine.get(TRANSACTIONS, hash)
    }

    /// Newest first, paged.
    pub fn get_transactions_by_address(
        &self,
        address: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredTransaction>, ChainError> {
        let hashes = self.engine.get_index(TX_BY_ADDRESS, address)?;
        let mut out = Vec::new();
        for hash in hashes.iter().rev().skip(offset).take(limit) {
            match self.get_transaction(hash)? {
                Some(tx) => out.push(tx),
                None => warn!(tx_hash = %hash, "Index points at a missing transaction"),
            }
        }
        Ok(out)
    }

    /// Cached state, else stored state checked against the UTXO set, else a
    /// full replay over the stored blocks.
    pub fn get_account_state(&self, address: &str) -> Result<AccountState, ChainError> {
        if let Some(state) = self.accounts.get(address) {
            return Ok(state);
        }

        if let Some(state) = self.engine.get::<AccountState>(ACCOUNTS, address)? {
            let utxo_balance = self.get_balance_from_utxo(address)?;
            if state.balance == utxo_balance {
                self.accounts.put(address.to_string(), state.clone());
                return Ok(state);
            }
            warn!(
                address,
                stored = state.balance,
                utxo = utxo_balance,
                "Account state disagrees with UTXO set, recomputing"
            );
        }
        self.calculate_account_state(address)
    }

    /// Replays every stored block for `address` and persists the result.
    pub fn calculate_account_state(&self, address: &str) -> Result<AccountState, ChainError> {
        let mut state = AccountState::empty(address);
        for (_, block) in self.engine.range::<Block>(BLOCKS, "")? {
            for tx in &block.transactions {
                if tx.to == address {
                    state.balance = state.balance.saturating_add(tx.amount);
                }
                if tx.from.as_deref() == Some(address) {
                    state.balance = state.balance.saturating_sub(tx.amount);
                    state.nonce += 1;
                }
            }
        }
        state.last_updated = now_millis();
        self.engine.put(ACCOUNTS, address, &state)?;
        self.accounts.put(address.to_string(), state.clone());
        Ok(state)
    }

    pub fn get_utxos(&self, address: &str) -> Result<Vec<UtxoEntry>, ChainError> {
        Ok(self
            .engine
            .range::<UtxoEntry>(UTXO, &format!("{}:", address))?
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| e.address == address)
            .collect())
    }

    pub fn get_balance_from_utxo(&self, address: &str) -> Result<u64, ChainError> {
        Ok(self.get_utxos(address)?.iter().map(|e| e.amount).sum())
    }

    pub fn get_chain_state(&self) -> Result<ChainState, ChainError> {
        Ok(self.engine.get(META, CHAIN_STATE_KEY)?.unwrap_or_default())
    }

    /// Compacts the engine, re-persists the chain-state summary and drops
    /// the account cache.
    pub fn perform_maintenance(&self) -> Result<(), ChainError> {
        let _guard = self.write_lock.lock();
        self.engine.compact()?;
        let mut chain_state = self.get_chain_state()?;
        chain_state.last_updated = now_millis();
        self.engine.put(META, CHAIN_STATE_KEY, &chain_state)?;
        self.accounts.invalidate_all();
        info!(total_blocks = chain_state.total_blocks, "Storage maintenance complete");
        Ok(())
    }

    /// Removes every chain record and index.
    pub fn clear(&self) -> Result<(), ChainError> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::new();
        for collection in [BLOCKS, TRANSACTIONS, ACCOUNTS, UTXO, SPENT, PENDING, META] {
            batch.clear_collection(collection);
        }
        for index in [BLOCK_BY_HASH, TX_BY_HASH, TX_BY_ADDRESS] {
            batch.clear_index(index);
        }
        self.engine.write_batch(batch)?;
        self.accounts.invalidate_all();
        info!("Chain storage cleared");
        Ok(())
    }

    /// Engine backup plus `chain-state.json` and `utxo-set.json`.
    pub fn backup(&self, dir: impl AsRef<Path>) -> Result<PathBuf, ChainError> {
        let target = self.engine.backup(dir)?;
        fs::write(
            target.join("chain-state.json"),
            serde_json::to_vec_pretty(&self.get_chain_state()?)?,
        )?;
        let utxo_set: BTreeMap<String, UtxoEntry> =
            self.engine.range::<UtxoEntry>(UTXO, "")?.into_iter().collect();
        fs::write(target.join("utxo-set.json"), serde_json::to_vec_pretty(&utxo_set)?)?;
        Ok(target)
    }

    pub fn stats(&self) -> Result<StorageStats, ChainError> {
        self.engine.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Blockchain;
    use crate::config::{GenesisAllocation, LedgerConfig};
    use crate::crypto::{test_address, KeyPair};

    fn store() -> ChainStore {
        ChainStore::new(Arc::new(StorageEngine::open_in_memory(64).unwrap()))
    }

    fn ledger(funded: &KeyPair, amount: u64) -> Blockchain {
        Blockchain::new(LedgerConfig {
            initial_difficulty: 1,
            max_difficulty: 1,
            genesis_allocations: vec![GenesisAllocation {
                address: funded.address(),
                amount,
            }],
            ..LedgerConfig::default()
        })
        .unwrap()
    }

    fn send(chain: &mut Blockchain, from: &KeyPair, to: &str, amount: u64) {
        let tx = Transaction::new(from.address(), to.to_string(), amount)
            .signed(from)
            .unwrap();
        chain.add_transaction(tx).unwrap();
    }

    fn store_all(store: &ChainStore, chain: &Blockchain) {
        for block in &chain.blocks {
            store.store_block(block).unwrap();
        }
    }

    #[test]
    fn test_store_and_lookup_block() {
        let alice = KeyPair::generate().unwrap();
        let mut chain = ledger(&alice, 100);
        send(&mut chain, &alice, &test_address("bob"), 30);
        chain.mine_pending_transactions(&test_address("miner")).unwrap();

        let store = store();
        store_all(&store, &chain);

        let block = &chain.blocks[1];
        assert_eq!(store.get_block(1).unwrap().as_ref(), Some(block));
        assert_eq!(store.get_block_by_hash(&block.hash).unwrap().as_ref(), Some(block));
        let tx = store.get_transaction(&block.transactions[0].hash).unwrap().unwrap();
        assert_eq!(tx.block_index, Some(1));

        let state = store.get_chain_state().unwrap();
        assert_eq!(state.total_blocks, 2);
        assert_eq!(state.latest_block_index, Some(1));
        assert_eq!(state.total_transactions, 3);
        assert_eq!(state.chain_hash, block.hash);
    }

    #[test]
    fn test_utxo_balance_matches_replay() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();
        let mut chain = ledger(&alice, 100);
        send(&mut chain, &alice, &bob.address(), 30);
        send(&mut chain, &alice, &test_address("carol"), 5);
        chain.mine_pending_transactions(&test_address("miner")).unwrap();
        send(&mut chain, &bob, &alice.address(), 10);
        chain.mine_pending_transactions(&test_address("miner")).unwrap();

        let store = store();
        store_all(&store, &chain);

        for address in [alice.address(), bob.address(), test_address("carol"), test_address("miner")] {
            assert_eq!(
                store.get_balance_from_utxo(&address).unwrap(),
                chain.get_balance(&address),
                "balance mismatch for {}",
                address
            );
            assert_eq!(
                store.get_account_state(&address).unwrap().balance,
                chain.get_balance(&address)
            );
        }
        assert_eq!(store.get_account_state(&alice.address()).unwrap().nonce, 2);
        assert!(store.engine().exists(SPENT, &format!("{}:0", alice.address())).unwrap());
        assert!(store.engine().exists(SPENT, &format!("{}:1", alice.address())).unwrap());
    }

    #[test]
    fn test_store_block_is_idempotent_and_ordered() {
        let alice = KeyPair::generate().unwrap();
        let mut chain = ledger(&alice, 10);
        chain.mine_pending_transactions(&test_address("miner")).unwrap();
        chain.mine_pending_transactions(&test_address("miner")).unwrap();

        let store = store();
        store.store_block(&chain.blocks[0]).unwrap();
        store.store_block(&chain.blocks[0]).unwrap();
        assert_eq!(store.get_chain_state().unwrap().total_blocks, 1);

        let err = store.store_block(&chain.blocks[2]).unwrap_err();
        assert!(matches!(err, ChainError::InvalidBlock(_)));

        let mut forged = chain.blocks[0].clone();
        forged.hash = "ff".repeat(32);
        assert!(matches!(
            store.store_block(&forged),
            Err(ChainError::IntegrityError(_))
        ));
    }

    #[test]
    fn test_transactions_by_address_paging() {
        let alice = KeyPair::generate().unwrap();
        let mut chain = ledger(&alice, 100);
        for amount in 1..=3 {
            send(&mut chain, &alice, &test_address("bob"), amount);
            chain.mine_pending_transactions(&test_address("miner")).unwrap();
        }
        let store = store();
        store_all(&store, &chain);

        let all = store.get_transactions_by_address(&test_address("bob"), 10, 0).unwrap();
        assert_eq!(all.iter().map(|t| t.transaction.amount).collect::<Vec<_>>(), vec![3, 2, 1]);
        let page = store.get_transactions_by_address(&test_address("bob"), 1, 1).unwrap();
        assert_eq!(page[0].transaction.amount, 2);
    }

    #[test]
    fn test_account_state_recomputed_on_mismatch() {
        let alice = KeyPair::generate().unwrap();
        let chain = ledger(&alice, 100);
        let store = store();
        store_all(&store, &chain);

        let mut bogus = store.get_account_state(&alice.address()).unwrap();
        bogus.balance = 1;
        store.engine().put(ACCOUNTS, &alice.address(), &bogus).unwrap();
        store.perform_maintenance().unwrap();

        let state = store.get_account_state(&alice.address()).unwrap();
        assert_eq!(state.balance, 100);
        assert_eq!(store.calculate_account_state("nobody").unwrap().balance, 0);
    }

    #[test]
    fn test_pending_transactions_cleared_when_mined() {
        let alice = KeyPair::generate().unwrap();
        let mut chain = ledger(&alice, 100);
        let store = store();
        store_all(&store, &chain);

        send(&mut chain, &alice, &test_address("bob"), 4);
        let pending = chain.pending_transactions();
        store.store_transaction(&pending[0], None).unwrap();
        assert_eq!(store.get_pending_transactions().unwrap(), pending);

        chain.mine_pending_transactions(&test_address("miner")).unwrap();
        store.store_block(&chain.blocks[1]).unwrap();
        assert!(store.get_pending_transactions().unwrap().is_empty());
        assert_eq!(
            store.get_transaction(&pending[0].hash).unwrap().unwrap().block_index,
            Some(1)
        );
    }

    #[test]
    fn test_discard_pending_transaction() {
        let alice = KeyPair::generate().unwrap();
        let mut chain = ledger(&alice, 100);
        let store = store();
        store_all(&store, &chain);

        send(&mut chain, &alice, &test_address("bob"), 4);
        let tx = chain.pending_transactions()[0].clone();
        store.store_transaction(&tx, None).unwrap();

        assert!(store.discard_pending_transaction(&tx).unwrap());
        assert!(store.get_pending_transactions().unwrap().is_empty());
        assert!(store.get_transaction(&tx.hash).unwrap().is_none());
        assert!(store
            .get_transactions_by_address(&test_address("bob"), 10, 0)
            .unwrap()
            .is_empty());
        assert!(!store
            .engine()
            .get_index(TX_BY_ADDRESS, &alice.address())
            .unwrap()
            .contains(&tx.hash));
        assert!(!store.discard_pending_transaction(&tx).unwrap());

        // Confirmed records stay.
        store.store_transaction(&tx, Some(1)).unwrap();
        assert!(!store.discard_pending_transaction(&tx).unwrap());
        assert_eq!(store.get_transaction(&tx.hash).unwrap().unwrap().block_index, Some(1));
    }

    #[test]
    fn test_clear_and_backup() {
        let alice = KeyPair::generate().unwrap();
        let chain = ledger(&alice, 100);
        let store = store();
        store_all(&store, &chain);

        let dir = tempfile::tempdir().unwrap();
        let target = store.backup(dir.path()).unwrap();
        assert!(target.join("chain-state.json").exists());
        let utxo: BTreeMap<String, UtxoEntry> =
            serde_json::from_slice(&fs::read(target.join("utxo-set.json")).unwrap()).unwrap();
        assert_eq!(utxo.len(), 1);

        store.clear().unwrap();
        assert_eq!(store.get_chain_state().unwrap(), ChainState::default());
        assert!(store.get_block(0).unwrap().is_none());
        assert!(store.get_block_by_hash(&chain.blocks[0].hash).unwrap().is_none());
    }

    #[test]
    fn test_utxo_lookup_matches_address_exactly() {
        let alice = KeyPair::generate().unwrap();
        let miner = test_address("miner");
        let mut chain = ledger(&alice, 100);
        chain.mine_pending_transactions(&miner).unwrap();
        let store = store();
        store_all(&store, &chain);

        // An entry whose key shares the `miner:` prefix but belongs elsewhere.
        let foreign = format!("{}:x", miner);
        store
            .engine()
            .put(
                UTXO,
                &format!("{}:{}", foreign, "ab".repeat(32)),
                &UtxoEntry {
                    address: foreign.clone(),
                    amount: 50,
                    tx_hash: "ab".repeat(32),
                    block_index: 1,
                    timestamp: 0,
                },
            )
            .unwrap();

        assert_eq!(store.get_balance_from_utxo(&miner).unwrap(), chain.get_balance(&miner));
        assert!(store.get_utxos(&miner).unwrap().iter().all(|e| e.address == miner));
        assert!(chain.prepare_block(&foreign).is_err());
    }
}
