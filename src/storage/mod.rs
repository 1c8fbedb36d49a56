//! Local persistence: the namespaced engine and the chain-aware facade over it.

pub mod chain_store;
pub mod engine;

pub use chain_store::{AccountState, ChainState, ChainStore, StoredTransaction, UtxoEntry};
pub use engine::{StorageEngine, StorageStats, StoredRecord, WriteBatch};
