//! TopayChain - A toy proof-of-work ledger with replicated storage
//!
//! # Architecture
//!
//! ## Core Ledger
//! - [`blockchain`] - Chain management, UTXO state and block validation
//! - [`transaction`] - Transaction types, hashing and signatures
//! - [`mempool`] - Pending transaction pool
//! - [`miner`] - Proof-of-work mining
//!
//! ## Storage
//! - [`storage`] - SQLite-backed key-value engine and the chain store facade
//! - [`cache`] - LRU caches used by the engine and the remote adapter
//! - [`sync`] - Incremental sync, full resync, restore and integrity checks
//!
//! ## Remote Layers
//! - [`remote`] - Registered storage devices with load balancing and health checks
//! - [`validators`] - Validator registry and snapshot replication
//!
//! ## Node
//! - [`node`] - Boot sequence and background task ownership
//! - [`api`] - HTTP API and the `topay_*` RPC namespace
//!
//! ## Configuration & Utilities
//! - [`config`] - TOML configuration with environment overrides
//! - [`error`] - Error types and classes
//! - [`scheduler`] - Cancellable periodic tasks

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod mempool;
pub mod miner;
pub mod transaction;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// Storage
// ============================================================================
pub mod cache;
pub mod storage;
pub mod sync;

// ============================================================================
// Remote Layers
// ============================================================================
pub mod remote;
pub mod validators;

// ============================================================================
// Node & Integration
// ============================================================================
#[cfg(feature = "api")]
pub mod api;
#[cfg(feature = "api")]
pub mod node;
#[cfg(feature = "api")]
pub mod rpc;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
pub mod scheduler;

pub use blockchain::{Block, Blockchain};
pub use config::Config;
pub use error::{ChainError, ErrorClass};
pub use transaction::Transaction;
