// Thin re-export module: the ledger lives in `blockchain/core.rs`, split into
// chain management, state, validation and the mutation observer.

pub mod core;
pub use core::*;
