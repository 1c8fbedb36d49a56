// core.rs splits ledger responsibilities into submodules.
pub mod chain;
pub mod observer;
pub mod state;
pub mod validation;

pub use chain::*;
pub use observer::*;
pub use state::*;
pub use validation::*;
