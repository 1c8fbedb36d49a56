//! Validator lookup, health ranking and snapshot replication.

pub mod registry;
pub mod replication;
pub mod transport;

pub use crate::remote::Tier as ValidatorTier;
pub use registry::{SelectionCriteria, ValidatorEndpoint, ValidatorRegistry, ValidatorView};
pub use replication::{ChainSnapshot, ReplicationManager, ReplicationReport};
pub use transport::{HttpValidatorTransport, ValidatorTransport};
