//! Remote storage devices: registry, health tracking, load-balanced
//! dispatch and broadcast.

pub mod adapter;
pub mod device;
pub mod transport;

pub use adapter::{
    capability_for_operation, AdapterStats, AutoDispatch, BroadcastFailure, BroadcastResult,
    BroadcastSuccess, HealthCheckOutcome, MonitoringSnapshot, RemoteStorageAdapter,
};
pub use device::{adjust_health_score, DeviceRegistration, DeviceStatus, DeviceView, StorageDevice, Tier};
pub use transport::{DeviceTransport, HttpTransport};

use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How `get_available_device` picks among healthy capable devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
    Random,
}

impl FromStr for LoadBalancingStrategy {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round-robin" => Ok(LoadBalancingStrategy::RoundRobin),
            "least-loaded" => Ok(LoadBalancingStrategy::LeastLoaded),
            "random" => Ok(LoadBalancingStrategy::Random),
            other => Err(ChainError::ConfigError(format!(
                "unknown load balancing strategy: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadBalancingStrategy::RoundRobin => "round-robin",
            LoadBalancingStrategy::LeastLoaded => "least-loaded",
            LoadBalancingStrategy::Random => "random",
        };
        f.write_str(name)
    }
}
