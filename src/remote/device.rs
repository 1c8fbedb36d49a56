use crate::transaction::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const MAX_HEALTH_SCORE: u8 = 100;
pub const HEALTH_SUCCESS_BONUS: u8 = 5;
pub const HEALTH_FAILURE_PENALTY: u8 = 15;

/// Asymmetric update: small reward for a good round trip, larger penalty
/// for a bad one, clamped to `[0, 100]`.
pub fn adjust_health_score(score: u8, success: bool) -> u8 {
    if success {
        score.saturating_add(HEALTH_SUCCESS_BONUS).min(MAX_HEALTH_SCORE)
    } else {
        score.saturating_sub(HEALTH_FAILURE_PENALTY)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Primary,
    Secondary,
    Tertiary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Healthy,
    Unhealthy,
}

/// Body of `POST /api/storage/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub device_id: String,
    pub url: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub tier: Option<Tier>,
}

/// Operational record of a registered device. Never persisted with chain data.
#[derive(Debug, Clone)]
pub struct StorageDevice {
    pub id: String,
    pub url: String,
    pub capabilities: BTreeSet<String>,
    pub metadata: serde_json::Value,
    pub region: String,
    pub tier: Tier,
    pub status: DeviceStatus,
    pub health_score: u8,
    pub response_time_ms: u64,
    pub consecutive_errors: u32,
    pub error_count: u64,
    pub request_count: u64,
    pub registered_at: u64,
    pub last_health_check: Option<u64>,
}

impl StorageDevice {
    pub fn from_registration(registration: DeviceRegistration, default_capabilities: &[&str]) -> Self {
        let mut capabilities: BTreeSet<String> = registration
            .capabilities
            .into_iter()
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        if capabilities.is_empty() {
            capabilities = default_capabilities.iter().map(|c| c.to_string()).collect();
        }

        StorageDevice {
            id: registration.device_id,
            url: registration.url.trim_end_matches('/').to_string(),
            capabilities,
            metadata: registration.metadata,
            region: registration.region.unwrap_or_else(|| "default".to_string()),
            tier: registration.tier.unwrap_or_default(),
            status: DeviceStatus::Healthy,
            health_score: MAX_HEALTH_SCORE,
            response_time_ms: 0,
            consecutive_errors: 0,
            error_count: 0,
            request_count: 0,
            registered_at: now_millis(),
            last_health_check: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == DeviceStatus::Healthy
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn record_success(&mut self, response_time_ms: u64) {
        self.consecutive_errors = 0;
        self.status = DeviceStatus::Healthy;
        self.response_time_ms = response_time_ms;
        self.health_score = adjust_health_score(self.health_score, true);
    }

    /// Returns true when this failure tipped the device into unhealthy.
    pub fn record_failure(&mut self, max_errors: u32) -> bool {
        self.consecutive_errors += 1;
        self.error_count += 1;
        self.health_score = adjust_health_score(self.health_score, false);
        if self.consecutive_errors >= max_errors && self.is_healthy() {
            self.status = DeviceStatus::Unhealthy;
            return true;
        }
        false
    }

    pub fn view(&self) -> DeviceView {
        DeviceView {
            device_id: self.id.clone(),
            capabilities: self.capabilities.iter().cloned().collect(),
            metadata: self.metadata.clone(),
            region: self.region.clone(),
            tier: self.tier,
            status: self.status,
            health_score: self.health_score,
            response_time_ms: self.response_time_ms,
            consecutive_errors: self.consecutive_errors,
            error_count: self.error_count,
            request_count: self.request_count,
            last_health_check: self.last_health_check,
        }
    }
}

/// Client-facing projection of a device. Carries no URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub device_id: String,
    pub capabilities: Vec<String>,
    pub metadata: serde_json::Value,
    pub region: String,
    pub tier: Tier,
    pub status: DeviceStatus,
    pub health_score: u8,
    pub response_time_ms: u64,
    pub consecutive_errors: u32,
    pub error_count: u64,
    pub request_count: u64,
    pub last_health_check: Option<u64>,
}
