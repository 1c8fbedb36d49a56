//! Load-balanced dispatch to remote storage devices
//!
//! Devices are selected per capability, every outcome feeds the device's
//! health counters, and reads of the same payload are served from a bounded
//! response cache until the next write.

use super::device::{DeviceRegistration, DeviceStatus, DeviceView, StorageDevice};
use super::transport::DeviceTransport;
use super::LoadBalancingStrategy;
use crate::cache::ResponseCache;
use crate::config::RemoteStorageConfig;
use crate::crypto::compute_hash;
use crate::error::ChainError;
use crate::scheduler::{ScheduledTask, TaskControl};
use crate::transaction::now_millis;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_CAPABILITIES: [&str; 3] = ["blocks", "transactions", "state"];

/// Maps an operation name such as `store-block` or `get-transaction` onto the
/// capability a device must declare to serve it.
pub fn capability_for_operation(operation: &str) -> &'static str {
    let op = operation.to_ascii_lowercase();
    if op.contains("block") {
        "blocks"
    } else if op.contains("transaction") || op.contains("tx") {
        "transactions"
    } else {
        "state"
    }
}

fn is_read_operation(operation: &str) -> bool {
    let op = operation.to_ascii_lowercase();
    ["get", "read", "fetch", "list", "query"]
        .iter()
        .any(|prefix| op.starts_with(prefix))
}

fn cache_key(operation: &str, payload: &Value) -> String {
    format!("{}:{}", operation, compute_hash(payload.to_string().as_bytes()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cache_hits: u64,
    pub broadcasts: u64,
    pub health_checks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSnapshot {
    pub total_devices: usize,
    pub healthy_devices: usize,
    pub unhealthy_devices: usize,
    pub load_balancing: LoadBalancingStrategy,
    pub cached_responses: usize,
    pub devices: Vec<DeviceView>,
    pub stats: AdapterStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckOutcome {
    pub device_id: String,
    pub healthy: bool,
    pub status: DeviceStatus,
    pub health_score: u8,
    pub consecutive_errors: u32,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSuccess {
    pub device_id: String,
    pub response: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastFailure {
    pub device_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResult {
    pub operation: String,
    pub capability: String,
    pub total: usize,
    pub successes: Vec<BroadcastSuccess>,
    pub failures: Vec<BroadcastFailure>,
}

impl BroadcastResult {
    pub fn is_success(&self) -> bool {
        !self.successes.is_empty()
    }
}

/// How an auto-dispatched operation was finally served.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AutoDispatch {
    #[serde(rename_all = "camelCase")]
    Single { device_id: String, response: Value },
    Broadcast(BroadcastResult),
}

pub struct RemoteStorageAdapter {
    devices: RwLock<BTreeMap<String, StorageDevice>>,
    cursor: AtomicUsize,
    config: RemoteStorageConfig,
    transport: Arc<dyn DeviceTransport>,
    responses: ResponseCache,
    stats: Mutex<AdapterStats>,
}

impl RemoteStorageAdapter {
    pub fn new(config: RemoteStorageConfig, transport: Arc<dyn DeviceTransport>) -> Self {
        let responses = ResponseCache::new(config.response_cache_capacity);
        RemoteStorageAdapter {
            devices: RwLock::new(BTreeMap::new()),
            cursor: AtomicUsize::new(0),
            config,
            transport,
            responses,
            stats: Mutex::new(AdapterStats::default()),
        }
    }

    pub fn config(&self) -> &RemoteStorageConfig {
        &self.config
    }

    /// Registers or replaces a device. New devices start healthy.
    pub fn register_device(&self, registration: DeviceRegistration) -> Result<DeviceView, ChainError> {
        if registration.device_id.trim().is_empty() {
            return Err(ChainError::InvalidRequest("deviceId is required".to_string()));
        }
        let url = registration.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ChainError::InvalidRequest(format!(
                "device url must be http(s): {}",
                registration.device_id
            )));
        }

        let device = StorageDevice::from_registration(registration, &DEFAULT_CAPABILITIES);
        let view = device.view();
        let replaced = self.devices.write().insert(device.id.clone(), device).is_some();
        info!(
            device = %view.device_id,
            capabilities = ?view.capabilities,
            replaced,
            "Storage device registered"
        );
        Ok(view)
    }

    pub fn unregister_device(&self, device_id: &str) -> Result<(), ChainError> {
        match self.devices.write().remove(device_id) {
            Some(_) => {
                info!(device = %device_id, "Storage device unregistered");
                Ok(())
            }
            None => Err(ChainError::NotFound(format!("device {}", device_id))),
        }
    }

    pub fn list_devices(&self) -> Vec<DeviceView> {
        self.devices.read().values().map(StorageDevice::view).collect()
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceView> {
        self.devices.read().get(device_id).map(StorageDevice::view)
    }

    /// Picks a healthy device declaring `capability` using the configured strategy.
    pub fn get_available_device(&self, capability: &str) -> Result<DeviceView, ChainError> {
        let devices = self.devices.read();
        let candidates: Vec<&StorageDevice> = devices
            .values()
            .filter(|d| d.is_healthy() && d.supports(capability))
            .collect();

        if candidates.is_empty() {
            return Err(ChainError::CapacityError(format!(
                "no healthy device with capability '{}'",
                capability
            )));
        }

        let chosen = match self.config.load_balancing {
            LoadBalancingStrategy::RoundRobin => {
                let slot = self.cursor.fetch_add(1, Ordering::Relaxed);
                candidates[slot % candidates.len()]
            }
            LoadBalancingStrategy::LeastLoaded => candidates
                .iter()
                .copied()
                .min_by_key(|d| d.request_count)
                .unwrap_or(candidates[0]),
            LoadBalancingStrategy::Random => {
                candidates[rand::thread_rng().gen_range(0..candidates.len())]
            }
        };
        Ok(chosen.view())
    }

    /// Sends one operation to one device, retrying up to
    /// `max_callback_retries` attempts. Reads are answered from the response
    /// cache when possible; successful writes invalidate it.
    pub async fn request_storage_operation(
        &self,
        device_id: &str,
        operation: &str,
        payload: &Value,
    ) -> Result<Value, ChainError> {
        let read = is_read_operation(operation);
        let key = cache_key(operation, payload);
        if read {
            if let Some(hit) = self.responses.get(&key) {
                self.stats.lock().cache_hits += 1;
                debug!(operation, "Remote read served from cache");
                return Ok(hit);
            }
        }

        let response = self.dispatch(device_id, operation, payload).await?;
        if read {
            self.responses.put(key, response.clone());
        } else {
            self.responses.clear();
        }
        Ok(response)
    }

    /// Fans `operation` out to every healthy device with the capability and
    /// waits for all of them to settle.
    pub async fn broadcast_storage_operation(
        &self,
        operation: &str,
        payload: &Value,
        capability: Option<&str>,
    ) -> Result<BroadcastResult, ChainError> {
        let capability = capability.unwrap_or_else(|| capability_for_operation(operation));
        let targets: Vec<String> = self
            .devices
            .read()
            .values()
            .filter(|d| d.is_healthy() && d.supports(capability))
            .map(|d| d.id.clone())
            .collect();

        if targets.is_empty() {
            return Err(ChainError::CapacityError(format!(
                "no healthy device with capability '{}' to broadcast {}",
                capability, operation
            )));
        }
        self.stats.lock().broadcasts += 1;

        let outcomes = join_all(
            targets
                .iter()
                .map(|id| async move { (id.clone(), self.dispatch(id, operation, payload).await) }),
        )
        .await;

        let mut result = BroadcastResult {
            operation: operation.to_string(),
            capability: capability.to_string(),
            total: targets.len(),
            successes: Vec::new(),
            failures: Vec::new(),
        };
        for (device_id, outcome) in outcomes {
            match outcome {
                Ok(response) => result.successes.push(BroadcastSuccess { device_id, response }),
                Err(e) => result.failures.push(BroadcastFailure {
                    device_id,
                    error: e.to_string(),
                }),
            }
        }

        if result.is_success() {
            if is_read_operation(operation) {
                self.responses
                    .put(cache_key(operation, payload), result.successes[0].response.clone());
            } else {
                self.responses.clear();
            }
        }

        info!(
            operation,
            capability,
            succeeded = result.successes.len(),
            failed = result.failures.len(),
            "Broadcast finished"
        );
        Ok(result)
    }

    /// Single-device dispatch first, broadcast when that fails. Errors only
    /// when no device could serve the operation at all.
    pub async fn request_storage_operation_auto(
        &self,
        operation: &str,
        payload: &Value,
    ) -> Result<AutoDispatch, ChainError> {
        let capability = capability_for_operation(operation);
        let device = self.get_available_device(capability)?;

        match self
            .request_storage_operation(&device.device_id, operation, payload)
            .await
        {
            Ok(response) => Ok(AutoDispatch::Single {
                device_id: device.device_id,
                response,
            }),
            Err(e) => {
                warn!(
                    operation,
                    device = %device.device_id,
                    error = %e,
                    "Single-device dispatch failed, falling back to broadcast"
                );
                let result = self
                    .broadcast_storage_operation(operation, payload, Some(capability))
                    .await?;
                if result.is_success() {
                    Ok(AutoDispatch::Broadcast(result))
                } else {
                    Err(ChainError::NetworkError(format!(
                        "{} failed on all {} devices",
                        operation, result.total
                    )))
                }
            }
        }
    }

    async fn dispatch(&self, device_id: &str, operation: &str, payload: &Value) -> Result<Value, ChainError> {
        let attempts = self.config.max_callback_retries.max(1);
        let timeout = self.config.callback_timeout();
        let mut last_error = ChainError::NotFound(format!("device {}", device_id));

        for attempt in 1..=attempts {
            let url = {
                let mut devices = self.devices.write();
                let device = devices
                    .get_mut(device_id)
                    .ok_or_else(|| ChainError::NotFound(format!("device {}", device_id)))?;
                if !device.is_healthy() {
                    return Err(ChainError::CapacityError(format!("device {} is unhealthy", device_id)));
                }
                device.request_count += 1;
                device.url.clone()
            };
            self.stats.lock().total_requests += 1;

            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, self.transport.call(&url, operation, payload, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(ChainError::Timeout(format!(
                    "{} on {} after {}ms",
                    operation,
                    device_id,
                    timeout.as_millis()
                ))),
            };
            let elapsed = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(response) => {
                    if let Some(device) = self.devices.write().get_mut(device_id) {
                        device.record_success(elapsed);
                    }
                    self.stats.lock().successful_requests += 1;
                    debug!(device = %device_id, operation, attempt, elapsed_ms = elapsed, "Storage operation succeeded");
                    return Ok(response);
                }
                Err(e) => {
                    self.stats.lock().failed_requests += 1;
                    let still_healthy = self.note_failure(device_id);
                    warn!(device = %device_id, operation, attempt, error = %e, "Storage operation failed");
                    let retry = still_healthy && e.is_retryable() && attempt < attempts;
                    last_error = e;
                    if !retry {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(
                        self.config.callback_retry_delay_ms * attempt as u64,
                    ))
                    .await;
                }
            }
        }

        Err(last_error)
    }

    /// Returns whether the device is still healthy after the failure.
    fn note_failure(&self, device_id: &str) -> bool {
        let mut devices = self.devices.write();
        let Some(device) = devices.get_mut(device_id) else {
            return false;
        };
        if device.record_failure(self.config.max_device_errors) {
            warn!(
                device = %device_id,
                consecutive_errors = device.consecutive_errors,
                "Storage device marked unhealthy"
            );
        }
        device.is_healthy()
    }

    /// Probes one device's `/health` endpoint and folds the result into its
    /// counters. Unhealthy devices are probed too so they can recover.
    pub async fn health_check_device(&self, device_id: &str) -> Result<HealthCheckOutcome, ChainError> {
        let url = self
            .devices
            .read()
            .get(device_id)
            .map(|d| d.url.clone())
            .ok_or_else(|| ChainError::NotFound(format!("device {}", device_id)))?;
        let timeout = self.config.callback_timeout();

        let started = Instant::now();
        let probe = match tokio::time::timeout(timeout, self.transport.health(&url, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Timeout(format!("health check of {}", device_id))),
        };
        let elapsed = started.elapsed().as_millis() as u64;
        self.stats.lock().health_checks += 1;

        let mut devices = self.devices.write();
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| ChainError::NotFound(format!("device {}", device_id)))?;
        device.last_health_check = Some(now_millis());

        let error = match probe {
            Ok(()) => {
                if !device.is_healthy() {
                    info!(device = %device_id, "Storage device recovered");
                }
                device.record_success(elapsed);
                None
            }
            Err(e) => {
                if device.record_failure(self.config.max_device_errors) {
                    warn!(device = %device_id, error = %e, "Storage device marked unhealthy after health checks");
                }
                Some(e.to_string())
            }
        };

        Ok(HealthCheckOutcome {
            device_id: device.id.clone(),
            healthy: device.is_healthy(),
            status: device.status,
            health_score: device.health_score,
            consecutive_errors: device.consecutive_errors,
            response_time_ms: device.response_time_ms,
            error,
        })
    }

    pub async fn health_check_all(&self) -> Vec<HealthCheckOutcome> {
        let ids: Vec<String> = self.devices.read().keys().cloned().collect();
        let outcomes = join_all(ids.iter().map(|id| self.health_check_device(id))).await;
        // A device unregistered mid-sweep reports NotFound; skip it.
        outcomes.into_iter().filter_map(|o| o.ok()).collect()
    }

    pub fn start_health_checks(self: &Arc<Self>) -> ScheduledTask {
        let adapter = Arc::clone(self);
        ScheduledTask::spawn_periodic("device-health-checks", self.config.health_check_interval(), move || {
            let adapter = Arc::clone(&adapter);
            async move {
                let outcomes = adapter.health_check_all().await;
                let healthy = outcomes.iter().filter(|o| o.healthy).count();
                debug!(checked = outcomes.len(), healthy, "Health check sweep finished");
                TaskControl::Continue
            }
        })
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats.lock().clone()
    }

    pub fn monitoring(&self) -> MonitoringSnapshot {
        let devices = self.list_devices();
        let healthy_devices = devices
            .iter()
            .filter(|d| d.status == DeviceStatus::Healthy)
            .count();
        MonitoringSnapshot {
            total_devices: devices.len(),
            healthy_devices,
            unhealthy_devices: devices.len() - healthy_devices,
            load_balancing: self.config.load_balancing,
            cached_responses: self.responses.len(),
            devices,
            stats: self.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};

    /// In-process device double. URLs in `down` fail every call.
    #[derive(Default)]
    struct MockTransport {
        down: RwLock<HashSet<String>>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl MockTransport {
        fn set_down(&self, url: &str, down: bool) {
            if down {
                self.down.write().insert(url.to_string());
            } else {
                self.down.write().remove(url);
            }
        }

        fn calls_to(&self, url: &str) -> usize {
            self.calls.lock().get(url).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl DeviceTransport for MockTransport {
        async fn health(&self, url: &str, _timeout: Duration) -> Result<(), ChainError> {
            if self.down.read().contains(url) {
                Err(ChainError::NetworkError("connection refused".into()))
            } else {
                Ok(())
            }
        }

        async fn call(&self, url: &str, operation: &str, payload: &Value, _timeout: Duration) -> Result<Value, ChainError> {
            *self.calls.lock().entry(url.to_string()).or_default() += 1;
            if self.down.read().contains(url) {
                return Err(ChainError::NetworkError("connection refused".into()));
            }
            Ok(serde_json::json!({ "url": url, "operation": operation, "echo": payload }))
        }
    }

    fn config(strategy: LoadBalancingStrategy) -> RemoteStorageConfig {
        RemoteStorageConfig {
            load_balancing: strategy,
            max_device_errors: 3,
            max_callback_retries: 2,
            callback_retry_delay_ms: 1,
            callback_timeout_ms: 500,
            ..RemoteStorageConfig::default()
        }
    }

    fn registration(id: &str, capabilities: &[&str]) -> DeviceRegistration {
        DeviceRegistration {
            device_id: id.to_string(),
            url: format!("http://{}.local", id),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            metadata: Value::Null,
            region: None,
            tier: None,
        }
    }

    fn adapter(strategy: LoadBalancingStrategy) -> (RemoteStorageAdapter, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::default());
        (RemoteStorageAdapter::new(config(strategy), transport.clone()), transport)
    }

    #[test]
    fn test_capability_for_operation() {
        assert_eq!(capability_for_operation("store-block"), "blocks");
        assert_eq!(capability_for_operation("get-transaction"), "transactions");
        assert_eq!(capability_for_operation("store-state"), "state");
    }

    #[test]
    fn test_round_robin_is_even() {
        let (adapter, _) = adapter(LoadBalancingStrategy::RoundRobin);
        for id in ["a", "b", "c"] {
            adapter.register_device(registration(id, &["blocks"])).unwrap();
        }

        let mut picks: HashMap<String, usize> = HashMap::new();
        for _ in 0..12 {
            let device = adapter.get_available_device("blocks").unwrap();
            *picks.entry(device.device_id).or_default() += 1;
        }
        assert_eq!(picks.len(), 3);
        assert!(picks.values().all(|&n| n == 4), "uneven picks: {:?}", picks);
    }

    #[test]
    fn test_register_then_unregister_leaves_no_capacity() {
        let (adapter, _) = adapter(LoadBalancingStrategy::RoundRobin);
        adapter.register_device(registration("only", &["blocks"])).unwrap();
        assert_eq!(adapter.get_available_device("blocks").unwrap().device_id, "only");

        adapter.unregister_device("only").unwrap();
        let err = adapter.get_available_device("blocks").unwrap_err();
        assert!(matches!(err, ChainError::CapacityError(_)));
        assert!(matches!(adapter.unregister_device("only"), Err(ChainError::NotFound(_))));
    }

    #[test]
    fn test_capability_filter_and_bad_registration() {
        let (adapter, _) = adapter(LoadBalancingStrategy::RoundRobin);
        adapter.register_device(registration("blocks-only", &["blocks"])).unwrap();
        assert!(adapter.get_available_device("state").is_err());

        let mut bad = registration("x", &[]);
        bad.url = "ftp://x".into();
        let err = adapter.register_device(bad).unwrap_err();
        assert!(matches!(err, ChainError::InvalidRequest(_)));
        assert!(err.to_string().starts_with("Invalid request"));

        let blank = registration("  ", &["blocks"]);
        assert!(matches!(adapter.register_device(blank), Err(ChainError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_least_loaded_prefers_idle_device() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (adapter, _) = adapter(LoadBalancingStrategy::LeastLoaded);
            adapter.register_device(registration("a", &["blocks"])).unwrap();
            adapter.register_device(registration("b", &["blocks"])).unwrap();

            adapter
                .request_storage_operation("a", "store-block", &serde_json::json!({"index": 1}))
                .await
                .unwrap();
            assert_eq!(adapter.get_available_device("blocks").unwrap().device_id, "b");
        })
        .await
        .expect("test_least_loaded_prefers_idle_device timed out");
    }

    #[tokio::test]
    async fn test_health_checks_mark_unhealthy_then_recover() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (adapter, transport) = adapter(LoadBalancingStrategy::RoundRobin);
            adapter.register_device(registration("dev", &["blocks"])).unwrap();
            transport.set_down("http://dev.local", true);

            for round in 1..=3 {
                let outcome = adapter.health_check_device("dev").await.unwrap();
                assert_eq!(outcome.consecutive_errors, round);
                assert_eq!(outcome.healthy, round < 3);
            }
            assert!(adapter.get_available_device("blocks").is_err());

            transport.set_down("http://dev.local", false);
            let outcome = adapter.health_check_device("dev").await.unwrap();
            assert!(outcome.healthy);
            assert_eq!(outcome.consecutive_errors, 0);
            assert_eq!(adapter.get_available_device("blocks").unwrap().device_id, "dev");
        })
        .await
        .expect("test_health_checks_mark_unhealthy_then_recover timed out");
    }

    #[tokio::test]
    async fn test_request_retries_then_fails() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (adapter, transport) = adapter(LoadBalancingStrategy::RoundRobin);
            adapter.register_device(registration("dev", &["blocks"])).unwrap();
            transport.set_down("http://dev.local", true);

            let err = adapter
                .request_storage_operation("dev", "store-block", &serde_json::json!({}))
                .await
                .unwrap_err();
            assert!(matches!(err, ChainError::NetworkError(_)));
            assert_eq!(transport.calls_to("http://dev.local"), 2);

            let device = adapter.device("dev").unwrap();
            assert_eq!(device.consecutive_errors, 2);
            assert_eq!(device.request_count, 2);
            assert_eq!(adapter.stats().failed_requests, 2);
        })
        .await
        .expect("test_request_retries_then_fails timed out");
    }

    #[tokio::test]
    async fn test_reads_are_cached_until_a_write() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (adapter, transport) = adapter(LoadBalancingStrategy::RoundRobin);
            adapter.register_device(registration("dev", &["blocks"])).unwrap();
            let query = serde_json::json!({ "hash": "abc" });

            adapter.request_storage_operation("dev", "get-block", &query).await.unwrap();
            adapter.request_storage_operation("dev", "get-block", &query).await.unwrap();
            assert_eq!(transport.calls_to("http://dev.local"), 1);
            assert_eq!(adapter.stats().cache_hits, 1);

            adapter
                .request_storage_operation("dev", "store-block", &serde_json::json!({ "index": 2 }))
                .await
                .unwrap();
            adapter.request_storage_operation("dev", "get-block", &query).await.unwrap();
            assert_eq!(transport.calls_to("http://dev.local"), 3);
        })
        .await
        .expect("test_reads_are_cached_until_a_write timed out");
    }

    #[tokio::test]
    async fn test_broadcast_aggregates_partial_failure() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (adapter, transport) = adapter(LoadBalancingStrategy::RoundRobin);
            for id in ["a", "b", "c"] {
                adapter.register_device(registration(id, &["blocks"])).unwrap();
            }
            transport.set_down("http://b.local", true);

            let result = adapter
                .broadcast_storage_operation("store-block", &serde_json::json!({"index": 1}), None)
                .await
                .unwrap();
            assert_eq!(result.total, 3);
            assert_eq!(result.successes.len(), 2);
            assert_eq!(result.failures.len(), 1);
            assert_eq!(result.failures[0].device_id, "b");
            assert_eq!(adapter.stats().broadcasts, 1);
        })
        .await
        .expect("test_broadcast_aggregates_partial_failure timed out");
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_broadcast() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (adapter, transport) = adapter(LoadBalancingStrategy::RoundRobin);
            adapter.register_device(registration("a", &["blocks"])).unwrap();
            adapter.register_device(registration("b", &["blocks"])).unwrap();
            transport.set_down("http://a.local", true);

            // Round robin starts at "a", which is down.
            let dispatch = adapter
                .request_storage_operation_auto("store-block", &serde_json::json!({"index": 1}))
                .await
                .unwrap();
            match dispatch {
                AutoDispatch::Broadcast(result) => {
                    assert_eq!(result.successes.len(), 1);
                    assert_eq!(result.successes[0].device_id, "b");
                }
                other => panic!("expected broadcast fallback, got {:?}", other),
            }

            let dispatch = adapter
                .request_storage_operation_auto("store-block", &serde_json::json!({"index": 2}))
                .await
                .unwrap();
            assert!(matches!(dispatch, AutoDispatch::Single { .. }));
        })
        .await
        .expect("test_auto_falls_back_to_broadcast timed out");
    }

    #[test]
    fn test_monitoring_snapshot_hides_urls() {
        let (adapter, _) = adapter(LoadBalancingStrategy::Random);
        adapter.register_device(registration("a", &[])).unwrap();
        let snapshot = adapter.monitoring();
        assert_eq!(snapshot.total_devices, 1);
        assert_eq!(snapshot.healthy_devices, 1);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("a.local"));
        assert_eq!(snapshot.devices[0].capabilities.len(), 3);
    }
}
