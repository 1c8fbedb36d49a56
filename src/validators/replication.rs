//! Snapshot replication across the healthiest validators
//!
//! Writes go to the top `replication_factor` active validators; a target
//! that fails is replaced by the next one in health order. Reads walk the
//! active set in descending health and accept the first snapshot whose
//! checksum verifies.

use super::registry::{SelectionCriteria, ValidatorEndpoint, ValidatorRegistry};
use crate::blockchain::Block;
use crate::crypto::compute_hash;
use crate::error::ChainError;
use crate::storage::{ChainState, ChainStore};
use crate::transaction::now_millis;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Chain-state summary plus the most recent blocks, sealed by a checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSnapshot {
    pub chain_state: ChainState,
    pub blocks: Vec<Block>,
    pub created_at: u64,
    pub checksum: String,
}

impl ChainSnapshot {
    pub fn new(chain_state: ChainState, blocks: Vec<Block>) -> Result<Self, ChainError> {
        let mut snapshot = ChainSnapshot {
            chain_state,
            blocks,
            created_at: now_millis(),
            checksum: String::new(),
        };
        snapshot.checksum = snapshot.compute_checksum()?;
        Ok(snapshot)
    }

    fn compute_checksum(&self) -> Result<String, ChainError> {
        let state = serde_json::to_vec(&self.chain_state)?;
        let blocks = serde_json::to_vec(&self.blocks)?;
        let mut payload = Vec::with_capacity(state.len() + blocks.len() + 20);
        payload.extend_from_slice(&state);
        payload.extend_from_slice(&blocks);
        payload.extend_from_slice(self.created_at.to_string().as_bytes());
        Ok(compute_hash(&payload))
    }

    pub fn verify(&self) -> Result<(), ChainError> {
        let expected = self.compute_checksum()?;
        if expected != self.checksum {
            return Err(ChainError::IntegrityError(format!(
                "snapshot checksum mismatch: expected {}, got {}",
                expected, self.checksum
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationReport {
    pub confirmations: usize,
    pub accepted: Vec<String>,
    pub rejected: Vec<(String, String)>,
}

pub struct ReplicationManager {
    registry: Arc<ValidatorRegistry>,
    store: Arc<ChainStore>,
}

impl ReplicationManager {
    pub fn new(registry: Arc<ValidatorRegistry>, store: Arc<ChainStore>) -> Self {
        ReplicationManager { registry, store }
    }

    pub fn registry(&self) -> &Arc<ValidatorRegistry> {
        &self.registry
    }

    /// Builds a snapshot from persisted storage holding up to `recent` blocks.
    pub fn snapshot_from_store(&self, recent: usize) -> Result<ChainSnapshot, ChainError> {
        let state = self.store.get_chain_state()?;
        let mut blocks = Vec::new();
        if let Some(latest) = state.latest_block_index {
            let first = latest.saturating_sub(recent.saturating_sub(1) as u64);
            for index in first..=latest {
                let block = self
                    .store
                    .get_block(index)?
                    .ok_or_else(|| ChainError::IntegrityError(format!("block {} missing from storage", index)))?;
                blocks.push(block);
            }
        }
        ChainSnapshot::new(state, blocks)
    }

    pub async fn replicate_latest(&self, recent: usize) -> Result<ReplicationReport, ChainError> {
        let snapshot = self.snapshot_from_store(recent)?;
        self.replicate_snapshot(&snapshot).await
    }

    /// Succeeds when at least one validator accepted the snapshot.
    pub async fn replicate_snapshot(&self, snapshot: &ChainSnapshot) -> Result<ReplicationReport, ChainError> {
        let factor = self.registry.config().replication_factor.max(1);
        let ranked = self.registry.get_best_validators(usize::MAX, SelectionCriteria::Health);
        if ranked.is_empty() {
            return Err(ChainError::CapacityError("no active validators to replicate to".to_string()));
        }

        let mut report = ReplicationReport::default();
        let mut next = 0;
        while report.confirmations < factor && next < ranked.len() {
            let wave_end = (next + factor - report.confirmations).min(ranked.len());
            let wave = &ranked[next..wave_end];
            next = wave_end;

            let outcomes = join_all(wave.iter().map(|validator| async move {
                let outcome = self
                    .with_retry(validator, |url, timeout| async move {
                        self.registry.transport().store_snapshot(&url, snapshot, timeout).await
                    })
                    .await;
                (validator.code.clone(), outcome)
            }))
            .await;

            for (code, outcome) in outcomes {
                match outcome {
                    Ok(()) => {
                        report.confirmations += 1;
                        report.accepted.push(code);
                    }
                    Err(e) => report.rejected.push((code, e.to_string())),
                }
            }
        }

        if report.confirmations == 0 {
            return Err(ChainError::NetworkError(format!(
                "snapshot rejected by all {} validators",
                report.rejected.len()
            )));
        }
        info!(
            confirmations = report.confirmations,
            factor,
            rejected = report.rejected.len(),
            total_blocks = snapshot.chain_state.total_blocks,
            "Snapshot replicated"
        );
        Ok(report)
    }

    /// Returns the first verified snapshot found, trying validators in
    /// descending health.
    pub async fn read_snapshot(&self) -> Result<(String, ChainSnapshot), ChainError> {
        let ranked = self.registry.get_best_validators(usize::MAX, SelectionCriteria::Health);
        if ranked.is_empty() {
            return Err(ChainError::CapacityError("no active validators to read from".to_string()));
        }

        let mut last_error = None;
        for validator in &ranked {
            let fetched = self
                .with_retry(validator, |url, timeout| async move {
                    self.registry.transport().fetch_snapshot(&url, timeout).await
                })
                .await;
            match fetched.and_then(|snapshot| snapshot.verify().map(|_| snapshot)) {
                Ok(snapshot) => return Ok((validator.code.clone(), snapshot)),
                Err(e) => {
                    if matches!(e, ChainError::IntegrityError(_)) {
                        self.registry.record_failure(&validator.code);
                    }
                    warn!(validator = %validator.code, error = %e, "Snapshot read failed, trying next validator");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ChainError::NetworkError("snapshot read failed".to_string())))
    }

    /// Runs `attempt` against one validator with a per-call timeout and
    /// exponential backoff, feeding every outcome into the registry.
    async fn with_retry<T, F, Fut>(&self, validator: &ValidatorEndpoint, attempt: F) -> Result<T, ChainError>
    where
        F: Fn(String, Duration) -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let config = self.registry.config();
        let timeout = config.network_timeout();
        let attempts = config.max_retries.max(1);
        let mut delay = config.retry_delay();
        let mut last_error = None;

        for n in 1..=attempts {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, attempt(validator.url.clone(), timeout)).await {
                Ok(result) => result,
                Err(_) => Err(ChainError::Timeout(format!("validator {}", validator.code))),
            };
            match outcome {
                Ok(value) => {
                    self.registry.record_success(&validator.code, started.elapsed());
                    return Ok(value);
                }
                Err(e) => {
                    self.registry.record_failure(&validator.code);
                    let retry = e.is_retryable() && n < attempts;
                    last_error = Some(e);
                    if !retry {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ChainError::NetworkError(format!("validator {}", validator.code))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ValidatorConfig, ValidatorEndpointConfig};
    use crate::storage::StorageEngine;
    use crate::validators::transport::mock::MockValidatorTransport;
    use crate::validators::ValidatorTier;

    fn endpoint(code: &str) -> ValidatorEndpointConfig {
        ValidatorEndpointConfig {
            code: code.to_string(),
            protocol: "http".to_string(),
            host: "validators.test".to_string(),
            port: 9100,
            region: "default".to_string(),
            tier: ValidatorTier::Primary,
            capabilities: vec!["state".to_string()],
        }
    }

    fn url(code: &str) -> String {
        format!("http://validators.test:9100/code/{}", code)
    }

    async fn setup(down: &[&str]) -> (ReplicationManager, Arc<MockValidatorTransport>) {
        let transport = Arc::new(MockValidatorTransport::default());
        let config = ValidatorConfig {
            endpoints: vec![endpoint("A"), endpoint("B"), endpoint("C")],
            replication_factor: 2,
            max_retries: 2,
            retry_delay_ms: 1,
            network_timeout_ms: 500,
            ..ValidatorConfig::default()
        };
        let registry = Arc::new(ValidatorRegistry::new(config, transport.clone()));
        let codes = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        assert_eq!(registry.connect_to_validators(&codes).await, 3);
        for code in down {
            transport.set_down(&url(code));
        }

        let engine = Arc::new(StorageEngine::open_in_memory(64).unwrap());
        let store = Arc::new(ChainStore::new(engine));
        (ReplicationManager::new(registry, store), transport)
    }

    #[tokio::test]
    async fn test_replication_survives_one_failed_validator() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (manager, transport) = setup(&["B"]).await;
            let snapshot = manager.snapshot_from_store(10).unwrap();

            let report = manager.replicate_snapshot(&snapshot).await.unwrap();
            assert_eq!(report.confirmations, 2);
            assert_eq!(report.accepted, vec!["A".to_string(), "C".to_string()]);
            assert_eq!(report.rejected.len(), 1);
            assert_eq!(transport.stored.lock().len(), 2);
        })
        .await
        .expect("test_replication_survives_one_failed_validator timed out");
    }

    #[tokio::test]
    async fn test_replication_fails_only_when_all_reject() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (manager, _) = setup(&["A", "B", "C"]).await;
            let snapshot = manager.snapshot_from_store(10).unwrap();
            let err = manager.replicate_snapshot(&snapshot).await.unwrap_err();
            assert!(matches!(err, ChainError::NetworkError(_)));
        })
        .await
        .expect("test_replication_fails_only_when_all_reject timed out");
    }

    #[tokio::test]
    async fn test_read_skips_corrupt_snapshot() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (manager, transport) = setup(&[]).await;
            let snapshot = manager.snapshot_from_store(10).unwrap();
            manager.replicate_snapshot(&snapshot).await.unwrap();

            // A holds the best health; corrupt its copy.
            let mut tampered = snapshot.clone();
            tampered.chain_state.total_blocks = 99;
            transport.stored.lock().insert(url("A"), tampered);

            let (code, read) = manager.read_snapshot().await.unwrap();
            assert_eq!(code, "B");
            assert_eq!(read, snapshot);
            assert!(manager.registry().describe("A").unwrap().health_score < 100);
        })
        .await
        .expect("test_read_skips_corrupt_snapshot timed out");
    }

    #[tokio::test]
    async fn test_read_fails_when_every_validator_fails() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (manager, transport) = setup(&[]).await;
            let snapshot = manager.snapshot_from_store(10).unwrap();
            manager.replicate_snapshot(&snapshot).await.unwrap();

            for code in ["A", "B", "C"] {
                transport.set_down(&url(code));
            }
            let err = manager.read_snapshot().await.unwrap_err();
            assert!(matches!(err, ChainError::NetworkError(_)));

            // Every validator exhausted its retries and left the active set.
            assert!(manager.registry().active_validators().is_empty());
            let err = manager.read_snapshot().await.unwrap_err();
            assert!(matches!(err, ChainError::CapacityError(_)));
        })
        .await
        .expect("test_read_fails_when_every_validator_fails timed out");
    }

    #[tokio::test]
    async fn test_replication_resumes_after_validators_recover() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (manager, transport) = setup(&["A", "B", "C"]).await;
            let snapshot = manager.snapshot_from_store(10).unwrap();

            let err = manager.replicate_snapshot(&snapshot).await.unwrap_err();
            assert!(matches!(err, ChainError::NetworkError(_)));
            assert!(manager.registry().active_validators().is_empty());
            let err = manager.replicate_snapshot(&snapshot).await.unwrap_err();
            assert!(matches!(err, ChainError::CapacityError(_)));

            transport.down.write().clear();
            assert_eq!(manager.registry().reconnect_inactive().await, 3);

            let report = manager.replicate_snapshot(&snapshot).await.unwrap();
            assert_eq!(report.confirmations, 2);
            assert!(report.rejected.is_empty());
            let (_, read) = manager.read_snapshot().await.unwrap();
            assert_eq!(read, snapshot);
        })
        .await
        .expect("test_replication_resumes_after_validators_recover timed out");
    }

    #[test]
    fn test_snapshot_checksum_detects_tampering() {
        let mut snapshot = ChainSnapshot::new(ChainState::default(), Vec::new()).unwrap();
        assert!(snapshot.verify().is_ok());
        snapshot.created_at += 1;
        assert!(matches!(snapshot.verify(), Err(ChainError::IntegrityError(_))));
    }
}
