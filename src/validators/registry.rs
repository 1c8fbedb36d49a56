//! Opaque validator codes resolved to endpoints
//!
//! Callers only ever see codes; the resolved URL stays inside the registry
//! and the transports it drives.

use super::transport::ValidatorTransport;
use super::ValidatorTier;
use crate::config::{ValidatorConfig, ValidatorEndpointConfig};
use crate::error::ChainError;
use crate::remote::device::{adjust_health_score, MAX_HEALTH_SCORE};
use crate::scheduler::{ScheduledTask, TaskControl};
use crate::transaction::now_millis;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionCriteria {
    Health,
    ResponseTime,
    Tier,
}

#[derive(Debug, Clone)]
pub struct ValidatorEndpoint {
    pub code: String,
    pub url: String,
    pub region: String,
    pub tier: ValidatorTier,
    pub capabilities: Vec<String>,
    pub health_score: u8,
    pub response_time_ms: u64,
    pub consecutive_errors: u32,
    pub active: bool,
    pub last_seen: Option<u64>,
}

impl ValidatorEndpoint {
    pub fn from_config(entry: &ValidatorEndpointConfig) -> Self {
        ValidatorEndpoint {
            code: entry.code.clone(),
            url: format!(
                "{}://{}:{}/code/{}",
                entry.protocol, entry.host, entry.port, entry.code
            ),
            region: entry.region.clone(),
            tier: entry.tier,
            capabilities: entry.capabilities.clone(),
            health_score: MAX_HEALTH_SCORE,
            response_time_ms: 0,
            consecutive_errors: 0,
            active: false,
            last_seen: None,
        }
    }

    pub fn view(&self) -> ValidatorView {
        ValidatorView {
            code: self.code.clone(),
            region: self.region.clone(),
            tier: self.tier,
            capabilities: self.capabilities.clone(),
            health_score: self.health_score,
            response_time_ms: self.response_time_ms,
            active: self.active,
        }
    }
}

/// Client-facing validator description. Carries no endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorView {
    pub code: String,
    pub region: String,
    pub tier: ValidatorTier,
    pub capabilities: Vec<String>,
    pub health_score: u8,
    pub response_time_ms: u64,
    pub active: bool,
}

pub struct ValidatorRegistry {
    validators: RwLock<BTreeMap<String, ValidatorEndpoint>>,
    transport: Arc<dyn ValidatorTransport>,
    config: ValidatorConfig,
}

impl ValidatorRegistry {
    pub fn new(config: ValidatorConfig, transport: Arc<dyn ValidatorTransport>) -> Self {
        let validators = config
            .endpoints
            .iter()
            .map(|entry| (entry.code.clone(), ValidatorEndpoint::from_config(entry)))
            .collect();
        ValidatorRegistry {
            validators: RwLock::new(validators),
            transport,
            config,
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> &Arc<dyn ValidatorTransport> {
        &self.transport
    }

    pub fn resolve(&self, code: &str) -> Result<ValidatorEndpoint, ChainError> {
        self.validators
            .read()
            .get(code)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(format!("validator code {}", code)))
    }

    pub fn describe(&self, code: &str) -> Result<ValidatorView, ChainError> {
        self.resolve(code).map(|v| v.view())
    }

    pub fn all_validators(&self) -> Vec<ValidatorView> {
        self.validators.read().values().map(ValidatorEndpoint::view).collect()
    }

    pub fn active_validators(&self) -> Vec<ValidatorView> {
        self.validators
            .read()
            .values()
            .filter(|v| v.active)
            .map(ValidatorEndpoint::view)
            .collect()
    }

    /// Probes one validator's status endpoint and updates its health and
    /// active-set membership.
    pub async fn probe(&self, code: &str) -> Result<(), ChainError> {
        let url = self.resolve(code)?.url;
        let timeout = self.config.network_timeout();
        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, self.transport.status(&url, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Timeout(format!("status of validator {}", code))),
        };

        match outcome {
            Ok(()) => {
                self.record_success(code, started.elapsed());
                Ok(())
            }
            Err(e) => {
                self.record_failure(code);
                if let Some(v) = self.validators.write().get_mut(code) {
                    v.active = false;
                }
                Err(e)
            }
        }
    }

    /// Probes every listed code concurrently. Returns how many are active.
    pub async fn connect_to_validators(&self, codes: &[String]) -> usize {
        let outcomes = join_all(codes.iter().map(|code| async move { (code, self.probe(code).await) })).await;
        let mut connected = 0;
        for (code, outcome) in outcomes {
            match outcome {
                Ok(()) => connected += 1,
                Err(e) => warn!(validator = %code, error = %e, "Validator connection failed"),
            }
        }
        info!(requested = codes.len(), connected, "Validator connection round finished");
        connected
    }

    /// Top `count` active validators ranked by `criteria`. Ties break on code.
    pub fn get_best_validators(&self, count: usize, criteria: SelectionCriteria) -> Vec<ValidatorEndpoint> {
        let mut ranked: Vec<ValidatorEndpoint> = self
            .validators
            .read()
            .values()
            .filter(|v| v.active)
            .cloned()
            .collect();

        match criteria {
            SelectionCriteria::Health => {
                ranked.sort_by(|a, b| b.health_score.cmp(&a.health_score).then_with(|| a.code.cmp(&b.code)))
            }
            SelectionCriteria::ResponseTime => ranked.sort_by(|a, b| {
                a.response_time_ms
                    .cmp(&b.response_time_ms)
                    .then_with(|| a.code.cmp(&b.code))
            }),
            SelectionCriteria::Tier => ranked.sort_by(|a, b| {
                a.tier
                    .cmp(&b.tier)
                    .then_with(|| b.health_score.cmp(&a.health_score))
                    .then_with(|| a.code.cmp(&b.code))
            }),
        }
        ranked.truncate(count);
        ranked
    }

    pub fn record_success(&self, code: &str, elapsed: Duration) {
        if let Some(v) = self.validators.write().get_mut(code) {
            v.health_score = adjust_health_score(v.health_score, true);
            v.response_time_ms = elapsed.as_millis() as u64;
            v.consecutive_errors = 0;
            v.active = true;
            v.last_seen = Some(now_millis());
        }
    }

    /// Drops the validator from the active set once its consecutive failures
    /// reach `max_retries`.
    pub fn record_failure(&self, code: &str) {
        if let Some(v) = self.validators.write().get_mut(code) {
            v.health_score = adjust_health_score(v.health_score, false);
            v.consecutive_errors += 1;
            if v.active && v.consecutive_errors >= self.config.max_retries.max(1) {
                v.active = false;
                warn!(validator = %code, health = v.health_score, "Validator left the active set");
            }
        }
    }

    /// Connects now; when nothing answers, keeps retrying every
    /// `reconnect_interval_ms` until at least one validator is active.
    pub async fn connect_with_retry(self: &Arc<Self>, codes: Vec<String>) -> Option<ScheduledTask> {
        if codes.is_empty() || self.connect_to_validators(&codes).await > 0 {
            return None;
        }

        warn!(
            retry_ms = self.config.reconnect_interval_ms,
            "No validators reachable, scheduling reconnect"
        );
        let registry = Arc::clone(self);
        let period = Duration::from_millis(self.config.reconnect_interval_ms);
        Some(ScheduledTask::spawn_periodic("validator-reconnect", period, move || {
            let registry = Arc::clone(&registry);
            let codes = codes.clone();
            async move {
                if registry.connect_to_validators(&codes).await > 0 {
                    info!("Validator reconnect succeeded");
                    TaskControl::Stop
                } else {
                    debug!("Validator reconnect attempt found nothing");
                    TaskControl::Continue
                }
            }
        }))
    }

    pub fn inactive_codes(&self) -> Vec<String> {
        self.validators
            .read()
            .values()
            .filter(|v| !v.active)
            .map(|v| v.code.clone())
            .collect()
    }

    /// Probes every validator outside the active set. Returns how many
    /// rejoined it.
    pub async fn reconnect_inactive(&self) -> usize {
        let codes = self.inactive_codes();
        if codes.is_empty() {
            return 0;
        }
        self.connect_to_validators(&codes).await
    }

    /// Runs `reconnect_inactive` every `period` for the lifetime of the node.
    pub fn start_reconnect_monitor(self: &Arc<Self>, period: Duration) -> ScheduledTask {
        let registry = Arc::clone(self);
        ScheduledTask::spawn_periodic("validator-recovery", period, move || {
            let registry = Arc::clone(&registry);
            async move {
                let recovered = registry.reconnect_inactive().await;
                if recovered > 0 {
                    info!(recovered, "Validators rejoined the active set");
                }
                TaskControl::Continue
            }
        })
    }
}
