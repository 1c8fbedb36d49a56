//! Configuration management for TopayChain
//!
//! Values come from an optional `config.toml`; every section has defaults so
//! a missing file yields a runnable devnet node. The recognised environment
//! variables are applied on top of the file.

use crate::error::ChainError;
use crate::remote::LoadBalancingStrategy;
use crate::validators::ValidatorTier;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub remote: RemoteStorageConfig,
    #[serde(default)]
    pub validators: ValidatorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_path")]
    pub path: String,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    #[serde(default = "default_true")]
    pub backup_enabled: bool,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_data_path(),
            cache_capacity: default_cache_capacity(),
            backup_dir: default_backup_dir(),
            backup_enabled: true,
            sync_interval_ms: default_sync_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenesisAllocation {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_initial_difficulty")]
    pub initial_difficulty: u32,
    #[serde(default = "default_max_difficulty")]
    pub max_difficulty: u32,
    #[serde(default = "default_mining_reward")]
    pub mining_reward: u64,
    #[serde(default = "default_target_block_time_ms")]
    pub target_block_time_ms: u64,
    #[serde(default = "default_max_block_transactions")]
    pub max_block_transactions: usize,
    #[serde(default)]
    pub genesis_allocations: Vec<GenesisAllocation>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            initial_difficulty: default_initial_difficulty(),
            max_difficulty: default_max_difficulty(),
            mining_reward: default_mining_reward(),
            target_block_time_ms: default_target_block_time_ms(),
            max_block_transactions: default_max_block_transactions(),
            genesis_allocations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteStorageConfig {
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_max_device_errors")]
    pub max_device_errors: u32,
    #[serde(default)]
    pub load_balancing: LoadBalancingStrategy,
    #[serde(default = "default_callback_timeout_ms")]
    pub callback_timeout_ms: u64,
    #[serde(default = "default_max_callback_retries")]
    pub max_callback_retries: u32,
    #[serde(default = "default_callback_retry_delay_ms")]
    pub callback_retry_delay_ms: u64,
    #[serde(default = "default_response_cache_capacity")]
    pub response_cache_capacity: usize,
}

impl Default for RemoteStorageConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval_ms(),
            max_device_errors: default_max_device_errors(),
            load_balancing: LoadBalancingStrategy::default(),
            callback_timeout_ms: default_callback_timeout_ms(),
            max_callback_retries: default_max_callback_retries(),
            callback_retry_delay_ms: default_callback_retry_delay_ms(),
            response_cache_capacity: default_response_cache_capacity(),
        }
    }
}

impl RemoteStorageConfig {
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// One row of the validator lookup table: opaque code to endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorEndpointConfig {
    pub code: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub tier: ValidatorTier,
    #[serde(default = "default_validator_capabilities")]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default)]
    pub endpoints: Vec<ValidatorEndpointConfig>,
    /// Codes to connect to at startup. Empty means every configured endpoint.
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default = "default_network_timeout_ms")]
    pub network_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            codes: Vec::new(),
            replication_factor: default_replication_factor(),
            network_timeout_ms: default_network_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

impl ValidatorConfig {
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Codes to connect to: the explicit list, or every configured endpoint.
    pub fn startup_codes(&self) -> Vec<String> {
        if self.codes.is_empty() {
            self.endpoints.iter().map(|e| e.code.clone()).collect()
        } else {
            self.codes.clone()
        }
    }
}

impl Config {
    /// Applies the recognised environment variables using `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ChainError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HEALTH_CHECK_INTERVAL") {
            self.remote.health_check_interval_ms = parse_env("HEALTH_CHECK_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("MAX_DEVICE_ERRORS") {
            self.remote.max_device_errors = parse_env("MAX_DEVICE_ERRORS", &v)?;
        }
        if let Some(v) = lookup("LOAD_BALANCING") {
            self.remote.load_balancing = v.parse()?;
        }
        if let Some(v) = lookup("CALLBACK_TIMEOUT") {
            self.remote.callback_timeout_ms = parse_env("CALLBACK_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("MAX_CALLBACK_RETRIES") {
            self.remote.max_callback_retries = parse_env("MAX_CALLBACK_RETRIES", &v)?;
        }
        if let Some(v) = lookup("VALIDATOR_CODES") {
            self.validators.codes = v
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }
        if let Some(v) = lookup("STORAGE_REPLICATION") {
            self.validators.replication_factor = parse_env("STORAGE_REPLICATION", &v)?;
        }
        if let Some(v) = lookup("BACKUP_ENABLED") {
            self.storage.backup_enabled = parse_env("BACKUP_ENABLED", &v)?;
        }
        if let Some(v) = lookup("NETWORK_TIMEOUT") {
            self.validators.network_timeout_ms = parse_env("NETWORK_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("MAX_RETRIES") {
            self.validators.max_retries = parse_env("MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("RETRY_DELAY") {
            self.validators.retry_delay_ms = parse_env("RETRY_DELAY", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.storage.path.is_empty() {
            return Err(ChainError::ConfigError("storage.path must be set".to_string()));
        }
        if self.ledger.initial_difficulty == 0
            || self.ledger.initial_difficulty > self.ledger.max_difficulty
        {
            return Err(ChainError::ConfigError(format!(
                "ledger.initial_difficulty must be within 1..={}",
                self.ledger.max_difficulty
            )));
        }
        if self.ledger.max_difficulty > 64 {
            return Err(ChainError::ConfigError(
                "ledger.max_difficulty cannot exceed 64 hex digits".to_string(),
            ));
        }
        if self.ledger.max_block_transactions == 0 {
            return Err(ChainError::ConfigError(
                "ledger.max_block_transactions must be at least 1".to_string(),
            ));
        }
        for allocation in &self.ledger.genesis_allocations {
            if !crate::crypto::is_valid_address(&allocation.address) {
                return Err(ChainError::ConfigError(format!(
                    "genesis allocation address must be 64 hex characters: {}",
                    allocation.address
                )));
            }
        }
        if self.validators.replication_factor == 0 {
            return Err(ChainError::ConfigError(
                "validators.replication_factor must be at least 1".to_string(),
            ));
        }
        for code in &self.validators.codes {
            if !self.validators.endpoints.iter().any(|e| &e.code == code) {
                return Err(ChainError::ConfigError(format!(
                    "validator code {} has no endpoint entry",
                    code
                )));
            }
        }
        Ok(())
    }
}

/// Loads `config.toml` (or `path`), falling back to defaults when the file is
/// absent, then applies environment overrides and validates.
pub fn load_config(path: Option<&Path>) -> Result<Config, ChainError> {
    let path = path.unwrap_or_else(|| Path::new("config.toml"));
    let config_str = fs::read_to_string(path).unwrap_or_default();
    let mut config: Config = if config_str.is_empty() {
        Config::default()
    } else {
        toml::from_str(&config_str)
            .map_err(|e| ChainError::ConfigError(format!("{}: {}", path.display(), e)))?
    };

    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ChainError> {
    value
        .trim()
        .parse()
        .map_err(|_| ChainError::ConfigError(format!("invalid value for {}: {}", key, value)))
}

fn default_api_port() -> u16 {
    8545
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_data_path() -> String {
    "./data/topay.db".to_string()
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_backup_dir() -> String {
    "./backups".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sync_interval_ms() -> u64 {
    30_000
}

fn default_initial_difficulty() -> u32 {
    2
}

fn default_max_difficulty() -> u32 {
    8
}

fn default_mining_reward() -> u64 {
    50
}

fn default_target_block_time_ms() -> u64 {
    10_000
}

fn default_max_block_transactions() -> usize {
    10
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_max_device_errors() -> u32 {
    3
}

fn default_callback_timeout_ms() -> u64 {
    5_000
}

fn default_max_callback_retries() -> u32 {
    3
}

fn default_callback_retry_delay_ms() -> u64 {
    200
}

fn default_response_cache_capacity() -> usize {
    500
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_region() -> String {
    "default".to_string()
}

fn default_validator_capabilities() -> Vec<String> {
    vec!["blocks".to_string(), "transactions".to_string(), "state".to_string()]
}

fn default_replication_factor() -> usize {
    2
}

fn default_network_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_interval_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ledger.max_block_transactions, 10);
        assert_eq!(config.ledger.target_block_time_ms, 10_000);
        assert_eq!(config.remote.load_balancing, LoadBalancingStrategy::RoundRobin);
    }

    #[test]
    fn test_parse_toml_sections() {
        let raw = r#"
            [network]
            api_port = 9000

            [ledger]
            initial_difficulty = 1
            mining_reward = 25

            [[ledger.genesis_allocations]]
            address = "alice"
            amount = 100

            [remote]
            load_balancing = "least-loaded"

            [[validators.endpoints]]
            code = "VAL-EU-1"
            host = "10.0.0.5"
            port = 7000
            tier = "secondary"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.network.api_port, 9000);
        assert_eq!(config.ledger.mining_reward, 25);
        assert_eq!(config.ledger.genesis_allocations[0].amount, 100);
        assert_eq!(config.remote.load_balancing, LoadBalancingStrategy::LeastLoaded);
        assert_eq!(config.validators.endpoints[0].tier, ValidatorTier::Secondary);
        assert_eq!(config.validators.endpoints[0].protocol, "http");
        assert_eq!(config.validators.startup_codes(), vec!["VAL-EU-1".to_string()]);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("HEALTH_CHECK_INTERVAL", "1500"),
            ("MAX_DEVICE_ERRORS", "5"),
            ("LOAD_BALANCING", "random"),
            ("CALLBACK_TIMEOUT", "750"),
            ("MAX_CALLBACK_RETRIES", "1"),
            ("STORAGE_REPLICATION", "3"),
            ("BACKUP_ENABLED", "false"),
            ("NETWORK_TIMEOUT", "2500"),
            ("MAX_RETRIES", "4"),
            ("RETRY_DELAY", "10"),
            ("VALIDATOR_CODES", "A, B,,C"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.remote.health_check_interval_ms, 1500);
        assert_eq!(config.remote.max_device_errors, 5);
        assert_eq!(config.remote.load_balancing, LoadBalancingStrategy::Random);
        assert_eq!(config.remote.callback_timeout_ms, 750);
        assert_eq!(config.remote.max_callback_retries, 1);
        assert_eq!(config.validators.replication_factor, 3);
        assert!(!config.storage.backup_enabled);
        assert_eq!(config.validators.network_timeout_ms, 2500);
        assert_eq!(config.validators.max_retries, 4);
        assert_eq!(config.validators.retry_delay_ms, 10);
        assert_eq!(config.validators.codes, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_bad_env_value_is_config_error() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(|k| (k == "MAX_DEVICE_ERRORS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ChainError::ConfigError(_)));
    }

    #[test]
    fn test_unknown_validator_code_rejected() {
        let mut config = Config::default();
        config.validators.codes = vec!["MISSING".to_string()];
        assert!(config.validate().is_err());
    }
}
