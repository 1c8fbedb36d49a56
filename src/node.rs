//! Node orchestrator: wires storage, ledger, sync, remote devices and
//! validators together and owns their background tasks.

use crate::api;
use crate::blockchain::Blockchain;
use crate::config::{load_config, Config};
use crate::error::ChainError;
use crate::remote::{HttpTransport, RemoteStorageAdapter};
use crate::scheduler::ScheduledTask;
use crate::storage::{ChainStore, StorageEngine};
use crate::sync::SyncManager;
use crate::validators::{HttpValidatorTransport, ReplicationManager, ValidatorRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Syncing,
    Ready,
    Degraded,
    /// Shutdown finished; background tasks are cancelled.
    Stopped,
}

/// Command-line overrides applied on top of the loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    pub config_path: Option<PathBuf>,
    pub api_port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub miner_address: Option<String>,
    /// Refuse to start unless a stored chain can be restored.
    pub require_restore: bool,
}

impl NodeOptions {
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.api_port {
            config.network.api_port = port;
        }
        if let Some(dir) = &self.data_dir {
            config.storage.path = dir.join("topay.db").to_string_lossy().into_owned();
            config.storage.backup_dir = dir.join("backups").to_string_lossy().into_owned();
        }
    }
}

pub struct Node {
    pub config: Config,
    pub blockchain: Arc<RwLock<Blockchain>>,
    pub store: Arc<ChainStore>,
    pub sync: Arc<SyncManager>,
    pub remote: Arc<RemoteStorageAdapter>,
    pub registry: Arc<ValidatorRegistry>,
    pub replication: Arc<ReplicationManager>,
    pub api: Arc<api::Node>,
    pub state: Arc<RwLock<NodeState>>,
    miner_address: Option<String>,
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl Node {
    pub async fn init(options: NodeOptions) -> Result<Self, ChainError> {
        let mut config = load_config(options.config_path.as_deref())?;
        options.apply(&mut config);
        config.validate()?;
        Self::from_config(config, options).await
    }

    /// Builds every component in dependency order: storage, chain store,
    /// sync manager, ledger (restored or fresh), then the remote layers.
    pub async fn from_config(config: Config, options: NodeOptions) -> Result<Self, ChainError> {
        let state = Arc::new(RwLock::new(NodeState::Booting));
        info!(path = %config.storage.path, "Starting TopayChain node");

        let engine = Arc::new(StorageEngine::open(&config.storage.path, config.storage.cache_capacity)?);
        let store = Arc::new(ChainStore::new(engine));
        let sync = Arc::new(SyncManager::new(store.clone())?);

        *state.write().await = NodeState::Syncing;
        let mut blockchain = match sync.restore_from_storage(config.ledger.clone())? {
            Some(chain) => chain,
            None if options.require_restore => {
                return Err(ChainError::NotFound(format!(
                    "no stored chain at {}",
                    config.storage.path
                )));
            }
            None => {
                info!("Storage is empty, creating a new chain");
                let chain = Blockchain::new(config.ledger.clone())?;
                sync.perform_full_resync(&chain)?;
                chain
            }
        };

        let report = sync.verify_integrity(&blockchain)?;
        let node_state = if report.is_valid {
            NodeState::Ready
        } else {
            warn!(mismatches = report.mismatches.len(), "Storage integrity check failed at boot");
            NodeState::Degraded
        };
        blockchain.set_observer(sync.clone());
        let blockchain = Arc::new(RwLock::new(blockchain));

        let transport = Arc::new(HttpTransport::new(config.remote.callback_timeout())?);
        let remote = Arc::new(RemoteStorageAdapter::new(config.remote.clone(), transport));

        let validator_transport = Arc::new(HttpValidatorTransport::new(config.validators.network_timeout())?);
        let registry = Arc::new(ValidatorRegistry::new(config.validators.clone(), validator_transport));
        let replication = Arc::new(ReplicationManager::new(registry.clone(), store.clone()));

        let api = Arc::new(
            api::Node::new_shared(
                blockchain.clone(),
                store.clone(),
                sync.clone(),
                remote.clone(),
                Some(state.clone()),
            )
            .with_replication(replication.clone())
            .with_backups(config.storage.backup_enabled, config.storage.backup_dir.clone()),
        );

        *state.write().await = node_state;
        Ok(Node {
            config,
            blockchain,
            store,
            sync,
            remote,
            registry,
            replication,
            api,
            state,
            miner_address: options.miner_address,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the background tasks: periodic sync, device health checks,
    /// recovery of validators that dropped out of the active set and, when
    /// nothing answered at boot, validator reconnection.
    pub async fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(self.sync.start_periodic_sync(
            self.blockchain.clone(),
            std::time::Duration::from_millis(self.config.storage.sync_interval_ms),
        ));
        tasks.push(self.remote.start_health_checks());

        let codes = self.config.validators.startup_codes();
        if let Some(reconnect) = self.registry.connect_with_retry(codes).await {
            tasks.push(reconnect);
        }
        if !self.config.validators.endpoints.is_empty() {
            tasks.push(
                self.registry
                    .start_reconnect_monitor(self.config.remote.health_check_interval()),
            );
        }

        if let Some(miner) = &self.miner_address {
            if let Err(e) = self.api.start_mining(miner.clone()).await {
                warn!(error = %e.message(), "Auto-mining did not start");
            }
        }
    }

    /// Serves the API until ctrl-c, then shuts down cleanly.
    pub async fn run(self: Arc<Self>) -> Result<(), ChainError> {
        self.start_background_tasks().await;

        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.network.bind_address, self.config.network.api_port
        )
        .parse()
        .map_err(|e| ChainError::ConfigError(format!("Invalid bind address: {}", e)))?;

        let api = self.api.clone();
        let server = tokio::spawn(async move { api::run_api_server(api, addr).await });

        tokio::select! {
            result = server => {
                match result {
                    Ok(Ok(())) => info!("API server exited"),
                    Ok(Err(e)) => error!(error = %e, "API server failed"),
                    Err(e) => error!(error = %e, "API server task panicked"),
                }
            }
            _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stops mining, cancels every task and flushes a final incremental sync.
    pub async fn shutdown(&self) {
        if self.api.is_mining() {
            let _ = self.api.stop_mining().await;
        }
        let tasks: Vec<ScheduledTask> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.cancel().await;
        }

        let chain = self.blockchain.read().await;
        match self.sync.perform_incremental_sync(&chain) {
            Ok(blocks) => info!(blocks, "Final sync complete"),
            Err(e) => error!(error = %e, "Final sync failed"),
        }
        *self.state.write().await = NodeState::Stopped;
    }
}
