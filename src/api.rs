//! HTTP surface for TopayChain
//!
//! Serves the `topay_*` RPC methods on `POST /rpc`, the storage-device REST
//! endpoints under `/api/storage` and a health probe. Mining runs outside
//! the chain lock and is serialised by a dedicated mutex.

use axum::{
    extract::{Path, Query, Request, State},
    http::{self, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};

use crate::blockchain::{Block, Blockchain};
use crate::crypto::is_valid_address;
use crate::error::{ChainError, ErrorClass};
use crate::miner;
use crate::node::NodeState;
use crate::remote::{DeviceRegistration, RemoteStorageAdapter};
use crate::rpc::{handle_rpc, RpcRequest};
use crate::scheduler::{ScheduledTask, TaskControl};
use crate::storage::ChainStore;
use crate::sync::SyncManager;
use crate::validators::ReplicationManager;

/// Blocks carried by the snapshot pushed to validators after each mined block.
const REPLICATED_RECENT_BLOCKS: usize = 10;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct Node {
    pub blockchain: Arc<RwLock<Blockchain>>,
    pub store: Arc<ChainStore>,
    pub sync: Arc<SyncManager>,
    pub remote: Arc<RemoteStorageAdapter>,
    pub replication: Option<Arc<ReplicationManager>>,
    // Optional shared orchestrator state for health checks and logging
    pub state: Option<Arc<RwLock<NodeState>>>,
    backup_enabled: bool,
    backup_dir: PathBuf,
    is_mining: Arc<AtomicBool>,
    blocks_mined: Arc<AtomicU64>,
    mining_lock: Arc<Mutex<()>>,
    mining_task: Arc<Mutex<Option<ScheduledTask>>>,
    api_stats: Arc<RwLock<ApiStats>>,
}

#[derive(Debug, Default)]
struct ApiStats {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    mining_starts: u64,
    mining_stops: u64,
    transactions_submitted: u64,
    start_time: Option<Instant>,
}

impl ApiStats {
    fn new() -> Self {
        ApiStats {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    fn record_request(&mut self, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
    }
}

impl Node {
    pub fn new_shared(
        blockchain: Arc<RwLock<Blockchain>>,
        store: Arc<ChainStore>,
        sync: Arc<SyncManager>,
        remote: Arc<RemoteStorageAdapter>,
        state: Option<Arc<RwLock<NodeState>>>,
    ) -> Self {
        Self {
            blockchain,
            store,
            sync,
            remote,
            replication: None,
            state,
            backup_enabled: true,
            backup_dir: PathBuf::from("./backups"),
            is_mining: Arc::new(AtomicBool::new(false)),
            blocks_mined: Arc::new(AtomicU64::new(0)),
            mining_lock: Arc::new(Mutex::new(())),
            mining_task: Arc::new(Mutex::new(None)),
            api_stats: Arc::new(RwLock::new(ApiStats::new())),
        }
    }

    pub fn with_replication(mut self, replication: Arc<ReplicationManager>) -> Self {
        self.replication = Some(replication);
        self
    }

    pub fn with_backups(mut self, enabled: bool, dir: impl Into<PathBuf>) -> Self {
        self.backup_enabled = enabled;
        self.backup_dir = dir.into();
        self
    }

    pub fn is_mining(&self) -> bool {
        self.is_mining.load(Ordering::Relaxed)
    }

    pub fn blocks_mined(&self) -> u64 {
        self.blocks_mined.load(Ordering::Relaxed)
    }

    pub(crate) async fn note_transaction_submitted(&self) {
        self.api_stats.write().await.transactions_submitted += 1;
    }

    /// Mines one block paying `miner_address`. The proof-of-work runs on the
    /// blocking pool with no chain lock held; only one mining run is in
    /// flight at a time.
    pub async fn mine_once(&self, miner_address: &str) -> Result<Block, ChainError> {
        let _guard = self.mining_lock.lock().await;

        let candidate = self.blockchain.read().await.prepare_block(miner_address)?;
        let block = tokio::task::spawn_blocking(move || miner::mine_block(candidate))
            .await
            .map_err(|e| ChainError::IoError(format!("Mining task failed: {}", e)))??;

        self.blockchain.write().await.add_block(block.clone())?;
        self.blocks_mined.fetch_add(1, Ordering::SeqCst);
        self.spawn_replication();
        Ok(block)
    }

    fn spawn_replication(&self) {
        let Some(replication) = self.replication.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = replication.replicate_latest(REPLICATED_RECENT_BLOCKS).await {
                warn!(error = %e, "Snapshot replication failed");
            }
        });
    }

    /// Starts periodic mining to `miner_address`, one block per target block
    /// time.
    pub async fn start_mining(&self, miner_address: String) -> Result<(), ApiError> {
        if !is_valid_address(&miner_address) {
            return Err(ApiError::InvalidInput(format!(
                "Miner address must be 64 hex characters: {}",
                miner_address
            )));
        }

        if self
            .is_mining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ApiError::MiningAlreadyRunning);
        }
        self.api_stats.write().await.mining_starts += 1;

        let period = Duration::from_millis(
            self.blockchain
                .read()
                .await
                .config()
                .target_block_time_ms
                .max(100),
        );
        let node = self.clone();
        let task = ScheduledTask::spawn_periodic("auto-mining", period, move || {
            let node = node.clone();
            let miner_address = miner_address.clone();
            async move {
                if !node.is_mining.load(Ordering::Relaxed) {
                    return TaskControl::Stop;
                }
                match node.mine_once(&miner_address).await {
                    Ok(block) => info!(index = block.index, hash = %block.hash, "Auto-mined block"),
                    Err(e) => error!(error = %e, "Auto-mining attempt failed"),
                }
                TaskControl::Continue
            }
        });

        *self.mining_task.lock().await = Some(task);
        info!("Auto-mining started");
        Ok(())
    }

    pub async fn stop_mining(&self) -> Result<(), ApiError> {
        if self
            .is_mining
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ApiError::MiningNotRunning);
        }
        self.api_stats.write().await.mining_stops += 1;

        if let Some(task) = self.mining_task.lock().await.take() {
            task.cancel().await;
        }
        info!("Auto-mining stopped");
        Ok(())
    }

    pub async fn get_stats(&self) -> ApiStatsResponse {
        let stats = self.api_stats.read().await;
        let uptime = stats.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0);

        ApiStatsResponse {
            total_requests: stats.total_requests,
            successful_requests: stats.successful_requests,
            failed_requests: stats.failed_requests,
            mining_starts: stats.mining_starts,
            mining_stops: stats.mining_stops,
            transactions_submitted: stats.transactions_submitted,
            uptime_seconds: uptime,
            blocks_mined: self.blocks_mined(),
            is_mining: self.is_mining(),
        }
    }
}

// ============================================================================
// API Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Chain(ChainError),
    InvalidInput(String),
    NotFound(String),
    Unavailable(String),
    MiningAlreadyRunning,
    MiningNotRunning,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Chain(e) => match e.class() {
                ErrorClass::Validation => StatusCode::BAD_REQUEST,
                ErrorClass::NotFound => StatusCode::NOT_FOUND,
                ErrorClass::Network | ErrorClass::Capacity => StatusCode::SERVICE_UNAVAILABLE,
                ErrorClass::Integrity | ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::MiningAlreadyRunning | ApiError::MiningNotRunning => StatusCode::CONFLICT,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::Chain(e) => e.to_string(),
            ApiError::InvalidInput(msg) | ApiError::NotFound(msg) | ApiError::Unavailable(msg) => msg.clone(),
            ApiError::MiningAlreadyRunning => "Mining is already running".to_string(),
            ApiError::MiningNotRunning => "Mining is not running".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(ErrorResponse::new(self.message()))).into_response()
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError::Chain(err)
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    success: bool,
    error: String,
}

impl ErrorResponse {
    pub fn new(error: String) -> Self {
        ErrorResponse { success: false, error }
    }
}

#[derive(Serialize)]
pub struct ApiStatsResponse {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub mining_starts: u64,
    pub mining_stops: u64,
    pub transactions_submitted: u64,
    pub uptime_seconds: u64,
    pub blocks_mined: u64,
    pub is_mining: bool,
}

#[derive(Deserialize)]
struct BroadcastQuery {
    capability: Option<String>,
}

fn ok(mut body: Value) -> Json<Value> {
    if let Some(map) = body.as_object_mut() {
        map.insert("success".to_string(), Value::Bool(true));
    }
    Json(body)
}

// ============================================================================
// Middleware
// ============================================================================

async fn stats_middleware(State(node): State<Arc<Node>>, req: Request, next: Next) -> Response {
    let response = next.run(req).await;

    let success = response.status().is_success();
    node.api_stats.write().await.record_request(success);

    response
}

/// Logs method, path, status, duration and current `NodeState`.
async fn logging_middleware(
    State(node): State<Arc<Node>>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status();

    let node_state = match &node.state {
        Some(s) => format!("{:?}", *s.read().await),
        None => "unknown".to_string(),
    };

    info!(
        method = %method,
        path = %path,
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        node_state = %node_state,
        "api.request"
    );

    response
}

// ============================================================================
// API Server
// ============================================================================

pub fn build_api_router(node: Arc<Node>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(vec![http::header::CONTENT_TYPE])
        .allow_credentials(true);

    let storage_routes = Router::new()
        .route("/register", post(register_device))
        .route("/unregister/:device_id", delete(unregister_device))
        .route("/devices", get(list_devices))
        .route("/monitoring", get(get_monitoring))
        .route("/health-check/:device_id", post(health_check_device))
        .route("/health-check-all", post(health_check_all))
        .route("/callback/:device_id/:operation", post(callback_operation))
        .route("/broadcast/:operation", post(broadcast_operation))
        .route("/auto/:operation", post(auto_operation))
        .route("/stats", get(get_storage_stats))
        .route("/backup", post(create_backup));

    let api_routes = Router::new()
        .nest("/storage", storage_routes)
        .route("/health", get(health_check))
        .route("/stats", get(get_api_stats));

    Router::new()
        .route("/rpc", post(rpc_endpoint))
        .nest("/api", api_routes)
        // logging before stats so we always record timing and node-state
        .layer(middleware::from_fn_with_state(node.clone(), logging_middleware))
        .layer(middleware::from_fn_with_state(node.clone(), stats_middleware))
        .with_state(node)
        .layer(cors)
}

pub async fn run_api_server(node: Arc<Node>, addr: SocketAddr) -> Result<(), ChainError> {
    let app = build_api_router(node);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn rpc_endpoint(State(node): State<Arc<Node>>, Json(request): Json<RpcRequest>) -> Response {
    handle_rpc(&node, request).await
}

async fn health_check(State(node): State<Arc<Node>>) -> impl IntoResponse {
    let state = match &node.state {
        Some(s) => s.read().await.clone(),
        None => NodeState::Ready,
    };
    let (height, is_valid) = {
        let chain = node.blockchain.read().await;
        (chain.height(), chain.is_chain_valid())
    };
    let sync = node.sync.status();
    let status = if state == NodeState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "success": status.is_success(),
            "status": if status.is_success() { "healthy" } else { "unhealthy" },
            "nodeState": format!("{:?}", state),
            "height": height,
            "chainValid": is_valid,
            "sync": sync,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

async fn get_api_stats(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(node.get_stats().await)
}

async fn register_device(
    State(node): State<Arc<Node>>,
    Json(registration): Json<DeviceRegistration>,
) -> Result<Json<Value>, ApiError> {
    let device = node.remote.register_device(registration)?;
    Ok(ok(json!({ "device": device })))
}

async fn unregister_device(
    State(node): State<Arc<Node>>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    node.remote.unregister_device(&device_id)?;
    Ok(ok(json!({ "deviceId": device_id })))
}

async fn list_devices(State(node): State<Arc<Node>>) -> Json<Value> {
    let devices = node.remote.list_devices();
    ok(json!({ "count": devices.len(), "devices": devices }))
}

async fn get_monitoring(State(node): State<Arc<Node>>) -> Json<Value> {
    ok(json!({ "monitoring": node.remote.monitoring() }))
}

async fn health_check_device(
    State(node): State<Arc<Node>>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let result = node.remote.health_check_device(&device_id).await?;
    Ok(ok(json!({ "result": result })))
}

async fn health_check_all(State(node): State<Arc<Node>>) -> Json<Value> {
    let results = node.remote.health_check_all().await;
    let healthy = results.iter().filter(|r| r.healthy).count();
    ok(json!({ "checked": results.len(), "healthy": healthy, "results": results }))
}

async fn callback_operation(
    State(node): State<Arc<Node>>,
    Path((device_id, operation)): Path<(String, String)>,
    payload: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    let payload = payload.map(|Json(v)| v).unwrap_or(Value::Null);
    let response = node
        .remote
        .request_storage_operation(&device_id, &operation, &payload)
        .await?;
    Ok(ok(json!({ "deviceId": device_id, "operation": operation, "response": response })))
}

async fn broadcast_operation(
    State(node): State<Arc<Node>>,
    Path(operation): Path<String>,
    Query(query): Query<BroadcastQuery>,
    payload: Option<Json<Value>>,
) -> Result<Response, ApiError> {
    let payload = payload.map(|Json(v)| v).unwrap_or(Value::Null);
    let result = node
        .remote
        .broadcast_storage_operation(&operation, &payload, query.capability.as_deref())
        .await?;
    let status = if result.is_success() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(json!({ "success": result.is_success(), "result": result }))).into_response())
}

async fn auto_operation(
    State(node): State<Arc<Node>>,
    Path(operation): Path<String>,
    payload: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    let payload = payload.map(|Json(v)| v).unwrap_or(Value::Null);
    let dispatch = node
        .remote
        .request_storage_operation_auto(&operation, &payload)
        .await?;
    Ok(ok(json!({ "operation": operation, "dispatch": dispatch })))
}

async fn get_storage_stats(State(node): State<Arc<Node>>) -> Result<Json<Value>, ApiError> {
    let storage = node.store.stats()?;
    let chain_state = node.store.get_chain_state()?;
    let validators = node
        .replication
        .as_ref()
        .map(|r| r.registry().all_validators())
        .unwrap_or_default();
    Ok(ok(json!({
        "remote": node.remote.stats(),
        "storage": storage,
        "chainState": chain_state,
        "sync": node.sync.status(),
        "validators": validators,
    })))
}

async fn create_backup(State(node): State<Arc<Node>>) -> Result<Json<Value>, ApiError> {
    if !node.backup_enabled {
        return Err(ApiError::Unavailable("Backups are disabled".to_string()));
    }
    let store = node.store.clone();
    let dir = node.backup_dir.clone();
    let path = tokio::task::spawn_blocking(move || store.backup(dir))
        .await
        .map_err(|e| ChainError::IoError(format!("Backup task failed: {}", e)))??;
    info!(path = %path.display(), "Backup written");
    Ok(ok(json!({ "path": path.display().to_string() })))
}
