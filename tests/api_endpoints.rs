//! Integration tests for the TopayChain HTTP API and `topay_*` RPC methods.

use axum_test::TestServer;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use topaychain::api::{build_api_router, Node};
use topaychain::blockchain::Blockchain;
use topaychain::config::{GenesisAllocation, LedgerConfig, RemoteStorageConfig};
use topaychain::crypto::{compute_hash, KeyPair};
use topaychain::node::NodeState;
use topaychain::remote::{HttpTransport, RemoteStorageAdapter};
use topaychain::storage::{ChainStore, StorageEngine};
use topaychain::sync::SyncManager;

fn test_node(funded: &KeyPair, backups: bool) -> Arc<Node> {
    let ledger = LedgerConfig {
        initial_difficulty: 1,
        max_difficulty: 1,
        genesis_allocations: vec![GenesisAllocation {
            address: funded.address(),
            amount: 1_000,
        }],
        ..LedgerConfig::default()
    };

    let engine = Arc::new(StorageEngine::open_in_memory(128).expect("Failed to open storage"));
    let store = Arc::new(ChainStore::new(engine));
    let sync = Arc::new(SyncManager::new(store.clone()).expect("Failed to create sync manager"));

    let mut blockchain = Blockchain::new(ledger).expect("Failed to create blockchain");
    sync.perform_full_resync(&blockchain).expect("Failed to persist genesis");
    blockchain.set_observer(sync.clone());

    let transport = Arc::new(HttpTransport::new(Duration::from_millis(200)).expect("Failed to build transport"));
    let remote = Arc::new(RemoteStorageAdapter::new(RemoteStorageConfig::default(), transport));
    let state = Arc::new(RwLock::new(NodeState::Ready));

    Arc::new(
        Node::new_shared(
            Arc::new(RwLock::new(blockchain)),
            store,
            sync,
            remote,
            Some(state),
        )
        .with_backups(backups, std::env::temp_dir()),
    )
}

fn rpc(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params })
}

#[tokio::test]
async fn test_health_and_stats_endpoints() {
    let server = TestServer::new(build_api_router(test_node(&KeyPair::generate().unwrap(), false)))
        .expect("Failed to create test server");

    let response = server.get("/api/health").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["nodeState"], "Ready");
    assert_eq!(json["height"], 0);
    assert!(json["timestamp"].is_string());

    let response = server.get("/api/stats").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert!(json["total_requests"].as_u64().unwrap() >= 1);
    assert_eq!(json["is_mining"], false);

    let response = server.get("/api/storage/stats").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["success"], true);
    assert_eq!(json["chainState"]["totalBlocks"], 1);
}

#[tokio::test]
async fn test_device_registration_lifecycle() {
    let server = TestServer::new(build_api_router(test_node(&KeyPair::generate().unwrap(), false)))
        .expect("Failed to create test server");

    let response = server
        .post("/api/storage/register")
        .json(&json!({
            "deviceId": "dev-1",
            "url": "http://127.0.0.1:9/",
            "capabilities": ["Blocks", "state"],
            "region": "eu-west",
        }))
        .await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["device"]["deviceId"], "dev-1");
    assert_eq!(json["device"]["healthScore"], 100);
    assert!(json["device"].get("url").is_none());

    let response = server
        .post("/api/storage/register")
        .json(&json!({ "deviceId": "bad", "url": "ftp://nowhere", "capabilities": [] }))
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), 400);

    let json: Value = server.get("/api/storage/devices").await.json();
    assert_eq!(json["count"], 1);
    assert_eq!(json["devices"][0]["capabilities"], json!(["blocks", "state"]));

    let response = server.delete("/api/storage/unregister/dev-1").await;
    assert_eq!(response.status_code(), 200);

    let response = server
        .delete("/api/storage/unregister/dev-1")
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), 404);
    let json: Value = response.json();
    assert_eq!(json["success"], false);

    // No devices left for the auto dispatcher.
    let response = server
        .post("/api/storage/auto/getBlock")
        .json(&json!({ "index": 0 }))
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), 503);
}

#[tokio::test]
async fn test_rpc_mine_and_transfer() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let alice = KeyPair::generate().unwrap();
        let bob = compute_hash(b"bob");
        let miner = compute_hash(b"miner");
        let server = TestServer::new(build_api_router(test_node(&alice, false)))
            .expect("Failed to create test server");

        let response = server.post("/rpc").json(&rpc("topay_getChainInfo", json!([]))).await;
        assert_eq!(response.status_code(), 200);
        let json: Value = response.json();
        assert_eq!(json["success"], true);
        assert_eq!(json["id"], 1);
        assert_eq!(json["result"]["totalBlocks"], 1);

        let response = server
            .post("/rpc")
            .json(&rpc(
                "topay_sendTransaction",
                json!([{
                    "from": alice.address(),
                    "to": bob,
                    "amount": 250,
                    "nonce": 0,
                    "secretKey": hex::encode(alice.secret_key.secret_bytes()),
                }]),
            ))
            .await;
        assert_eq!(response.status_code(), 200);
        let json: Value = response.json();
        assert_eq!(json["result"]["status"], "pending");

        let json: Value = server
            .post("/rpc")
            .json(&rpc("topay_getMempool", json!([])))
            .await
            .json();
        assert_eq!(json["result"]["count"], 1);

        let json: Value = server
            .post("/rpc")
            .json(&rpc("topay_getBalance", json!([alice.address()])))
            .await
            .json();
        assert_eq!(json["result"]["balance"], 1_000);
        assert_eq!(json["result"]["available"], 750);
        assert_eq!(json["result"]["nonce"], 1);

        let response = server.post("/rpc").json(&rpc("topay_mine", json!([miner]))).await;
        assert_eq!(response.status_code(), 200);
        let json: Value = response.json();
        assert_eq!(json["result"]["index"], 1);

        let json: Value = server
            .post("/rpc")
            .json(&rpc("topay_getBalance", json!([bob])))
            .await
            .json();
        assert_eq!(json["result"]["balance"], 250);

        let json: Value = server
            .post("/rpc")
            .json(&rpc("topay_getTransactionHistory", json!([bob, 10])))
            .await
            .json();
        assert_eq!(json["result"]["count"], 1);
        assert_eq!(json["result"]["limit"], 10);
    })
    .await
    .expect("test_rpc_mine_and_transfer timed out");
}

#[tokio::test]
async fn test_rpc_error_envelopes() {
    let alice = KeyPair::generate().unwrap();
    let server = TestServer::new(build_api_router(test_node(&alice, false)))
        .expect("Failed to create test server");

    let response = server
        .post("/rpc")
        .json(&rpc("topay_doesNotExist", json!([])))
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), 404);
    let json: Value = response.json();
    assert_eq!(json["success"], false);
    assert!(json["error"].as_str().unwrap().contains("topay_doesNotExist"));

    let response = server
        .post("/rpc")
        .json(&rpc(
            "topay_sendTransaction",
            json!([{
                "from": alice.address(),
                "to": compute_hash(b"bob"),
                "amount": 5_000,
                "secretKey": hex::encode(alice.secret_key.secret_bytes()),
            }]),
        ))
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), 400);

    let response = server
        .post("/rpc")
        .json(&rpc("topay_mine", json!(["m:x"])))
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), 400);

    let response = server
        .post("/rpc")
        .json(&rpc("topay_stopAutoMining", json!([])))
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), 409);
}

#[tokio::test]
async fn test_backup_disabled_returns_unavailable() {
    let server = TestServer::new(build_api_router(test_node(&KeyPair::generate().unwrap(), false)))
        .expect("Failed to create test server");

    let response = server.post("/api/storage/backup").expect_failure().await;
    assert_eq!(response.status_code(), 503);
    let json: Value = response.json();
    assert_eq!(json["error"], "Backups are disabled");
}
