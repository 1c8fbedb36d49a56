//! `topay_*` JSON-RPC methods
//!
//! Requests arrive as `{jsonrpc, id, method, params}` with positional
//! params. Failures keep the envelope and report `{success:false, error}`
//! under the HTTP status of the error class.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::api::{ApiError, Node};
use crate::crypto::{is_valid_address, KeyPair};
use crate::error::ChainError;
use crate::transaction::Transaction;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

fn default_jsonrpc() -> String {
    "2.0".to_string()
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: String,
    id: Value,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// First param of `topay_sendTransaction`. Either carries a detached
/// signature (`signature`, `publicKey`, `timestamp`) or a devnet
/// `secretKey` the node signs with.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTransactionParams {
    pub from: String,
    pub to: String,
    pub amount: u64,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub nonce: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
}

impl SendTransactionParams {
    pub fn into_transaction(self) -> Result<Transaction, ChainError> {
        let mut tx = match self.timestamp {
            Some(ts) => Transaction::with_timestamp(Some(self.from), self.to, self.amount, ts),
            None => Transaction::new(self.from, self.to, self.amount),
        };
        if let Some(nonce) = self.nonce {
            tx = tx.with_nonce(nonce);
        }
        if let Some(memo) = self.memo {
            tx = tx.with_memo(memo)?;
        }

        match (self.secret_key, self.signature, self.public_key) {
            (Some(secret), _, _) => {
                let bytes = hex::decode(secret.trim())
                    .map_err(|e| ChainError::CryptoError(format!("Invalid secret key hex: {}", e)))?;
                let keypair = KeyPair::from_secret_bytes(&bytes)?;
                tx.sign(&keypair)?;
            }
            (None, Some(signature), Some(public_key)) => {
                tx.signature = Some(signature);
                tx.public_key = Some(public_key);
            }
            _ => {
                return Err(ChainError::InvalidTransaction(
                    "Transaction must carry a signature and public key, or a secret key".to_string(),
                ))
            }
        }
        Ok(tx)
    }
}

fn param_str(params: &[Value], index: usize, name: &str) -> Result<String, ApiError> {
    params
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidInput(format!("Missing parameter {} ({})", index, name)))
}

fn param_address(params: &[Value], index: usize, name: &str) -> Result<String, ApiError> {
    let address = param_str(params, index, name)?;
    if !is_valid_address(&address) {
        return Err(ApiError::InvalidInput(format!(
            "Parameter {} ({}) must be a 64-character hex address",
            index, name
        )));
    }
    Ok(address)
}

fn param_usize(params: &[Value], index: usize, default: usize) -> Result<usize, ApiError> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| ApiError::InvalidInput(format!("Parameter {} must be a non-negative integer", index))),
    }
}

/// Runs one RPC call and wraps the outcome in the response envelope.
pub async fn handle_rpc(node: &Node, request: RpcRequest) -> Response {
    debug!(method = %request.method, "rpc call");
    let outcome = dispatch(node, &request.method, &request.params).await;

    let (status, body) = match outcome {
        Ok(result) => (
            StatusCode::OK,
            RpcResponse {
                jsonrpc: request.jsonrpc,
                id: request.id,
                success: true,
                result: Some(result),
                error: None,
            },
        ),
        Err(e) => (
            e.status(),
            RpcResponse {
                jsonrpc: request.jsonrpc,
                id: request.id,
                success: false,
                result: None,
                error: Some(e.message()),
            },
        ),
    };
    (status, Json(body)).into_response()
}

async fn dispatch(node: &Node, method: &str, params: &[Value]) -> Result<Value, ApiError> {
    match method {
        "topay_getChainInfo" => {
            let chain = node.blockchain.read().await;
            Ok(serde_json::to_value(chain.chain_info()).map_err(ChainError::from)?)
        }
        "topay_getMempool" => {
            let chain = node.blockchain.read().await;
            let transactions = chain.pending_transactions();
            Ok(json!({ "count": transactions.len(), "transactions": transactions }))
        }
        "topay_sendTransaction" => {
            let raw = params
                .first()
                .cloned()
                .ok_or_else(|| ApiError::InvalidInput("Missing transaction parameter".to_string()))?;
            let request: SendTransactionParams = serde_json::from_value(raw)
                .map_err(|e| ApiError::InvalidInput(format!("Invalid transaction parameter: {}", e)))?;
            let tx = request.into_transaction()?;
            let hash = tx.hash.clone();

            node.blockchain.write().await.add_transaction(tx)?;
            node.note_transaction_submitted().await;
            info!(tx_hash = %hash, "Transaction accepted over rpc");
            Ok(json!({ "hash": hash, "status": "pending" }))
        }
        "topay_mine" => {
            let miner = param_address(params, 0, "minerAddress")?;
            let block = node.mine_once(&miner).await?;
            Ok(serde_json::to_value(block).map_err(ChainError::from)?)
        }
        "topay_startAutoMining" => {
            let miner = param_address(params, 0, "minerAddress")?;
            node.start_mining(miner.clone()).await?;
            Ok(json!({ "mining": true, "minerAddress": miner }))
        }
        "topay_stopAutoMining" => {
            node.stop_mining().await?;
            Ok(json!({ "mining": false, "blocksMined": node.blocks_mined() }))
        }
        "topay_getBalance" => {
            let address = param_address(params, 0, "address")?;
            let chain = node.blockchain.read().await;
            Ok(json!({
                "address": address,
                "balance": chain.get_balance(&address),
                "available": chain.available_balance(&address),
                "nonce": chain.next_nonce(&address),
            }))
        }
        "topay_getTransactionHistory" => {
            let address = param_address(params, 0, "address")?;
            let limit = param_usize(params, 1, DEFAULT_HISTORY_LIMIT)?.min(MAX_HISTORY_LIMIT);
            let offset = param_usize(params, 2, 0)?;
            let chain = node.blockchain.read().await;
            let transactions = chain.get_transaction_history(&address, limit, offset);
            Ok(json!({
                "address": address,
                "count": transactions.len(),
                "limit": limit,
                "offset": offset,
                "transactions": transactions,
            }))
        }
        other => Err(ApiError::NotFound(format!("Unknown method {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_address;

    #[test]
    fn test_send_params_sign_with_secret_key() {
        let keypair = KeyPair::generate().unwrap();
        let params: SendTransactionParams = serde_json::from_value(json!({
            "from": keypair.address(),
            "to": test_address("recipient"),
            "amount": 7,
            "memo": "lunch",
            "secretKey": hex::encode(keypair.secret_key.secret_bytes()),
        }))
        .unwrap();

        let tx = params.into_transaction().unwrap();
        assert_eq!(tx.data.as_deref(), Some("lunch"));
        assert!(tx.validate().is_ok());
    }

    #[test]
    fn test_send_params_accept_detached_signature() {
        let keypair = KeyPair::generate().unwrap();
        let signed = Transaction::new(keypair.address(), test_address("recipient"), 3)
            .with_nonce(0)
            .signed(&keypair)
            .unwrap();

        let params: SendTransactionParams = serde_json::from_value(json!({
            "from": keypair.address(),
            "to": test_address("recipient"),
            "amount": 3,
            "nonce": 0,
            "timestamp": signed.timestamp,
            "signature": signed.signature,
            "publicKey": signed.public_key,
        }))
        .unwrap();
        let rebuilt = params.into_transaction().unwrap();
        assert_eq!(rebuilt, signed);
    }

    #[test]
    fn test_send_params_require_a_signature() {
        let params: SendTransactionParams = serde_json::from_value(json!({
            "from": "a", "to": "b", "amount": 1
        }))
        .unwrap();
        assert!(matches!(
            params.into_transaction(),
            Err(ChainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_param_helpers() {
        let params = vec![json!("addr"), json!(10)];
        assert_eq!(param_str(&params, 0, "address").unwrap(), "addr");
        assert!(param_str(&params, 1, "address").is_err());
        assert_eq!(param_usize(&params, 1, 50).unwrap(), 10);
        assert_eq!(param_usize(&params, 2, 50).unwrap(), 50);

        assert!(param_address(&params, 0, "address").is_err());
        let valid = vec![json!(test_address("miner")), json!("m:x")];
        assert_eq!(param_address(&valid, 0, "minerAddress").unwrap(), test_address("miner"));
        assert!(param_address(&valid, 1, "minerAddress").is_err());
    }
}
