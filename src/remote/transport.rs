use crate::error::ChainError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// Wire access to a storage device. Tests substitute in-process doubles.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Probes `{url}/health`.
    async fn health(&self, url: &str, timeout: Duration) -> Result<(), ChainError>;

    /// Sends `operation` with `payload` and returns the device's JSON reply.
    async fn call(&self, url: &str, operation: &str, payload: &Value, timeout: Duration) -> Result<Value, ChainError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(default_timeout: Duration) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(default_timeout)
            .build()
            .map_err(|e| ChainError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(HttpTransport { client })
    }
}

#[async_trait]
impl DeviceTransport for HttpTransport {
    async fn health(&self, url: &str, timeout: Duration) -> Result<(), ChainError> {
        let resp = self
            .client
            .get(format!("{}/health", url))
            .timeout(timeout)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ChainError::NetworkError(format!("health check returned {}", status)))
        }
    }

    async fn call(&self, url: &str, operation: &str, payload: &Value, timeout: Duration) -> Result<Value, ChainError> {
        let resp = self
            .client
            .post(format!("{}/api/storage/{}", url, operation))
            .timeout(timeout)
            .json(payload)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(resp.json::<Value>().await?)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(ChainError::NetworkError(format!(
                "{} failed with {}: {}",
                operation, status, body
            )))
        }
    }
}
