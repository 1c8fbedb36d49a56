use super::replication::ChainSnapshot;
use crate::error::ChainError;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Wire access to a validator, addressed by its resolved `.../code/{CODE}` URL.
#[async_trait]
pub trait ValidatorTransport: Send + Sync {
    async fn status(&self, url: &str, timeout: Duration) -> Result<(), ChainError>;

    async fn store_snapshot(&self, url: &str, snapshot: &ChainSnapshot, timeout: Duration) -> Result<(), ChainError>;

    async fn fetch_snapshot(&self, url: &str, timeout: Duration) -> Result<ChainSnapshot, ChainError>;
}

#[derive(Clone)]
pub struct HttpValidatorTransport {
    client: Client,
}

impl HttpValidatorTransport {
    pub fn new(default_timeout: Duration) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(default_timeout)
            .build()
            .map_err(|e| ChainError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(HttpValidatorTransport { client })
    }

    fn check(status: reqwest::StatusCode, what: &str) -> Result<(), ChainError> {
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Err(ChainError::NotFound(format!("{} returned 404", what)))
        } else {
            Err(ChainError::NetworkError(format!("{} returned {}", what, status)))
        }
    }
}

#[async_trait]
impl ValidatorTransport for HttpValidatorTransport {
    async fn status(&self, url: &str, timeout: Duration) -> Result<(), ChainError> {
        let resp = self
            .client
            .get(format!("{}/status", url))
            .timeout(timeout)
            .send()
            .await?;
        Self::check(resp.status(), "status")
    }

    async fn store_snapshot(&self, url: &str, snapshot: &ChainSnapshot, timeout: Duration) -> Result<(), ChainError> {
        let resp = self
            .client
            .post(format!("{}/snapshot", url))
            .timeout(timeout)
            .json(snapshot)
            .send()
            .await?;
        Self::check(resp.status(), "store snapshot")
    }

    async fn fetch_snapshot(&self, url: &str, timeout: Duration) -> Result<ChainSnapshot, ChainError> {
        let resp = self
            .client
            .get(format!("{}/snapshot", url))
            .timeout(timeout)
            .send()
            .await?;
        Self::check(resp.status(), "fetch snapshot")?;
        Ok(resp.json::<ChainSnapshot>().await?)
    }
}
