//! Shared HTTP client scaffolding for collaborator connectors

use std::time::Duration;

use vorion_engine::error::{EngineError, EngineResult};

/// Connector endpoint configuration
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Service base URL, e.g. `https://trust.internal.example.com`
    pub base_url: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl ConnectorConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Thin wrapper over reqwest shared by every connector
#[derive(Clone)]
pub struct ConnectorClient {
    client: reqwest::Client,
    base_url: String,
}

impl ConnectorClient {
    pub fn new(config: &ConnectorConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("vorion-connectors/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Internal(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// POST a JSON body to a path and decode a JSON response
    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> EngineResult<R>
    where
        B: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::StatementTimeout(format!("{} timed out", url))
                } else {
                    EngineError::Store(format!("request to {} failed: {}", url, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Store(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::Store(format!("invalid response from {}: {}", url, e)))
    }

    /// GET a path and decode a JSON response
    pub async fn get_json<R>(&self, path: &str) -> EngineResult<R>
    where
        R: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::StatementTimeout(format!("{} timed out", url))
            } else {
                EngineError::Store(format!("request to {} failed: {}", url, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Store(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::Store(format!("invalid response from {}: {}", url, e)))
    }
}
