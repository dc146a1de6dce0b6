//! Sandbox runtime client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use vorion_engine::collaborators::{ExecutionOutcome, ExecutionReport, ResourceLimits, Sandbox};
use vorion_engine::error::EngineResult;
use vorion_engine::intent::Intent;

use crate::client::{ConnectorClient, ConnectorConfig};

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    intent_id: String,
    tenant_id: &'a str,
    goal: &'a str,
    context: &'a serde_json::Value,
    limits: &'a ResourceLimits,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    outcome: ExecutionOutcome,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    duration_ms: u64,
    #[serde(default)]
    memory_peak_mb: Option<u64>,
}

/// Sandbox execution over `POST /v1/execute`.
///
/// The HTTP timeout covers the sandbox's own wall-clock limit plus a margin,
/// so a hung sandbox surfaces as a transport timeout rather than a stuck
/// worker.
pub struct HttpSandbox {
    client: ConnectorClient,
}

impl HttpSandbox {
    pub fn new(config: &ConnectorConfig, wall_clock_limit: Duration) -> EngineResult<Self> {
        let config = config
            .clone()
            .with_timeout(wall_clock_limit + Duration::from_secs(5));
        Ok(Self {
            client: ConnectorClient::new(&config)?,
        })
    }
}

#[async_trait]
impl Sandbox for HttpSandbox {
    async fn execute(
        &self,
        intent: &Intent,
        limits: &ResourceLimits,
    ) -> EngineResult<ExecutionReport> {
        let response: ExecuteResponse = self
            .client
            .post_json(
                "/v1/execute",
                &ExecuteRequest {
                    intent_id: intent.id.to_string(),
                    tenant_id: intent.tenant_id.as_str(),
                    goal: &intent.goal,
                    context: &intent.context,
                    limits,
                },
            )
            .await?;
        Ok(ExecutionReport {
            outcome: response.outcome,
            output: response.output,
            error: response.error,
            duration_ms: response.duration_ms,
            memory_peak_mb: response.memory_peak_mb,
        })
    }
}
