//! Policy engine client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vorion_engine::collaborators::PolicyEngine;
use vorion_engine::error::EngineResult;
use vorion_engine::evaluation::{GovernanceAction, PolicyMatch, PolicyOutcome};
use vorion_engine::intent::Intent;

use crate::client::{ConnectorClient, ConnectorConfig};

#[derive(Serialize)]
struct PolicyQuery<'a> {
    tenant_id: &'a str,
    entity_id: &'a str,
    intent_id: String,
    goal: &'a str,
    intent_type: Option<&'a str>,
    context: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct PolicyResponse {
    action: GovernanceAction,
    #[serde(default)]
    matches: Vec<PolicyMatchDto>,
}

#[derive(Deserialize)]
struct PolicyMatchDto {
    policy: String,
    count: u32,
}

/// Policy evaluation over `POST /v1/policies/evaluate`
pub struct HttpPolicyEngine {
    client: ConnectorClient,
}

impl HttpPolicyEngine {
    pub fn new(config: &ConnectorConfig) -> EngineResult<Self> {
        Ok(Self {
            client: ConnectorClient::new(config)?,
        })
    }
}

#[async_trait]
impl PolicyEngine for HttpPolicyEngine {
    async fn evaluate(&self, intent: &Intent) -> EngineResult<PolicyOutcome> {
        let response: PolicyResponse = self
            .client
            .post_json(
                "/v1/policies/evaluate",
                &PolicyQuery {
                    tenant_id: intent.tenant_id.as_str(),
                    entity_id: intent.entity_id.as_str(),
                    intent_id: intent.id.to_string(),
                    goal: &intent.goal,
                    intent_type: intent.intent_type.as_deref(),
                    context: &intent.context,
                },
            )
            .await?;
        Ok(PolicyOutcome {
            action: response.action,
            matches: response
                .matches
                .into_iter()
                .map(|m| PolicyMatch {
                    policy: m.policy,
                    count: m.count,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vorion_engine::intent::{EntityId, IntentId, IntentStatus, TenantId};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn intent() -> Intent {
        Intent {
            id: IntentId::new(),
            tenant_id: TenantId::new("t1"),
            entity_id: EntityId::new("e1"),
            goal: "export report".to_string(),
            intent_type: Some("data-export".to_string()),
            priority: 0,
            context: serde_json::json!({}),
            metadata: serde_json::json!({}),
            status: IntentStatus::Evaluating,
            trust_snapshot: Default::default(),
            current_trust: Default::default(),
            dedupe_fingerprint: "fp".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        }
    }

    #[tokio::test]
    async fn test_evaluate_with_matches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/policies/evaluate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "action": "limit",
                "matches": [{"policy": "pii-export", "count": 2}],
            })))
            .mount(&server)
            .await;

        let engine = HttpPolicyEngine::new(&ConnectorConfig::new(server.uri())).unwrap();
        let outcome = engine.evaluate(&intent()).await.unwrap();
        assert_eq!(outcome.action, GovernanceAction::Limit);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].policy, "pii-export");
    }
}
