//! Trust engine client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vorion_engine::collaborators::TrustProvider;
use vorion_engine::error::EngineResult;
use vorion_engine::intent::{EntityId, TenantId, TrustSnapshot};

use crate::client::{ConnectorClient, ConnectorConfig};

#[derive(Serialize)]
struct TrustQuery<'a> {
    tenant_id: &'a str,
    entity_id: &'a str,
}

#[derive(Deserialize)]
struct TrustResponse {
    score: i64,
    level: u8,
}

/// Trust scores over `POST /v1/trust/score`
pub struct HttpTrustProvider {
    client: ConnectorClient,
}

impl HttpTrustProvider {
    pub fn new(config: &ConnectorConfig) -> EngineResult<Self> {
        Ok(Self {
            client: ConnectorClient::new(config)?,
        })
    }
}

#[async_trait]
impl TrustProvider for HttpTrustProvider {
    async fn current_trust(
        &self,
        tenant: &TenantId,
        entity: &EntityId,
    ) -> EngineResult<TrustSnapshot> {
        let response: TrustResponse = self
            .client
            .post_json(
                "/v1/trust/score",
                &TrustQuery {
                    tenant_id: tenant.as_str(),
                    entity_id: entity.as_str(),
                },
            )
            .await?;
        Ok(TrustSnapshot {
            score: response.score,
            level: response.level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_current_trust() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/trust/score"))
            .and(body_json(serde_json::json!({
                "tenant_id": "t1",
                "entity_id": "e1",
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"score": 412, "level": 4})),
            )
            .mount(&server)
            .await;

        let provider = HttpTrustProvider::new(&ConnectorConfig::new(server.uri())).unwrap();
        let trust = provider
            .current_trust(&TenantId::new("t1"), &EntityId::new("e1"))
            .await
            .unwrap();
        assert_eq!(trust.score, 412);
        assert_eq!(trust.level, 4);
    }

    #[tokio::test]
    async fn test_server_error_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/trust/score"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = HttpTrustProvider::new(&ConnectorConfig::new(server.uri())).unwrap();
        assert!(provider
            .current_trust(&TenantId::new("t1"), &EntityId::new("e1"))
            .await
            .is_err());
    }
}
