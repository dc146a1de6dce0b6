//! Consent registry client

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Deserialize;

use vorion_engine::collaborators::ConsentRegistry;
use vorion_engine::error::EngineResult;
use vorion_engine::intent::{EntityId, TenantId};

use crate::client::{ConnectorClient, ConnectorConfig};

/// Characters that must not appear raw inside a path segment. Tenant,
/// entity, and consent-type values are caller-supplied strings with no
/// charset guarantee, so each segment is encoded before interpolation.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

fn segment(raw: &str) -> String {
    utf8_percent_encode(raw, PATH_SEGMENT).to_string()
}

#[derive(Deserialize)]
struct ConsentResponse {
    granted: bool,
}

/// Consent lookups over `GET /v1/consents/{tenant}/{entity}/{type}`
pub struct HttpConsentRegistry {
    client: ConnectorClient,
}

impl HttpConsentRegistry {
    pub fn new(config: &ConnectorConfig) -> EngineResult<Self> {
        Ok(Self {
            client: ConnectorClient::new(config)?,
        })
    }
}

#[async_trait]
impl ConsentRegistry for HttpConsentRegistry {
    async fn has_consent(
        &self,
        tenant: &TenantId,
        entity: &EntityId,
        consent_type: &str,
    ) -> EngineResult<bool> {
        let response: ConsentResponse = self
            .client
            .get_json(&format!(
                "/v1/consents/{}/{}/{}",
                segment(tenant.as_str()),
                segment(entity.as_str()),
                segment(consent_type)
            ))
            .await?;
        Ok(response.granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_has_consent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/consents/t1/e1/data_processing"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"granted": true})),
            )
            .mount(&server)
            .await;

        let registry = HttpConsentRegistry::new(&ConnectorConfig::new(server.uri())).unwrap();
        assert!(registry
            .has_consent(&TenantId::new("t1"), &EntityId::new("e1"), "data_processing")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_segments_are_percent_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"granted": false})),
            )
            .mount(&server)
            .await;

        let registry = HttpConsentRegistry::new(&ConnectorConfig::new(server.uri())).unwrap();
        registry
            .has_consent(
                &TenantId::new("t/1"),
                &EntityId::new("e?1"),
                "data processing#v2",
            )
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        // Reserved characters never split or extend the path
        assert_eq!(
            requests[0].url.path(),
            "/v1/consents/t%2F1/e%3F1/data%20processing%23v2"
        );
        assert!(requests[0].url.query().is_none());
    }

    #[test]
    fn test_segment_round_trips_plain_values() {
        assert_eq!(segment("data_processing"), "data_processing");
        assert_eq!(segment("t-1.prod"), "t-1.prod");
        assert_eq!(segment("a/b"), "a%2Fb");
        assert_eq!(segment("50%"), "50%25");
    }
}
