//! Webhook delivery tests against a local receiver

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vorion_engine::collaborators::Collaborators;
use vorion_engine::config::EngineConfig;
use vorion_engine::error::EngineError;
use vorion_engine::intent::{EntityId, IntentSubmission, TenantId, TrustSnapshot};
use vorion_engine::observability::TraceContext;
use vorion_engine::service::SubmitOptions;
use vorion_engine::webhooks::delivery::DeliveryStatus;
use vorion_engine::webhooks::dispatcher::RegisterWebhookRequest;
use vorion_engine::webhooks::verify_webhook_signature;
use vorion_engine::Engine;

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.queue_concurrency = 4;
    config.retry_backoff_ms = 20;
    config.webhook.retry_delay_ms = 20;
    config.webhook.retry_attempts = 2;
    config.dedupe.secret = Some("test-dedupe-secret".to_string());
    config
}

fn engine_with_trust(config: EngineConfig) -> Engine {
    let trust = Arc::new(vorion_engine::collaborators::StaticTrustProvider::default());
    trust.set(
        &EntityId::new("E1"),
        TrustSnapshot {
            score: 400,
            level: 4,
        },
    );
    let mut collaborators = Collaborators::statics();
    collaborators.trust = trust;
    Engine::builder()
        .with_config(config)
        .with_collaborators(collaborators)
        .build()
        .unwrap()
}

fn register_request(url: String, events: Vec<&str>) -> RegisterWebhookRequest {
    RegisterWebhookRequest {
        url,
        secret: None,
        enabled: true,
        events: events.into_iter().map(String::from).collect(),
        retry_attempts: None,
        retry_delay_ms: None,
    }
}

async fn wait_for_requests(server: &MockServer, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let received = server.received_requests().await.unwrap_or_default();
        if received.len() >= count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {} webhook requests (got {})",
            count,
            received.len()
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_pipeline_emits_signed_webhooks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let engine = engine_with_trust(test_config());
    engine.start();
    let tenant = TenantId::new("T1");

    let registered = engine
        .register_webhook(
            &tenant,
            register_request(
                format!("{}/hooks", server.uri()),
                vec!["intent.approved", "intent.completed"],
            ),
        )
        .await
        .unwrap();

    engine
        .submit(&tenant, IntentSubmission::new("E1", "g"), SubmitOptions::default())
        .await
        .unwrap();

    // One intent.approved and one intent.completed delivery
    wait_for_requests(&server, 2).await;
    let requests = server.received_requests().await.unwrap();

    let mut seen_events = Vec::new();
    for request in &requests {
        let headers = &request.headers;
        let event = headers.get("X-Webhook-Event").unwrap().to_str().unwrap();
        seen_events.push(event.to_string());

        assert!(headers.contains_key("X-Webhook-Delivery"));
        assert!(headers.contains_key("traceparent"));
        assert_eq!(
            headers.get("user-agent").unwrap().to_str().unwrap(),
            "Vorion-Webhook/1.0"
        );

        let timestamp: i64 = headers
            .get("X-Vorion-Timestamp")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let signature = headers
            .get("X-Vorion-Signature")
            .unwrap()
            .to_str()
            .unwrap();
        let body = String::from_utf8(request.body.clone()).unwrap();
        assert!(
            verify_webhook_signature(
                &body,
                signature,
                &registered.secret,
                timestamp,
                300,
                chrono::Utc::now().timestamp(),
            ),
            "signature must verify with the registration secret"
        );
    }
    seen_events.sort();
    assert_eq!(seen_events, vec!["intent.approved", "intent.completed"]);

    engine.shutdown(Some(Duration::from_secs(5))).await;
}

#[tokio::test]
async fn test_failing_endpoint_records_failure_and_opens_breaker() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.webhook.circuit_failure_threshold = 2;
    let engine = engine_with_trust(config);
    let tenant = TenantId::new("T1");

    let registered = engine
        .register_webhook(
            &tenant,
            register_request(format!("{}/hooks", server.uri()), vec!["intent.test"]),
        )
        .await
        .unwrap();

    // Two dispatches exhaust their budgets and trip the breaker
    for _ in 0..2 {
        engine
            .core()
            .webhooks
            .dispatch(&tenant, "intent.test", json!({"n": 1}), &TraceContext::new_root())
            .await
            .unwrap();
    }

    let history = engine
        .webhook_delivery_history(&tenant, &registered.id, 0, 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    for delivery in &history {
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.attempts, 2);
        assert_eq!(delivery.response_status, Some(500));
    }

    let breaker = engine
        .webhook_circuit_status(&tenant, &registered.id)
        .await
        .unwrap();
    assert_eq!(
        breaker.state,
        vorion_engine::resilience::circuit_breaker::CircuitState::Open
    );

    // With the breaker open the next delivery is skipped without an attempt
    let before = server.received_requests().await.unwrap().len();
    engine
        .core()
        .webhooks
        .dispatch(&tenant, "intent.test", json!({"n": 2}), &TraceContext::new_root())
        .await
        .unwrap();
    let history = engine
        .webhook_delivery_history(&tenant, &registered.id, 0, 10)
        .await
        .unwrap();
    let skipped = history
        .iter()
        .find(|d| d.skipped_by_circuit_breaker)
        .expect("a skipped delivery");
    assert_eq!(skipped.status, DeliveryStatus::Failed);
    assert_eq!(
        server.received_requests().await.unwrap().len(),
        before,
        "no request may reach the endpoint while the breaker is open"
    );
}

#[tokio::test]
async fn test_replay_failed_delivery_after_recovery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let engine = engine_with_trust(test_config());
    let tenant = TenantId::new("T1");
    let registered = engine
        .register_webhook(
            &tenant,
            register_request(format!("{}/hooks", server.uri()), vec!["intent.test"]),
        )
        .await
        .unwrap();

    engine
        .core()
        .webhooks
        .dispatch(&tenant, "intent.test", json!({}), &TraceContext::new_root())
        .await
        .unwrap();

    let history = engine
        .webhook_delivery_history(&tenant, &registered.id, 0, 10)
        .await
        .unwrap();
    let failed = &history[0];
    assert_eq!(failed.status, DeliveryStatus::Failed);

    // Only failed deliveries may be replayed
    engine
        .replay_webhook_delivery(&tenant, &failed.id)
        .await
        .unwrap();
    let replayed = engine
        .replay_webhook_delivery(&tenant, &failed.id)
        .await;
    assert!(matches!(replayed, Err(EngineError::Conflict(_))));

    let processed = engine.process_pending_webhook_retries(10).await.unwrap();
    assert_eq!(processed, 1);

    let history = engine
        .webhook_delivery_history(&tenant, &registered.id, 0, 10)
        .await
        .unwrap();
    assert_eq!(history[0].status, DeliveryStatus::Delivered);
    assert!(history[0].delivered_at.is_some());
}

#[tokio::test]
async fn test_registration_rejects_ssrf_targets() {
    let engine = engine_with_trust(test_config());
    let tenant = TenantId::new("T1");

    for url in [
        "https://169.254.169.254/latest/meta-data",
        "https://kubernetes.default/api",
        "https://internal-db.internal/hook",
        "https://10.0.0.5/hook",
        "https://hooks.example.com:6379/hook",
        "ftp://hooks.example.com/hook",
    ] {
        let error = engine
            .register_webhook(&tenant, register_request(url.to_string(), vec!["*"]))
            .await
            .unwrap_err();
        assert!(
            matches!(error, EngineError::Validation(_)),
            "{} must be rejected",
            url
        );
    }
}

#[tokio::test]
async fn test_unregister_and_event_filtering() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let engine = engine_with_trust(test_config());
    let tenant = TenantId::new("T1");
    let registered = engine
        .register_webhook(
            &tenant,
            register_request(format!("{}/hooks", server.uri()), vec!["intent.approved"]),
        )
        .await
        .unwrap();

    // A non-subscribed event creates no deliveries
    engine
        .core()
        .webhooks
        .dispatch(&tenant, "intent.completed", json!({}), &TraceContext::new_root())
        .await
        .unwrap();
    assert!(server.received_requests().await.unwrap().is_empty());

    assert!(engine.unregister_webhook(&tenant, &registered.id).await.unwrap());
    assert!(engine.list_webhooks(&tenant).await.unwrap().is_empty());

    // After unregistration even subscribed events go nowhere
    engine
        .core()
        .webhooks
        .dispatch(&tenant, "intent.approved", json!({}), &TraceContext::new_root())
        .await
        .unwrap();
    assert!(server.received_requests().await.unwrap().is_empty());
}
