//! End-to-end pipeline tests against in-process stores and static
//! collaborators

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vorion_engine::collaborators::{Collaborators, StaticTrustProvider};
use vorion_engine::config::{CircuitBreakerOverride, EngineConfig, RateLimit};
use vorion_engine::error::{EngineError, EngineResult};
use vorion_engine::evaluation::{Evaluation, GovernanceAction, RuleOutcome};
use vorion_engine::intent::{
    EntityId, Intent, IntentId, IntentStatus, IntentSubmission, TenantId, TrustSnapshot,
};
use vorion_engine::queue::Stage;
use vorion_engine::resilience::circuit_breaker::CircuitState;
use vorion_engine::service::SubmitOptions;
use vorion_engine::Engine;

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.queue_concurrency = 4;
    config.max_retries = 3;
    config.retry_backoff_ms = 20;
    config.job_timeout_ms = 5000;
    config.dedupe.secret = Some("test-dedupe-secret".to_string());
    config
}

fn trusted_collaborators() -> (Collaborators, Arc<StaticTrustProvider>) {
    let trust = Arc::new(StaticTrustProvider::default());
    trust.set(
        &EntityId::new("E1"),
        TrustSnapshot {
            score: 400,
            level: 4,
        },
    );
    let mut collaborators = Collaborators::statics();
    collaborators.trust = trust.clone();
    (collaborators, trust)
}

async fn wait_for_status(
    engine: &Engine,
    id: &IntentId,
    tenant: &TenantId,
    expected: IntentStatus,
) -> Intent {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(intent) = engine.get(id, tenant).await.unwrap() {
            if intent.status == expected {
                return intent;
            }
            assert!(
                !(intent.status.is_terminal() && intent.status != expected),
                "intent reached terminal {} while waiting for {}",
                intent.status,
                expected
            );
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            expected
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_happy_path_to_completed() {
    let (collaborators, _trust) = trusted_collaborators();
    let engine = Engine::builder()
        .with_config(test_config())
        .with_collaborators(collaborators)
        .build()
        .unwrap();
    engine.start();

    let tenant = TenantId::new("T1");
    let mut submission = IntentSubmission::new("E1", "g");
    submission.intent_type = Some("default".to_string());

    let intent = engine
        .submit(&tenant, submission, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(intent.status, IntentStatus::Pending);

    let done = wait_for_status(&engine, &intent.id, &tenant, IntentStatus::Completed).await;
    assert_eq!(done.status, IntentStatus::Completed);

    // The event chain records the full status path and verifies end-to-end
    let report = engine.verify_event_chain(&intent.id).await.unwrap();
    assert!(report.valid, "chain invalid: {:?}", report);
    assert!(report.events_verified >= 5);

    let history = engine
        .get_with_events(&intent.id, &tenant)
        .await
        .unwrap()
        .unwrap();
    let event_types: Vec<&str> = history
        .events
        .iter()
        .map(|e| e.event_type.as_str())
        .collect();
    assert_eq!(
        event_types,
        vec![
            "intent.submitted",
            "intent.evaluating",
            "intent.approved",
            "intent.executing",
            "intent.executed.completed",
        ]
    );

    let kinds: Vec<&str> = history
        .evaluations
        .iter()
        .map(|e| e.evaluation.kind())
        .collect();
    assert!(kinds.contains(&"trust-snapshot"));
    assert!(kinds.contains(&"basis"));
    assert!(kinds.contains(&"trust-gate"));
    assert!(kinds.contains(&"decision"));

    // No dead letters anywhere
    assert!(engine.core().dlq.is_empty());

    engine.shutdown(Some(Duration::from_secs(5))).await;
}

#[tokio::test]
async fn test_trust_denial_is_synchronous() {
    let (collaborators, trust) = trusted_collaborators();
    trust.set(&EntityId::new("E0"), TrustSnapshot { score: 0, level: 0 });
    let engine = Engine::builder()
        .with_config(test_config())
        .with_collaborators(collaborators)
        .build()
        .unwrap();

    let tenant = TenantId::new("T1");
    let mut submission = IntentSubmission::new("E0", "dangerous thing");
    submission.intent_type = Some("high-risk".to_string());

    let error = engine
        .submit(&tenant, submission, SubmitOptions::default())
        .await
        .unwrap_err();
    match error {
        EngineError::TrustInsufficient { required, actual } => {
            assert_eq!(required, 3);
            assert_eq!(actual, 0);
        }
        other => panic!("expected TrustInsufficient, got {:?}", other),
    }

    // No intent row was persisted
    let page = engine
        .list(vorion_engine::store::IntentFilter {
            tenant_id: tenant.clone(),
            entity_id: None,
            status: None,
            include_deleted: true,
            limit: 100,
            offset: 0,
        })
        .await
        .unwrap();
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn test_concurrent_identical_submissions_dedupe() {
    let (collaborators, _trust) = trusted_collaborators();
    let engine = Engine::builder()
        .with_config(test_config())
        .with_collaborators(collaborators)
        .build()
        .unwrap();
    // Workers intentionally not started: both rows stay pending

    let tenant = TenantId::new("T1");
    let mut submission = IntentSubmission::new("E1", "create the report");
    submission.idempotency_key = Some("idem-1".to_string());

    let (a, b) = tokio::join!(
        engine.submit(&tenant, submission.clone(), SubmitOptions::default()),
        engine.submit(&tenant, submission.clone(), SubmitOptions::default()),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.id, b.id, "both submissions must resolve to one intent");

    let page = engine
        .list(vorion_engine::store::IntentFilter {
            tenant_id: tenant.clone(),
            entity_id: None,
            status: None,
            include_deleted: true,
            limit: 100,
            offset: 0,
        })
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1, "exactly one row may exist");
}

#[tokio::test]
async fn test_policy_circuit_opens_and_degrades() {
    let (mut collaborators, _trust) = trusted_collaborators();
    collaborators.policy = Arc::new(
        vorion_engine::collaborators::StaticPolicyEngine::failing(),
    );

    let mut config = test_config();
    config.circuit_breakers.overrides.insert(
        "policyEngine".to_string(),
        CircuitBreakerOverride {
            failure_threshold: Some(2),
            reset_timeout_ms: Some(60_000),
        },
    );

    let engine = Engine::builder()
        .with_config(config)
        .with_collaborators(collaborators)
        .build()
        .unwrap();
    engine.start();

    let tenant = TenantId::new("T1");
    let mut last = None;
    for i in 0..4 {
        let submission = IntentSubmission::new("E1", format!("goal {}", i));
        let intent = engine
            .submit(&tenant, submission, SubmitOptions::default())
            .await
            .unwrap();
        let done = wait_for_status(&engine, &intent.id, &tenant, IntentStatus::Completed).await;
        last = Some(done);
    }

    // After the threshold, the breaker is open and evaluation is rules-only
    let status = engine.breaker_status("policyEngine").await.unwrap();
    assert_eq!(status.state, CircuitState::Open);

    let history = engine
        .get_with_events(&last.unwrap().id, &tenant)
        .await
        .unwrap()
        .unwrap();
    let basis = history
        .evaluations
        .iter()
        .find_map(|r| match &r.evaluation {
            Evaluation::Basis {
                policy, degraded, ..
            } => Some((policy.clone(), *degraded)),
            _ => None,
        })
        .expect("basis evaluation recorded");
    assert!(basis.1, "evaluation must be degraded");
    assert!(basis.0.is_none(), "no policy outcome while the circuit is open");

    engine.shutdown(Some(Duration::from_secs(5))).await;
}

#[tokio::test]
async fn test_breaker_half_open_after_reset_timeout() {
    let (collaborators, _trust) = trusted_collaborators();
    let mut config = test_config();
    config.circuit_breakers.overrides.insert(
        "policyEngine".to_string(),
        CircuitBreakerOverride {
            failure_threshold: Some(1),
            reset_timeout_ms: Some(100),
        },
    );
    let engine = Engine::builder()
        .with_config(config)
        .with_collaborators(collaborators)
        .build()
        .unwrap();

    let breaker = engine.core().breakers.get("policyEngine");
    let _: EngineResult<()> = breaker
        .execute(|| async { Err(EngineError::Internal("down".to_string())) })
        .await;
    assert!(breaker.is_open().await.unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;
    // The next call is admitted as a half-open probe and closes on success
    breaker.execute(|| async { Ok(()) }).await.unwrap();
    assert_eq!(
        breaker.status().await.unwrap().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_rate_limit_cap() {
    let (collaborators, _trust) = trusted_collaborators();
    let mut config = test_config();
    config.rate_limits.default = RateLimit {
        limit: 3,
        window_seconds: 60,
    };

    let engine = Engine::builder()
        .with_config(config)
        .with_collaborators(collaborators)
        .build()
        .unwrap();

    let tenant = TenantId::new("T1");
    let mut successes = 0;
    let mut denials = Vec::new();
    for i in 0..5 {
        let submission = IntentSubmission::new("E1", format!("goal {}", i));
        match engine
            .submit(&tenant, submission, SubmitOptions::default())
            .await
        {
            Ok(_) => successes += 1,
            Err(error) => denials.push(error),
        }
    }

    assert_eq!(successes, 3);
    assert_eq!(denials.len(), 2);
    for error in denials {
        match error {
            EngineError::RateLimited { retry_after_s, .. } => {
                assert!(retry_after_s <= 60);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }
}

/// Rule engine that fails while its flag is set
struct FlakyRuleEngine {
    failing: AtomicBool,
}

#[async_trait]
impl vorion_engine::collaborators::RuleEngine for FlakyRuleEngine {
    async fn evaluate(&self, _intent: &Intent) -> EngineResult<RuleOutcome> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Store("rule backend unavailable".to_string()));
        }
        Ok(RuleOutcome {
            action: GovernanceAction::Allow,
            matched_rules: Vec::new(),
        })
    }
}

#[tokio::test]
async fn test_dlq_exhaustion_and_replay() {
    let (mut collaborators, _trust) = trusted_collaborators();
    let rules = Arc::new(FlakyRuleEngine {
        failing: AtomicBool::new(true),
    });
    collaborators.rules = rules.clone();

    let engine = Engine::builder()
        .with_config(test_config())
        .with_collaborators(collaborators)
        .build()
        .unwrap();
    engine.start();

    let tenant = TenantId::new("T1");
    let intent = engine
        .submit(&tenant, IntentSubmission::new("E1", "g"), SubmitOptions::default())
        .await
        .unwrap();

    // The evaluate job exhausts its retries and dead-letters
    let failed = wait_for_status(&engine, &intent.id, &tenant, IntentStatus::Failed).await;
    assert_eq!(failed.status, IntentStatus::Failed);

    let page = engine.list_dlq(Some(Stage::Evaluate), 0, 10);
    assert_eq!(page.total, 1);
    let record = &page.items[0];
    assert_eq!(record.attempts_made, 3);
    assert_eq!(record.intent_id, intent.id);

    // Remove the fault and replay
    rules.failing.store(false, Ordering::SeqCst);
    engine.retry_dlq(&record.id).await.unwrap();

    let done = wait_for_status(&engine, &intent.id, &tenant, IntentStatus::Completed).await;
    assert_eq!(done.status, IntentStatus::Completed);
    assert!(engine.core().dlq.is_empty());

    engine.shutdown(Some(Duration::from_secs(5))).await;
}

#[tokio::test]
async fn test_escalation_resolved_by_operator() {
    let (mut collaborators, _trust) = trusted_collaborators();
    collaborators.rules = Arc::new(
        vorion_engine::collaborators::StaticRuleEngine::with_action(GovernanceAction::Escalate),
    );
    let engine = Engine::builder()
        .with_config(test_config())
        .with_collaborators(collaborators)
        .build()
        .unwrap();
    engine.start();

    let tenant = TenantId::new("T1");
    let intent = engine
        .submit(&tenant, IntentSubmission::new("E1", "g"), SubmitOptions::default())
        .await
        .unwrap();

    let escalated =
        wait_for_status(&engine, &intent.id, &tenant, IntentStatus::Escalated).await;
    assert_eq!(escalated.status, IntentStatus::Escalated);

    // Resolving without permission is rejected
    let denied = engine
        .update_status(
            &intent.id,
            &tenant,
            IntentStatus::Approved,
            Some(IntentStatus::Escalated),
            vorion_engine::intent::TransitionGuards::default(),
        )
        .await;
    assert!(matches!(denied, Err(EngineError::Validation(_))));

    // An operator with permission approves; execution follows
    engine
        .update_status(
            &intent.id,
            &tenant,
            IntentStatus::Approved,
            Some(IntentStatus::Escalated),
            vorion_engine::intent::TransitionGuards {
                has_permission: true,
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

    let done = wait_for_status(&engine, &intent.id, &tenant, IntentStatus::Completed).await;
    assert_eq!(done.status, IntentStatus::Completed);

    let report = engine.verify_event_chain(&intent.id).await.unwrap();
    assert!(report.valid);

    engine.shutdown(Some(Duration::from_secs(5))).await;
}

#[tokio::test]
async fn test_cancel_before_processing() {
    let (collaborators, _trust) = trusted_collaborators();
    let engine = Engine::builder()
        .with_config(test_config())
        .with_collaborators(collaborators)
        .build()
        .unwrap();
    // Workers not started: the intent stays pending

    let tenant = TenantId::new("T1");
    let intent = engine
        .submit(&tenant, IntentSubmission::new("E1", "g"), SubmitOptions::default())
        .await
        .unwrap();

    let cancelled = engine
        .cancel(&intent.id, &tenant, "operator requested", Some("ops"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.status, IntentStatus::Cancelled);
    assert_eq!(
        cancelled.cancellation_reason.as_deref(),
        Some("operator requested")
    );

    // Cancelling again is an invalid transition
    assert!(matches!(
        engine.cancel(&intent.id, &tenant, "again", None).await,
        Err(EngineError::InvalidStateTransition { .. })
    ));

    // The chain still verifies after cancellation
    let report = engine.verify_event_chain(&intent.id).await.unwrap();
    assert!(report.valid);
}

#[tokio::test]
async fn test_soft_delete_keeps_chain_and_frees_fingerprint() {
    let (collaborators, _trust) = trusted_collaborators();
    let engine = Engine::builder()
        .with_config(test_config())
        .with_collaborators(collaborators)
        .build()
        .unwrap();

    let tenant = TenantId::new("T1");
    let mut submission = IntentSubmission::new("E1", "g");
    submission.context = serde_json::json!({"customer": "acme"});
    let intent = engine
        .submit(&tenant, submission.clone(), SubmitOptions::default())
        .await
        .unwrap();

    let deleted = engine
        .delete(&intent.id, &tenant)
        .await
        .unwrap()
        .unwrap();
    assert!(deleted.is_deleted());
    assert_eq!(deleted.context, serde_json::json!({}));

    let report = engine.verify_event_chain(&intent.id).await.unwrap();
    assert!(report.valid);
    assert_eq!(report.events_verified, 2); // submitted + deleted

    // The fingerprint is free again: an identical submission creates a new row
    let second = engine
        .submit(&tenant, submission, SubmitOptions::default())
        .await
        .unwrap();
    assert_ne!(second.id, intent.id);
}

#[tokio::test]
async fn test_tenant_in_flight_cap() {
    let (collaborators, _trust) = trusted_collaborators();
    let mut config = test_config();
    config
        .concurrency
        .tenant_max_in_flight
        .insert("T1".to_string(), 2);

    let engine = Engine::builder()
        .with_config(config)
        .with_collaborators(collaborators)
        .build()
        .unwrap();
    // Workers not started, so submitted intents stay in flight

    let tenant = TenantId::new("T1");
    for i in 0..2 {
        engine
            .submit(
                &tenant,
                IntentSubmission::new("E1", format!("goal {}", i)),
                SubmitOptions::default(),
            )
            .await
            .unwrap();
    }

    let error = engine
        .submit(
            &tenant,
            IntentSubmission::new("E1", "one too many"),
            SubmitOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::RateLimited { .. }));
    assert_eq!(error.kind(), "INTENT_RATE_LIMIT");
}

#[tokio::test]
async fn test_shutdown_rejects_new_submissions() {
    let (collaborators, _trust) = trusted_collaborators();
    let engine = Engine::builder()
        .with_config(test_config())
        .with_collaborators(collaborators)
        .build()
        .unwrap();
    engine.start();
    engine.shutdown(Some(Duration::from_secs(5))).await;

    let error = engine
        .submit(
            &TenantId::new("T1"),
            IntentSubmission::new("E1", "late"),
            SubmitOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::Conflict(_)));
}
