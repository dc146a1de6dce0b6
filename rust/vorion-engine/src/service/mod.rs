//! Service-facing operations
//!
//! The synchronous intake sequence plus the read, admin, and lifecycle
//! operations exposed to the HTTP/CLI surface (which lives outside this
//! crate).

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;
use vorion_lockchain::ChainReport;

use crate::dedupe::DedupeOutcome;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::evaluation::{Evaluation, EvaluationRecord};
use crate::eventlog::IntentEvent;
use crate::intent::{
    Intent, IntentId, IntentStatus, IntentSubmission, TenantId, TransitionGuards,
};
use crate::observability::TraceContext;
use crate::queue::{Stage, StageJob};
use crate::redact;
use crate::resilience::circuit_breaker::BreakerStatus;
use crate::resilience::dlq::DlqPage;
use crate::resilience::rate_limit::RateLimitDecision;
use crate::store::{IntentFilter, IntentPage};
use crate::webhooks::dispatcher::{RegisterWebhookRequest, RegisteredWebhook};
use crate::webhooks::WebhookSubscription;

/// Hard cap on listing page size
const MAX_LIST_LIMIT: usize = 1000;
/// Verification paging defaults
const VERIFY_BATCH: usize = 100;
const VERIFY_MAX_EVENTS: u64 = 10_000;

/// Per-call intake options
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    pub bypass_consent: bool,
    pub bypass_trust_gate: bool,
}

/// Bulk submission options
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkOptions {
    /// Abort at the first failure instead of continuing
    pub stop_on_error: bool,
}

/// One failed entry of a bulk submission
#[derive(Debug)]
pub struct BulkFailure {
    pub index: usize,
    pub input: IntentSubmission,
    pub error_kind: &'static str,
    pub error: String,
}

/// Bulk submission result
#[derive(Debug, Default)]
pub struct BulkResult {
    pub successful: Vec<Intent>,
    pub failed: Vec<BulkFailure>,
}

impl BulkResult {
    pub fn stats(&self) -> (usize, usize) {
        (self.successful.len(), self.failed.len())
    }
}

/// Intent with its full audit history
#[derive(Debug)]
pub struct IntentWithHistory {
    pub intent: Intent,
    pub events: Vec<IntentEvent>,
    pub evaluations: Vec<EvaluationRecord>,
}

/// Per-stage health including dead-letter counts
#[derive(Debug, Clone, serde::Serialize)]
pub struct StageHealth {
    pub stage: &'static str,
    pub waiting: usize,
    pub active: usize,
    pub failed: u64,
    pub dlq_count: usize,
}

impl Engine {
    /// Submit an intent.
    ///
    /// Runs the synchronous intake sequence: rate limit, validation, consent
    /// check, trust gate, dedupe reservation, tenant concurrency cap, then
    /// persistence of the intent plus its first chained event, and finally
    /// the intake-stage enqueue.
    pub async fn submit(
        &self,
        tenant: &TenantId,
        submission: IntentSubmission,
        options: SubmitOptions,
    ) -> EngineResult<Intent> {
        let core = &self.core;
        if core.shutdown.signal().is_shutting_down() {
            return Err(EngineError::Conflict(
                "engine is shutting down".to_string(),
            ));
        }

        let decision = core
            .rate_limiter
            .check_and_consume(
                tenant,
                Some(&submission.entity_id),
                submission.intent_type.as_deref(),
            )
            .await?;
        if !decision.allowed {
            return Err(EngineError::RateLimited {
                scope: decision.blocked_scope.unwrap_or("tenant").to_string(),
                retry_after_s: decision.retry_after_s.unwrap_or(1),
            });
        }

        if submission.goal.trim().is_empty() {
            return Err(EngineError::Validation("goal must not be empty".to_string()));
        }
        redact::validate_bounds(&submission.context, &submission.metadata, &submission.goal)?;
        core.metrics
            .context_bytes
            .observe(redact::json_size(&submission.context) as f64);

        if !(core.config.intake.bypass_consent || options.bypass_consent) {
            let granted = core
                .collaborators
                .consent
                .has_consent(tenant, &submission.entity_id, "data_processing")
                .await?;
            if !granted {
                return Err(EngineError::ConsentRequired {
                    consent_type: "data_processing".to_string(),
                    reason: "consent absent or revoked".to_string(),
                });
            }
        }

        let trust = if core.config.intake.bypass_trust_gate || options.bypass_trust_gate {
            core.fetch_trust(tenant, &submission.entity_id).await.0
        } else {
            let (trust, _source) = core.fetch_trust(tenant, &submission.entity_id).await;
            let required = core
                .config
                .trust
                .required_level(submission.intent_type.as_deref());
            if trust.level < required {
                return Err(EngineError::TrustInsufficient {
                    required,
                    actual: trust.level,
                });
            }
            trust
        };

        let fingerprint = core.dedupe.fingerprint(tenant, &submission);
        let reservation = match core.dedupe.reserve(tenant, &fingerprint).await? {
            DedupeOutcome::New(reservation) => reservation,
            DedupeOutcome::Duplicate(existing) | DedupeOutcome::RaceResolved(existing) => {
                return Ok(existing)
            }
        };

        let max_in_flight = core.config.concurrency.max_in_flight(tenant.as_str());
        let active = match core.intents.count_active(tenant).await {
            Ok(active) => active,
            Err(error) => {
                reservation.abort().await?;
                return Err(error);
            }
        };
        if active >= max_in_flight {
            reservation.abort().await?;
            return Err(EngineError::RateLimited {
                scope: "tenant-concurrency".to_string(),
                retry_after_s: 1,
            });
        }

        let mut context = submission.context.clone();
        let mut metadata = submission.metadata.clone();
        redact::redact_paths(&mut context, &core.config.intake.sensitive_paths);
        redact::redact_paths(&mut metadata, &core.config.intake.sensitive_paths);
        if core.config.intake.encrypt_context {
            context = json!({ "__encrypted": core.cipher.encrypt(&context.to_string())? });
            metadata = json!({ "__encrypted": core.cipher.encrypt(&metadata.to_string())? });
        }

        let now = Utc::now();
        let intent = Intent {
            id: IntentId::new(),
            tenant_id: tenant.clone(),
            entity_id: submission.entity_id.clone(),
            goal: submission.goal.clone(),
            intent_type: submission.intent_type.clone(),
            priority: submission.priority,
            context,
            metadata,
            status: IntentStatus::Pending,
            trust_snapshot: trust,
            current_trust: trust,
            dedupe_fingerprint: fingerprint.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        };

        // Intent row and first chained event persist together; a failed
        // append removes the row again (the store transaction boundary)
        if let Err(error) = core.intents.insert_intent(&intent).await {
            reservation.abort().await?;
            if matches!(error, EngineError::Conflict(_)) {
                // Unique-constraint race lost: the winner's row is the result
                if let Some(existing) =
                    core.intents.find_by_fingerprint(tenant, &fingerprint).await?
                {
                    return Ok(existing);
                }
            }
            return Err(error);
        }
        if let Err(error) = core
            .eventlog
            .append(
                intent.id,
                "intent.submitted",
                json!({
                    "entity_id": submission.entity_id.as_str(),
                    "intent_type": submission.intent_type,
                    "priority": submission.priority,
                }),
            )
            .await
        {
            core.intents.remove_intent(&intent.id).await?;
            reservation.abort().await?;
            return Err(error);
        }
        reservation.commit().await?;

        core.metrics
            .intents_submitted
            .with_label_values(&[submission.intent_type.as_deref().unwrap_or("default")])
            .inc();
        core.metrics
            .intents_by_status
            .with_label_values(&["pending"])
            .inc();

        let trace = TraceContext::new_root();
        let job = StageJob::new(
            Stage::Intake,
            intent.id,
            tenant.clone(),
            json!({}),
            trace,
        );
        if let Err(error) = core.enqueue(job) {
            // The row stays; a reconciliation pass re-enqueues it
            tracing::error!(
                intent_id = %intent.id,
                error = %error,
                "intent persisted but intake enqueue failed"
            );
            core.metrics
                .jobs_processed
                .with_label_values(&["intake", "enqueue_failed"])
                .inc();
        }

        Ok(intent)
    }

    /// Submit a batch sequentially, continuing on error by default
    pub async fn submit_bulk(
        &self,
        tenant: &TenantId,
        submissions: Vec<IntentSubmission>,
        options: SubmitOptions,
        bulk: BulkOptions,
    ) -> EngineResult<BulkResult> {
        let mut result = BulkResult::default();
        for (index, submission) in submissions.into_iter().enumerate() {
            match self.submit(tenant, submission.clone(), options).await {
                Ok(intent) => result.successful.push(intent),
                Err(error) => {
                    result.failed.push(BulkFailure {
                        index,
                        input: submission,
                        error_kind: error.kind(),
                        error: error.user_message(),
                    });
                    if bulk.stop_on_error {
                        break;
                    }
                }
            }
        }
        Ok(result)
    }

    /// Fetch an intent
    pub async fn get(&self, id: &IntentId, tenant: &TenantId) -> EngineResult<Option<Intent>> {
        self.core.intents.get_intent(id, tenant).await
    }

    /// Fetch an intent with its events and evaluations
    pub async fn get_with_events(
        &self,
        id: &IntentId,
        tenant: &TenantId,
    ) -> EngineResult<Option<IntentWithHistory>> {
        let Some(intent) = self.core.intents.get_intent(id, tenant).await? else {
            return Ok(None);
        };

        let mut events = Vec::new();
        let mut offset = 0u64;
        loop {
            let batch = self.core.events.events_page(id, offset, VERIFY_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            offset += batch.len() as u64;
            events.extend(batch);
            if events.len() as u64 >= VERIFY_MAX_EVENTS {
                break;
            }
        }
        let evaluations = self.core.evaluations.evaluations_for(id).await?;
        Ok(Some(IntentWithHistory {
            intent,
            events,
            evaluations,
        }))
    }

    /// List intents with pagination
    pub async fn list(&self, mut filter: IntentFilter) -> EngineResult<IntentPage> {
        if filter.limit == 0 {
            filter.limit = 50;
        }
        filter.limit = filter.limit.min(MAX_LIST_LIMIT);
        self.core.intents.list_intents(&filter).await
    }

    /// Cancel an intent. Permitted only from `pending`, `evaluating`, or
    /// `escalated`.
    pub async fn cancel(
        &self,
        id: &IntentId,
        tenant: &TenantId,
        reason: &str,
        cancelled_by: Option<&str>,
    ) -> EngineResult<Option<Intent>> {
        let core = &self.core;
        let Some(mut intent) = core.intents.get_intent(id, tenant).await? else {
            return Ok(None);
        };
        if !matches!(
            intent.status,
            IntentStatus::Pending | IntentStatus::Evaluating | IntentStatus::Escalated
        ) {
            return Err(EngineError::InvalidStateTransition {
                from: intent.status.as_str().to_string(),
                to: "cancelled".to_string(),
            });
        }
        if reason.trim().is_empty() {
            return Err(EngineError::Validation(
                "cancellation requires a reason".to_string(),
            ));
        }

        intent.cancellation_reason = Some(reason.to_string());
        core.record_evaluation(
            intent.id,
            Evaluation::Cancelled {
                reason: reason.to_string(),
                cancelled_by: cancelled_by.map(String::from),
            },
        )
        .await?;
        core.transition_intent(
            &mut intent,
            IntentStatus::Cancelled,
            TransitionGuards {
                has_reason: true,
                ..Default::default()
            },
            json!({ "reason": reason, "cancelled_by": cancelled_by }),
        )
        .await?;
        Ok(Some(intent))
    }

    /// Soft-delete an intent: clears context and metadata, keeps the event
    /// chain.
    pub async fn delete(&self, id: &IntentId, tenant: &TenantId) -> EngineResult<Option<Intent>> {
        let core = &self.core;
        let Some(mut intent) = core.intents.get_intent(id, tenant).await? else {
            return Ok(None);
        };
        if intent.is_deleted() {
            return Ok(Some(intent));
        }

        intent.context = Value::Object(serde_json::Map::new());
        intent.metadata = Value::Object(serde_json::Map::new());
        intent.deleted_at = Some(Utc::now());
        intent.updated_at = Utc::now();
        core.intents.update_intent(&intent).await?;
        core.eventlog
            .append(intent.id, "intent.deleted", json!({}))
            .await?;
        Ok(Some(intent))
    }

    /// Administrative status update with optional expected-from check.
    ///
    /// Resolving an escalation behaves like a decision: approval emits the
    /// webhook and enqueues execution, denial emits its webhook.
    pub async fn update_status(
        &self,
        id: &IntentId,
        tenant: &TenantId,
        to: IntentStatus,
        from: Option<IntentStatus>,
        guards: TransitionGuards,
    ) -> EngineResult<Option<Intent>> {
        let core = &self.core;
        let Some(mut intent) = core.intents.get_intent(id, tenant).await? else {
            return Ok(None);
        };
        if let Some(expected) = from {
            if intent.status != expected {
                return Err(EngineError::Conflict(format!(
                    "intent is {} not {}",
                    intent.status, expected
                )));
            }
        }
        let was_escalated = intent.status == IntentStatus::Escalated;
        core.transition_intent(&mut intent, to, guards, json!({ "via": "update_status" }))
            .await?;

        if was_escalated {
            let trace = TraceContext::new_root();
            match to {
                IntentStatus::Approved => {
                    core.emit_intent_webhook(&intent, "intent.approved", &trace);
                    let limits = crate::collaborators::ResourceLimits::from(&core.config.cognigate);
                    let job = StageJob::new(
                        Stage::Execute,
                        intent.id,
                        intent.tenant_id.clone(),
                        json!({ "limits": limits }),
                        trace,
                    );
                    core.enqueue(job)?;
                }
                IntentStatus::Denied => {
                    core.emit_intent_webhook(&intent, "intent.denied", &trace);
                }
                _ => {}
            }
        }
        Ok(Some(intent))
    }

    /// Verify an intent's event chain (streamed in batches)
    pub async fn verify_event_chain(&self, id: &IntentId) -> EngineResult<ChainReport> {
        self.core
            .eventlog
            .verify(*id, VERIFY_BATCH, VERIFY_MAX_EVENTS)
            .await
    }

    /// Rate-limit status without consuming a slot
    pub async fn rate_limit_status(
        &self,
        tenant: &TenantId,
        intent_type: Option<&str>,
    ) -> EngineResult<RateLimitDecision> {
        self.core.rate_limiter.status(tenant, intent_type).await
    }

    // --- Queue and DLQ administration ---

    /// Per-stage queue health
    pub fn queue_health(&self) -> Vec<StageHealth> {
        Stage::all()
            .into_iter()
            .map(|stage| {
                let health = self.core.queues[&stage].health();
                StageHealth {
                    stage: health.stage,
                    waiting: health.waiting,
                    active: health.active,
                    failed: health.failed,
                    dlq_count: self.core.dlq.count_for(stage),
                }
            })
            .collect()
    }

    /// List dead-letter records
    pub fn list_dlq(&self, origin: Option<Stage>, offset: usize, limit: usize) -> DlqPage {
        self.core.dlq.list(origin, offset, limit.clamp(1, MAX_LIST_LIMIT))
    }

    /// Replay a dead-letter record: the intent is restored to the origin
    /// stage's entry status and the original job is re-enqueued.
    ///
    /// Rejected when the intent no longer exists or has moved somewhere a
    /// replay cannot resume from (cancelled, completed, denied).
    pub async fn retry_dlq(&self, id: &Uuid) -> EngineResult<()> {
        let core = &self.core;
        let record = core
            .dlq
            .take(id)
            .ok_or_else(|| EngineError::NotFound(format!("dead-letter record {}", id)))?;

        let entry_status = match record.origin_queue {
            Stage::Intake => IntentStatus::Pending,
            Stage::Evaluate | Stage::Decision => IntentStatus::Evaluating,
            Stage::Execute => IntentStatus::Approved,
        };

        let intent = match core
            .intents
            .get_intent(&record.intent_id, &record.tenant_id)
            .await
        {
            Ok(Some(intent)) => intent,
            Ok(None) => {
                core.dlq.push(record);
                return Err(EngineError::Conflict(
                    "intent for dead-letter record no longer exists".to_string(),
                ));
            }
            Err(error) => {
                core.dlq.push(record);
                return Err(error);
            }
        };

        let mut intent = intent;
        if intent.status == IntentStatus::Failed {
            // Resurrect out of the DLQ-induced failure
            let result = core
                .transition_intent(
                    &mut intent,
                    entry_status,
                    TransitionGuards {
                        skip_validation: true,
                        ..Default::default()
                    },
                    json!({ "via": "dlq_replay", "stage": record.origin_queue.as_str() }),
                )
                .await;
            if let Err(error) = result {
                core.dlq.push(record);
                return Err(error);
            }
        } else if intent.status != entry_status {
            let origin_queue = record.origin_queue.as_str();
            let message = format!(
                "intent is {}, cannot replay {} job",
                intent.status, origin_queue
            );
            core.dlq.push(record);
            return Err(EngineError::Conflict(message));
        }

        let job = record.job.clone();
        if let Err(error) = core.enqueue(job) {
            core.dlq.push(record);
            return Err(error);
        }
        Ok(())
    }

    /// Purge dead-letter records older than the given number of days
    pub fn purge_old_dlq(&self, days: u32) -> usize {
        self.core.dlq.purge_older_than(days)
    }

    // --- Circuit breaker administration ---

    pub async fn breaker_status(&self, name: &str) -> EngineResult<BreakerStatus> {
        self.core.breakers.get(name).status().await
    }

    pub async fn force_open_breaker(&self, name: &str) -> EngineResult<()> {
        self.core.breakers.get(name).force_open().await
    }

    pub async fn force_close_breaker(&self, name: &str) -> EngineResult<()> {
        self.core.breakers.get(name).force_close().await
    }

    pub async fn reset_breaker(&self, name: &str) -> EngineResult<()> {
        self.core.breakers.get(name).reset().await
    }

    // --- Webhook administration (delegated to the dispatcher) ---

    pub async fn register_webhook(
        &self,
        tenant: &TenantId,
        request: RegisterWebhookRequest,
    ) -> EngineResult<RegisteredWebhook> {
        self.core.webhooks.register(tenant, request).await
    }

    pub async fn unregister_webhook(&self, tenant: &TenantId, id: &Uuid) -> EngineResult<bool> {
        self.core.webhooks.unregister(tenant, id).await
    }

    pub async fn list_webhooks(
        &self,
        tenant: &TenantId,
    ) -> EngineResult<Vec<WebhookSubscription>> {
        self.core.webhooks.list(tenant).await
    }

    pub async fn webhook_circuit_status(
        &self,
        tenant: &TenantId,
        id: &Uuid,
    ) -> EngineResult<BreakerStatus> {
        self.core.webhooks.circuit_status(tenant, id).await
    }

    pub async fn reset_webhook_circuit(&self, tenant: &TenantId, id: &Uuid) -> EngineResult<()> {
        self.core.webhooks.reset_circuit(tenant, id).await
    }

    pub async fn webhook_delivery_history(
        &self,
        tenant: &TenantId,
        subscription_id: &Uuid,
        offset: u64,
        limit: usize,
    ) -> EngineResult<Vec<crate::webhooks::WebhookDelivery>> {
        self.core
            .webhooks
            .delivery_history(tenant, subscription_id, offset, limit)
            .await
    }

    pub async fn replay_webhook_delivery(
        &self,
        tenant: &TenantId,
        id: &Uuid,
    ) -> EngineResult<()> {
        self.core.webhooks.replay_delivery(tenant, id).await
    }

    pub async fn process_pending_webhook_retries(&self, limit: usize) -> EngineResult<usize> {
        self.core.webhooks.process_pending_retries(limit).await
    }
}
