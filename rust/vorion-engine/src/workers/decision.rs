//! Decision stage: live trust re-check, drift accounting, action resolution

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::collaborators::ResourceLimits;
use crate::engine::EngineCore;
use crate::error::{EngineError, EngineResult};
use crate::evaluation::{Evaluation, GovernanceAction, PolicyOutcome, RuleOutcome};
use crate::intent::{IntentStatus, TransitionGuards};
use crate::queue::{Stage, StageJob};
use crate::workers::StageHandler;

pub struct DecisionWorker {
    core: Arc<EngineCore>,
}

impl DecisionWorker {
    pub fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    fn status_for(action: GovernanceAction) -> IntentStatus {
        match action {
            GovernanceAction::Allow | GovernanceAction::Monitor | GovernanceAction::Limit => {
                IntentStatus::Approved
            }
            GovernanceAction::Deny | GovernanceAction::Terminate => IntentStatus::Denied,
            GovernanceAction::Escalate => IntentStatus::Escalated,
        }
    }
}

#[async_trait]
impl StageHandler for DecisionWorker {
    fn stage(&self) -> Stage {
        Stage::Decision
    }

    async fn handle(&self, job: &StageJob) -> EngineResult<()> {
        let core = &self.core;
        let Some(mut intent) = core.intents.get_intent(&job.intent_id, &job.tenant_id).await?
        else {
            tracing::warn!(intent_id = %job.intent_id, "decision job for missing intent");
            return Ok(());
        };
        if intent.status != IntentStatus::Evaluating {
            return Ok(());
        }

        // The intake snapshot may be stale; always re-fetch live trust
        let started = std::time::Instant::now();
        let (live, _source) = core.fetch_trust(&intent.tenant_id, &intent.entity_id).await;
        core.metrics
            .trust_fetch_duration
            .observe(started.elapsed().as_secs_f64());

        let drift = intent.trust_snapshot.score - live.score;
        core.metrics.observe_drift(drift);
        if drift.abs() >= 20 {
            tracing::warn!(
                intent_id = %intent.id,
                entity_id = %intent.entity_id,
                snapshot = intent.trust_snapshot.score,
                live = live.score,
                drift,
                "trust drifted since intake"
            );
        }
        intent.current_trust = live;

        // Trust gate fails closed on live values
        let required = core.config.trust.required_level(intent.intent_type.as_deref());
        let passed = live.level >= required;
        core.record_evaluation(
            intent.id,
            Evaluation::TrustGate {
                passed,
                required,
                actual: live.level,
            },
        )
        .await?;
        core.metrics
            .trust_gate_evaluations
            .with_label_values(&[if passed { "passed" } else { "failed" }])
            .inc();

        if !passed {
            core.transition_intent(
                &mut intent,
                IntentStatus::Denied,
                TransitionGuards::default(),
                json!({ "reason": "trust_gate", "required": required, "actual": live.level }),
            )
            .await?;
            core.emit_intent_webhook(&intent, "intent.denied", &job.trace);
            return Ok(());
        }

        let rule: RuleOutcome = serde_json::from_value(job.payload["rule"].clone())
            .map_err(|e| EngineError::Internal(format!("decision job missing rule basis: {}", e)))?;
        let policy: Option<PolicyOutcome> = serde_json::from_value(job.payload["policy"].clone())
            .unwrap_or(None);

        let rule_action = rule.action;
        let policy_action = policy.as_ref().map(|p| p.action);
        let final_action = policy_action
            .map(|p| rule_action.most_restrictive(p))
            .unwrap_or(rule_action);
        let policy_override = final_action != rule_action;
        if policy_override {
            core.metrics.policy_overrides.inc();
        }

        let decision = Evaluation::Decision {
            rule_action,
            policy_action,
            final_action,
            policy_override,
        };
        core.record_evaluation(intent.id, decision.clone()).await?;

        let next_status = Self::status_for(final_action);
        core.transition_intent(
            &mut intent,
            next_status,
            TransitionGuards::default(),
            json!({ "action": final_action, "policy_override": policy_override }),
        )
        .await?;

        // Proof recording never blocks or fails the decision
        core.record_proof(intent.id, decision);

        match next_status {
            IntentStatus::Approved => {
                core.emit_intent_webhook(&intent, "intent.approved", &job.trace);
                let limits = ResourceLimits::from(&core.config.cognigate);
                let mut next = StageJob::new(
                    Stage::Execute,
                    intent.id,
                    intent.tenant_id.clone(),
                    json!({ "limits": limits }),
                    job.trace.child(),
                );
                next.namespace = job.namespace.clone();
                core.enqueue(next)?;
            }
            IntentStatus::Denied => {
                core.emit_intent_webhook(&intent, "intent.denied", &job.trace);
            }
            _ => {}
        }
        Ok(())
    }
}
