//! Evaluate stage: rule and policy evaluation in parallel

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::engine::EngineCore;
use crate::error::{EngineError, EngineResult};
use crate::evaluation::{Evaluation, PolicyOutcome};
use crate::intent::{Intent, IntentStatus};
use crate::queue::{Stage, StageJob};
use crate::workers::StageHandler;

pub struct EvaluateWorker {
    core: Arc<EngineCore>,
}

impl EvaluateWorker {
    pub fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    /// Policy evaluation through the `policyEngine` breaker. An open circuit
    /// or a failed evaluation degrades to rules-only rather than failing the
    /// job.
    async fn evaluate_policy(&self, intent: &Intent) -> Option<PolicyOutcome> {
        let core = &self.core;
        let breaker = core.breakers.get("policyEngine");
        let started = std::time::Instant::now();
        let policy = core.collaborators.policy.clone();
        let result = breaker
            .execute(|| async { policy.evaluate(intent).await })
            .await;
        core.metrics
            .policy_duration
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => {
                core.metrics
                    .policy_evaluations
                    .with_label_values(&["success"])
                    .inc();
                for matched in &outcome.matches {
                    tracing::debug!(
                        policy = %matched.policy,
                        count = matched.count,
                        "policy matched"
                    );
                }
                Some(outcome)
            }
            Err(EngineError::CircuitOpen(_)) => {
                tracing::warn!(intent_id = %intent.id, "policy evaluation skipped: circuit open");
                core.metrics
                    .policy_evaluations
                    .with_label_values(&["skipped"])
                    .inc();
                None
            }
            Err(error) => {
                tracing::warn!(
                    intent_id = %intent.id,
                    error = %error,
                    "policy evaluation failed, continuing rules-only"
                );
                core.metrics
                    .policy_evaluations
                    .with_label_values(&["failure"])
                    .inc();
                None
            }
        }
    }
}

#[async_trait]
impl StageHandler for EvaluateWorker {
    fn stage(&self) -> Stage {
        Stage::Evaluate
    }

    async fn handle(&self, job: &StageJob) -> EngineResult<()> {
        let core = &self.core;
        let Some(intent) = core.intents.get_intent(&job.intent_id, &job.tenant_id).await? else {
            tracing::warn!(intent_id = %job.intent_id, "evaluate job for missing intent");
            return Ok(());
        };
        if intent.status != IntentStatus::Evaluating {
            return Ok(());
        }

        // Rules always run; policy runs in parallel behind its breaker
        let (rule_result, policy) = tokio::join!(
            core.collaborators.rules.evaluate(&intent),
            self.evaluate_policy(&intent),
        );
        let rule = rule_result?;
        let degraded = policy.is_none();

        core.record_evaluation(
            intent.id,
            Evaluation::Basis {
                rule: rule.clone(),
                policy: policy.clone(),
                degraded,
            },
        )
        .await?;

        let mut next = StageJob::new(
            Stage::Decision,
            intent.id,
            intent.tenant_id.clone(),
            json!({ "rule": rule, "policy": policy, "degraded": degraded }),
            job.trace.child(),
        );
        next.namespace = job.namespace.clone();
        core.enqueue(next)?;
        Ok(())
    }
}
