//! Execute stage: sandbox handoff for approved intents

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::collaborators::{ExecutionOutcome, ResourceLimits};
use crate::engine::EngineCore;
use crate::error::EngineResult;
use crate::evaluation::Evaluation;
use crate::intent::{IntentStatus, TransitionGuards};
use crate::queue::{Stage, StageJob};
use crate::workers::StageHandler;

pub struct ExecuteWorker {
    core: Arc<EngineCore>,
}

impl ExecuteWorker {
    pub fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl StageHandler for ExecuteWorker {
    fn stage(&self) -> Stage {
        Stage::Execute
    }

    async fn handle(&self, job: &StageJob) -> EngineResult<()> {
        let core = &self.core;
        let Some(mut intent) = core.intents.get_intent(&job.intent_id, &job.tenant_id).await?
        else {
            tracing::warn!(intent_id = %job.intent_id, "execute job for missing intent");
            return Ok(());
        };

        match intent.status {
            // May have been cancelled between approval and execution
            IntentStatus::Approved => {
                core.transition_intent(
                    &mut intent,
                    IntentStatus::Executing,
                    TransitionGuards::default(),
                    json!({}),
                )
                .await?;
            }
            // A previous attempt of this job already moved it to executing
            IntentStatus::Executing => {}
            _ => return Ok(()),
        }

        let limits: ResourceLimits = serde_json::from_value(job.payload["limits"].clone())
            .unwrap_or_else(|_| ResourceLimits::from(&core.config.cognigate));

        let _permit = core.sandbox_permit().await;
        core.metrics.executions_in_progress.inc();
        let started = std::time::Instant::now();
        let result = core.collaborators.sandbox.execute(&intent, &limits).await;
        core.metrics.executions_in_progress.dec();

        let report = match result {
            Ok(report) => report,
            Err(error) => {
                // No fallback exists for the execute stage; transport errors
                // are failures of the job and feed the retry policy
                return Err(error);
            }
        };

        core.metrics
            .execution_duration
            .observe(started.elapsed().as_secs_f64());
        core.metrics
            .executions
            .with_label_values(&[report.outcome.as_str()])
            .inc();
        if let Some(peak) = report.memory_peak_mb {
            core.metrics.execution_memory_peak_mb.observe(peak as f64);
        }

        match report.outcome {
            ExecutionOutcome::Success => {
                core.transition_intent(
                    &mut intent,
                    IntentStatus::Completed,
                    TransitionGuards::default(),
                    json!({ "duration_ms": report.duration_ms }),
                )
                .await?;
                core.emit_intent_webhook(&intent, "intent.completed", &job.trace);
            }
            outcome => {
                // intent.failed is not in the webhook catalogue; audit only
                let message = report
                    .error
                    .unwrap_or_else(|| format!("execution {}", outcome.as_str()));
                core.record_evaluation(
                    intent.id,
                    Evaluation::Error {
                        message: message.clone(),
                        error_kind: outcome.as_str().to_uppercase(),
                    },
                )
                .await?;
                core.transition_intent(
                    &mut intent,
                    IntentStatus::Failed,
                    TransitionGuards::default(),
                    json!({ "outcome": outcome.as_str(), "error": message }),
                )
                .await?;
            }
        }
        Ok(())
    }
}
