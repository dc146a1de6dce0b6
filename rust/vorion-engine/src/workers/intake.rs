//! Intake stage: snapshot trust and hand off to evaluation

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::engine::EngineCore;
use crate::error::EngineResult;
use crate::evaluation::{Evaluation, TrustSource};
use crate::intent::{IntentStatus, TransitionGuards};
use crate::queue::{Stage, StageJob};
use crate::workers::StageHandler;

pub struct IntakeWorker {
    core: Arc<EngineCore>,
}

impl IntakeWorker {
    pub fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl StageHandler for IntakeWorker {
    fn stage(&self) -> Stage {
        Stage::Intake
    }

    async fn handle(&self, job: &StageJob) -> EngineResult<()> {
        let core = &self.core;
        let Some(mut intent) = core.intents.get_intent(&job.intent_id, &job.tenant_id).await?
        else {
            tracing::warn!(intent_id = %job.intent_id, "intake job for missing intent");
            return Ok(());
        };
        if intent.status != IntentStatus::Pending {
            // Cancelled (or otherwise moved on) while queued
            return Ok(());
        }

        let (trust, source) = core.fetch_trust(&intent.tenant_id, &intent.entity_id).await;
        intent.trust_snapshot = trust;
        intent.current_trust = trust;

        core.record_evaluation(
            intent.id,
            Evaluation::TrustSnapshot {
                score: trust.score,
                level: trust.level,
                source,
            },
        )
        .await?;
        core.metrics
            .trust_level_at_submission
            .observe(trust.level as f64);

        core.transition_intent(
            &mut intent,
            IntentStatus::Evaluating,
            TransitionGuards::default(),
            json!({ "trust_level": trust.level, "trust_source": source }),
        )
        .await?;

        let mut next = StageJob::new(
            Stage::Evaluate,
            intent.id,
            intent.tenant_id.clone(),
            json!({}),
            job.trace.child(),
        );
        next.namespace = job.namespace.clone();
        core.enqueue(next)?;
        Ok(())
    }
}
