//! Stage worker pools
//!
//! Each stage runs `queue_concurrency` handler tasks over its queue (the
//! execute stage additionally bounded by sandbox concurrency). Handler
//! failures feed the retry policy; exhausted jobs dead-letter and mark the
//! intent failed.

pub mod decision;
pub mod evaluate;
pub mod execute;
pub mod intake;

pub use decision::DecisionWorker;
pub use evaluate::EvaluateWorker;
pub use execute::ExecuteWorker;
pub use intake::IntakeWorker;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::engine::EngineCore;
use crate::error::{EngineError, EngineResult};
use crate::queue::{Stage, StageJob};
use crate::resilience::dlq::{DeadLetterRecord, JobError};

/// One stage's job handler
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    async fn handle(&self, job: &StageJob) -> EngineResult<()>;
}

/// Spawn `concurrency` worker tasks for a handler's stage
pub(crate) fn spawn_stage_workers(
    core: Arc<EngineCore>,
    handler: Arc<dyn StageHandler>,
    concurrency: usize,
) -> Vec<JoinHandle<()>> {
    (0..concurrency.max(1))
        .map(|worker_index| {
            let core = core.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                run_worker(core, handler, worker_index).await;
            })
        })
        .collect()
}

async fn run_worker(core: Arc<EngineCore>, handler: Arc<dyn StageHandler>, worker_index: usize) {
    let stage = handler.stage();
    let queue = core.queue(stage);
    let shutdown = core.shutdown_signal();
    let job_timeout = Duration::from_millis(core.config.job_timeout_ms);

    tracing::debug!(stage = stage.as_str(), worker = worker_index, "stage worker started");

    while let Some(job) = queue.pop(&shutdown).await {
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(job_timeout, handler.handle(&job)).await;
        core.metrics
            .job_duration
            .with_label_values(&[stage.as_str()])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(())) => {
                queue.ack(&job.id);
                core.metrics
                    .jobs_processed
                    .with_label_values(&[stage.as_str(), "success"])
                    .inc();
            }
            Ok(Err(error)) => {
                handle_failure(&core, &queue, job, error).await;
            }
            Err(_elapsed) => {
                let error = EngineError::StatementTimeout(format!(
                    "stage handler exceeded {}ms",
                    core.config.job_timeout_ms
                ));
                handle_failure(&core, &queue, job, error).await;
            }
        }
    }

    tracing::debug!(stage = stage.as_str(), worker = worker_index, "stage worker stopped");
}

async fn handle_failure(
    core: &Arc<EngineCore>,
    queue: &Arc<crate::queue::StageQueue>,
    job: StageJob,
    error: EngineError,
) {
    core.metrics
        .jobs_processed
        .with_label_values(&[job.stage.as_str(), "failure"])
        .inc();

    let mut job = match queue.nack(&job.id) {
        Some(leased) => leased,
        None => job,
    };
    job.attempts_made += 1;

    tracing::warn!(
        stage = job.stage.as_str(),
        intent_id = %job.intent_id,
        attempt = job.attempts_made,
        error = %error,
        "stage job failed"
    );

    if error.is_retryable() && core.retry.should_retry(job.attempts_made) {
        let delay = core.retry.delay_for_attempt(job.attempts_made);
        if let Err(e) = queue.push_delayed(job, delay) {
            tracing::error!(error = %e, "failed to requeue stage job");
        }
    } else {
        dead_letter(core, job, error).await;
    }
}

/// Move an exhausted job to the DLQ and mark its intent failed
async fn dead_letter(core: &Arc<EngineCore>, job: StageJob, error: EngineError) {
    let record = DeadLetterRecord::from_job(
        job.clone(),
        JobError {
            message: error.to_string(),
            kind: error.kind().to_string(),
            stack: None,
        },
        Utc::now(),
    );
    core.dlq.push(record);
    core.metrics
        .jobs_processed
        .with_label_values(&[job.stage.as_str(), "dead_letter"])
        .inc();

    if let Err(e) = core.mark_intent_failed(&job, &error).await {
        tracing::error!(
            intent_id = %job.intent_id,
            error = %e,
            "failed to mark intent failed after dead-lettering"
        );
    }
}
