//! Stage work queues
//!
//! Four queues, one per pipeline stage. Jobs are leased to handlers with a
//! deadline; per-intent exclusion guarantees at-most-one handler per
//! (stage, intent) at a time. Delayed redelivery implements retry backoff;
//! stalled leases are reclaimed and redelivered.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::intent::{IntentId, TenantId};
use crate::observability::{EngineMetrics, TraceContext};
use crate::shutdown::ShutdownSignal;

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Intake,
    Evaluate,
    Decision,
    Execute,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Evaluate => "evaluate",
            Stage::Decision => "decision",
            Stage::Execute => "execute",
        }
    }

    /// All stages in pipeline order
    pub fn all() -> [Stage; 4] {
        [Stage::Intake, Stage::Evaluate, Stage::Decision, Stage::Execute]
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "intake" => Some(Stage::Intake),
            "evaluate" => Some(Stage::Evaluate),
            "decision" => Some(Stage::Decision),
            "execute" => Some(Stage::Execute),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of stage work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageJob {
    pub id: Uuid,
    pub stage: Stage,
    pub intent_id: IntentId,
    pub tenant_id: TenantId,
    pub namespace: Option<String>,
    /// Stage-specific payload (evaluation outputs, decision data, limits)
    pub payload: Value,
    /// Failed handler attempts so far
    pub attempts_made: u32,
    pub trace: TraceContext,
    pub enqueued_at: DateTime<Utc>,
}

impl StageJob {
    pub fn new(
        stage: Stage,
        intent_id: IntentId,
        tenant_id: TenantId,
        payload: Value,
        trace: TraceContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage,
            intent_id,
            tenant_id,
            namespace: None,
            payload,
            attempts_made: 0,
            trace,
            enqueued_at: Utc::now(),
        }
    }
}

struct Lease {
    job: StageJob,
    deadline: Instant,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<StageJob>,
    delayed: Vec<(Instant, StageJob)>,
    in_flight: HashMap<Uuid, Lease>,
    active_intents: HashSet<IntentId>,
    /// Completed-job retention window (1 hour / 1000 entries)
    completed: VecDeque<(Instant, Uuid)>,
    failed: u64,
}

const COMPLETED_RETENTION: Duration = Duration::from_secs(3600);
const COMPLETED_CAPACITY: usize = 1000;

/// Health snapshot for one queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub stage: &'static str,
    pub waiting: usize,
    pub active: usize,
    pub failed: u64,
}

/// One stage's work queue
pub struct StageQueue {
    stage: Stage,
    inner: Mutex<QueueInner>,
    notify: Notify,
    lease: Duration,
    metrics: Arc<EngineMetrics>,
}

impl StageQueue {
    pub fn new(stage: Stage, lease: Duration, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            stage,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            lease,
            metrics,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn update_gauges(&self, inner: &QueueInner) {
        self.metrics
            .queue_depth
            .with_label_values(&[self.stage.as_str()])
            .set((inner.ready.len() + inner.delayed.len()) as i64);
        self.metrics
            .queue_active
            .with_label_values(&[self.stage.as_str()])
            .set(inner.in_flight.len() as i64);
    }

    /// Enqueue a job for immediate delivery
    pub fn push(&self, job: StageJob) -> EngineResult<()> {
        if job.stage != self.stage {
            return Err(EngineError::Internal(format!(
                "job for stage {} pushed to {} queue",
                job.stage, self.stage
            )));
        }
        let mut inner = self.inner.lock();
        inner.ready.push_back(job);
        self.update_gauges(&inner);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Enqueue a job for delivery after `delay`
    pub fn push_delayed(&self, job: StageJob, delay: Duration) -> EngineResult<()> {
        if job.stage != self.stage {
            return Err(EngineError::Internal(format!(
                "job for stage {} pushed to {} queue",
                job.stage, self.stage
            )));
        }
        let mut inner = self.inner.lock();
        inner.delayed.push((Instant::now() + delay, job));
        self.update_gauges(&inner);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Promote due delayed jobs and reclaim expired leases
    fn sweep(&self, inner: &mut QueueInner) {
        let now = Instant::now();

        let mut still_delayed = Vec::with_capacity(inner.delayed.len());
        for (due, job) in inner.delayed.drain(..) {
            if due <= now {
                inner.ready.push_back(job);
            } else {
                still_delayed.push((due, job));
            }
        }
        inner.delayed = still_delayed;

        let stalled: Vec<Uuid> = inner
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in stalled {
            if let Some(lease) = inner.in_flight.remove(&id) {
                tracing::warn!(
                    stage = self.stage.as_str(),
                    job_id = %id,
                    intent_id = %lease.job.intent_id,
                    "stage job stalled, returning to queue"
                );
                inner.active_intents.remove(&lease.job.intent_id);
                let mut job = lease.job;
                job.attempts_made += 1;
                inner.ready.push_back(job);
            }
        }
    }

    fn try_lease(&self, inner: &mut QueueInner) -> Option<StageJob> {
        let position = inner
            .ready
            .iter()
            .position(|job| !inner.active_intents.contains(&job.intent_id))?;
        let job = inner.ready.remove(position)?;
        inner.active_intents.insert(job.intent_id);
        inner.in_flight.insert(
            job.id,
            Lease {
                job: job.clone(),
                deadline: Instant::now() + self.lease,
            },
        );
        Some(job)
    }

    /// Lease the next eligible job, waiting until one is available or
    /// shutdown begins. Returns `None` on shutdown.
    pub async fn pop(&self, shutdown: &ShutdownSignal) -> Option<StageJob> {
        loop {
            if shutdown.is_shutting_down() {
                return None;
            }

            {
                let mut inner = self.inner.lock();
                self.sweep(&mut inner);
                if let Some(job) = self.try_lease(&mut inner) {
                    self.update_gauges(&inner);
                    return Some(job);
                }
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = shutdown.wait() => return None,
            }
        }
    }

    /// Acknowledge successful completion of a leased job
    pub fn ack(&self, job_id: &Uuid) {
        let mut inner = self.inner.lock();
        if let Some(lease) = inner.in_flight.remove(job_id) {
            inner.active_intents.remove(&lease.job.intent_id);
            let now = Instant::now();
            inner.completed.push_back((now, *job_id));
            while inner.completed.len() > COMPLETED_CAPACITY
                || inner
                    .completed
                    .front()
                    .map(|(t, _)| now.duration_since(*t) > COMPLETED_RETENTION)
                    .unwrap_or(false)
            {
                inner.completed.pop_front();
            }
        }
        self.update_gauges(&inner);
    }

    /// Return a leased job after a handler failure. The caller decides
    /// between delayed redelivery and the dead-letter queue.
    pub fn nack(&self, job_id: &Uuid) -> Option<StageJob> {
        let mut inner = self.inner.lock();
        let lease = inner.in_flight.remove(job_id)?;
        inner.active_intents.remove(&lease.job.intent_id);
        inner.failed += 1;
        self.update_gauges(&inner);
        Some(lease.job)
    }

    /// Current health counters
    pub fn health(&self) -> QueueHealth {
        let inner = self.inner.lock();
        QueueHealth {
            stage: self.stage.as_str(),
            waiting: inner.ready.len() + inner.delayed.len(),
            active: inner.in_flight.len(),
            failed: inner.failed,
        }
    }
}
