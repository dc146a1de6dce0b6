//! Dead-letter queue for stage jobs that exhaust their retry budget

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use parking_lot::RwLock;

use crate::intent::{IntentId, TenantId};
use crate::observability::{EngineMetrics, TraceContext};
use crate::queue::{Stage, StageJob};

/// Error description captured on a dead-letter record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub kind: String,
    pub stack: Option<String>,
}

/// Failure envelope retained until explicit replay or purge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    /// Queue the job failed out of
    pub origin_queue: Stage,
    /// Original job payload, preserved for replay
    pub job: StageJob,
    pub error: JobError,
    pub attempts_made: u32,
    pub intent_id: IntentId,
    pub tenant_id: TenantId,
    pub trace: TraceContext,
    pub created_at: DateTime<Utc>,
    pub first_failed_at: DateTime<Utc>,
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Build a record from an exhausted job
    pub fn from_job(job: StageJob, error: JobError, first_failed_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            origin_queue: job.stage,
            intent_id: job.intent_id,
            tenant_id: job.tenant_id.clone(),
            trace: job.trace.clone(),
            attempts_made: job.attempts_made,
            error,
            job,
            created_at: now,
            first_failed_at,
            moved_at: now,
        }
    }
}

/// One page of dead-letter records
#[derive(Debug, Clone)]
pub struct DlqPage {
    pub items: Vec<DeadLetterRecord>,
    pub total: usize,
    pub offset: usize,
    pub has_more: bool,
}

/// Dead-letter storage with paginated listing, replay removal, and
/// time-bounded purge
pub struct DeadLetterQueue {
    records: RwLock<Vec<DeadLetterRecord>>,
    metrics: Arc<EngineMetrics>,
}

impl DeadLetterQueue {
    pub fn new(metrics: Arc<EngineMetrics>) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            metrics,
        }
    }

    /// Add a record
    pub fn push(&self, record: DeadLetterRecord) {
        let mut records = self.records.write();
        records.push(record);
        self.metrics.dlq_size.set(records.len() as i64);
    }

    /// List records, newest first, optionally filtered by origin queue
    pub fn list(&self, origin: Option<Stage>, offset: usize, limit: usize) -> DlqPage {
        let records = self.records.read();
        let mut matches: Vec<&DeadLetterRecord> = records
            .iter()
            .filter(|r| origin.map(|s| r.origin_queue == s).unwrap_or(true))
            .collect();
        matches.sort_by(|a, b| b.moved_at.cmp(&a.moved_at));

        let total = matches.len();
        let items: Vec<DeadLetterRecord> = matches
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        let has_more = offset + items.len() < total;
        DlqPage {
            items,
            total,
            offset,
            has_more,
        }
    }

    /// Fetch one record
    pub fn get(&self, id: &Uuid) -> Option<DeadLetterRecord> {
        self.records.read().iter().find(|r| r.id == *id).cloned()
    }

    /// Remove a record (replay path). Returns it when present.
    pub fn take(&self, id: &Uuid) -> Option<DeadLetterRecord> {
        let mut records = self.records.write();
        let position = records.iter().position(|r| r.id == *id)?;
        let record = records.remove(position);
        self.metrics.dlq_size.set(records.len() as i64);
        Some(record)
    }

    /// Delete records older than `days`. Returns how many were removed.
    pub fn purge_older_than(&self, days: u32) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(days as i64);
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.moved_at >= cutoff);
        let removed = before - records.len();
        self.metrics.dlq_size.set(records.len() as i64);
        removed
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records per origin queue, for queue health reporting
    pub fn count_for(&self, stage: Stage) -> usize {
        self.records
            .read()
            .iter()
            .filter(|r| r.origin_queue == stage)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;
    use serde_json::json;

    fn dlq() -> DeadLetterQueue {
        let metrics = Arc::new(EngineMetrics::new(&Registry::new()).unwrap());
        DeadLetterQueue::new(metrics)
    }

    fn record(stage: Stage) -> DeadLetterRecord {
        let mut job = StageJob::new(
            stage,
            IntentId::new(),
            TenantId::new("t1"),
            json!({}),
            TraceContext::default(),
        );
        job.attempts_made = 3;
        DeadLetterRecord::from_job(
            job,
            JobError {
                message: "boom".to_string(),
                kind: "INTERNAL".to_string(),
                stack: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_push_list_take() {
        let dlq = dlq();
        let r = record(Stage::Evaluate);
        let id = r.id;
        dlq.push(r);

        let page = dlq.list(None, 0, 10);
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].attempts_made, 3);

        let taken = dlq.take(&id).unwrap();
        assert_eq!(taken.id, id);
        assert!(dlq.is_empty());
    }

    #[test]
    fn test_filter_by_origin_queue() {
        let dlq = dlq();
        dlq.push(record(Stage::Evaluate));
        dlq.push(record(Stage::Execute));
        dlq.push(record(Stage::Evaluate));

        assert_eq!(dlq.list(Some(Stage::Evaluate), 0, 10).total, 2);
        assert_eq!(dlq.list(Some(Stage::Execute), 0, 10).total, 1);
        assert_eq!(dlq.count_for(Stage::Evaluate), 2);
    }

    #[test]
    fn test_pagination() {
        let dlq = dlq();
        for _ in 0..5 {
            dlq.push(record(Stage::Intake));
        }
        let page = dlq.list(None, 0, 2);
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
        let last = dlq.list(None, 4, 2);
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_more);
    }

    #[test]
    fn test_purge_keeps_recent() {
        let dlq = dlq();
        let mut old = record(Stage::Intake);
        old.moved_at = Utc::now() - ChronoDuration::days(10);
        dlq.push(old);
        dlq.push(record(Stage::Intake));

        assert_eq!(dlq.purge_older_than(7), 1);
        assert_eq!(dlq.len(), 1);
    }
}
