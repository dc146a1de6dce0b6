//! Sled-backed event store over the lockchain archive
//!
//! Durable single-node realization of [`EventStore`]. Multi-instance
//! deployments use the relational collaborator instead; this adapter keeps
//! the chain on disk for development and embedded installs.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use uuid::Uuid;
use vorion_lockchain::{ArchivedEvent, LockchainStorage};

use crate::error::{EngineError, EngineResult};
use crate::eventlog::IntentEvent;
use crate::intent::IntentId;
use crate::store::EventStore;

/// [`EventStore`] persisted through `vorion-lockchain`'s sled archive
pub struct SledEventStore {
    archive: LockchainStorage,
}

impl SledEventStore {
    /// Open (or create) the archive at the given directory
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let archive = LockchainStorage::open(path)
            .map_err(|e| EngineError::Store(format!("failed to open event archive: {}", e)))?;
        Ok(Self { archive })
    }

    fn to_archived(event: &IntentEvent) -> ArchivedEvent {
        ArchivedEvent {
            subject: event.intent_id.to_string(),
            event_id: event.id.to_string(),
            seq: event.seq,
            event_type: event.event_type.clone(),
            canonical: event.canonical_body(),
            occurred_at: event.occurred_at,
            hash: event.hash.clone(),
            previous_hash: event.previous_hash.clone(),
        }
    }

    fn from_archived(archived: ArchivedEvent) -> EngineResult<IntentEvent> {
        let canonical: Value = serde_json::from_str(&archived.canonical)
            .map_err(|e| EngineError::Store(format!("corrupt archived event: {}", e)))?;
        let payload = canonical
            .get("payload")
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()));
        Ok(IntentEvent {
            id: Uuid::parse_str(&archived.event_id)
                .map_err(|e| EngineError::Store(format!("corrupt archived event id: {}", e)))?,
            intent_id: IntentId::parse_str(&archived.subject)?,
            seq: archived.seq,
            event_type: archived.event_type,
            payload,
            occurred_at: archived.occurred_at,
            hash: archived.hash,
            previous_hash: archived.previous_hash,
        })
    }
}

#[async_trait]
impl EventStore for SledEventStore {
    async fn append_event(&self, event: &IntentEvent) -> EngineResult<()> {
        self.archive
            .append(&Self::to_archived(event))
            .map_err(|e| EngineError::Store(format!("archive append failed: {}", e)))
    }

    async fn latest_event(&self, intent_id: &IntentId) -> EngineResult<Option<IntentEvent>> {
        let archived = self
            .archive
            .latest(&intent_id.to_string())
            .map_err(|e| EngineError::Store(format!("archive read failed: {}", e)))?;
        archived.map(Self::from_archived).transpose()
    }

    async fn events_page(
        &self,
        intent_id: &IntentId,
        offset: u64,
        limit: usize,
    ) -> EngineResult<Vec<IntentEvent>> {
        let archived = self
            .archive
            .range(&intent_id.to_string(), offset, limit)
            .map_err(|e| EngineError::Store(format!("archive scan failed: {}", e)))?;
        archived.into_iter().map(Self::from_archived).collect()
    }

    async fn event_count(&self, intent_id: &IntentId) -> EngineResult<u64> {
        self.archive
            .count(&intent_id.to_string())
            .map_err(|e| EngineError::Store(format!("archive count failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::EventLogWriter;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_chain_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let intent_id = IntentId::new();

        {
            let store = Arc::new(SledEventStore::open(dir.path()).unwrap());
            let writer = EventLogWriter::new(store);
            for i in 0..5 {
                writer
                    .append(intent_id, "intent.audit", json!({"i": i}))
                    .await
                    .unwrap();
            }
        }

        let store = Arc::new(SledEventStore::open(dir.path()).unwrap());
        let writer = EventLogWriter::new(store.clone());
        assert_eq!(store.event_count(&intent_id).await.unwrap(), 5);

        let report = writer.verify(intent_id, 2, 100).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.events_verified, 5);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SledEventStore::open(dir.path()).unwrap());
        let writer = EventLogWriter::new(store.clone());
        let intent_id = IntentId::new();

        let written = writer
            .append(intent_id, "intent.submitted", json!({"goal": "deploy"}))
            .await
            .unwrap();
        let read = store.latest_event(&intent_id).await.unwrap().unwrap();
        assert_eq!(read.id, written.id);
        assert_eq!(read.payload, json!({"goal": "deploy"}));
        assert_eq!(read.hash, written.hash);
    }
}
