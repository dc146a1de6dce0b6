//! Hash-chained intent event log
//!
//! Every stage appends events here. Events for one intent form a total
//! order linked by SHA-256 hashes; appends are serialized per intent so two
//! concurrent writers can never chain to the same previous hash.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use vorion_lockchain::{canonical_json, chain_hash, ChainLink, ChainReport, ChainVerification, GENESIS_HASH};

use crate::error::EngineResult;
use crate::intent::IntentId;
use crate::store::EventStore;

/// One ordered, hash-chained event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentEvent {
    pub id: Uuid,
    pub intent_id: IntentId,
    /// Zero-based position in the intent's chain
    pub seq: u64,
    pub event_type: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
    /// `SHA-256(canonical(event) || previous_hash)`, hex
    pub hash: String,
    /// Hash of the preceding event; 64 zeros for the first
    pub previous_hash: String,
}

impl IntentEvent {
    /// Canonical form the chain hash is computed over
    pub fn canonical_body(&self) -> String {
        canonical_json(&json!({
            "event_type": self.event_type,
            "intent_id": self.intent_id.to_string(),
            "occurred_at_ms": self.occurred_at.timestamp_millis(),
            "payload": self.payload,
            "seq": self.seq,
        }))
    }
}

impl ChainLink for IntentEvent {
    fn stored_hash(&self) -> &str {
        &self.hash
    }

    fn stored_previous_hash(&self) -> &str {
        &self.previous_hash
    }

    fn canonical(&self) -> String {
        self.canonical_body()
    }
}

/// Appends chained events under per-intent serialization
pub struct EventLogWriter {
    store: Arc<dyn EventStore>,
    appenders: DashMap<IntentId, Arc<Mutex<()>>>,
}

impl EventLogWriter {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            appenders: DashMap::new(),
        }
    }

    /// Append an event to an intent's chain.
    ///
    /// Holds the intent's append lock across read-latest, hash, and insert.
    /// A multi-instance deployment gets the same serialization from a row
    /// lock on the latest event; the contract on [`EventStore`] documents
    /// that expectation.
    pub async fn append(
        &self,
        intent_id: IntentId,
        event_type: &str,
        payload: Value,
    ) -> EngineResult<IntentEvent> {
        let lock = self
            .appenders
            .entry(intent_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        let latest = self.store.latest_event(&intent_id).await?;
        let (seq, previous_hash) = match latest {
            Some(event) => (event.seq + 1, event.hash),
            None => (0, GENESIS_HASH.to_string()),
        };

        let mut event = IntentEvent {
            id: Uuid::new_v4(),
            intent_id,
            seq,
            event_type: event_type.to_string(),
            payload,
            occurred_at: Utc::now(),
            hash: String::new(),
            previous_hash,
        };
        event.hash = chain_hash(&event.canonical_body(), &event.previous_hash);

        self.store.append_event(&event).await?;
        drop(guard);

        // Drop idle per-intent locks so the registry doesn't grow unbounded
        self.appenders
            .remove_if(&intent_id, |_, lock| Arc::strong_count(lock) <= 1);

        Ok(event)
    }

    /// Verify an intent's chain by streaming batches from the store.
    ///
    /// A `truncated=true` report asserts validity only for the verified
    /// prefix (`events_verified` links).
    pub async fn verify(
        &self,
        intent_id: IntentId,
        batch_size: usize,
        max_events: u64,
    ) -> EngineResult<ChainReport> {
        let batch_size = batch_size.max(1);
        let mut verification = ChainVerification::new(max_events);
        let mut offset = 0u64;

        loop {
            let batch = self
                .store
                .events_page(&intent_id, offset, batch_size)
                .await?;
            if batch.is_empty() {
                return Ok(verification.finish(false));
            }

            for event in &batch {
                if verification.done() {
                    break;
                }
                verification.push(event);
            }

            if verification.done() {
                let total = self.store.event_count(&intent_id).await?;
                let more_remaining = total > verification.verified();
                return Ok(verification.finish(more_remaining));
            }

            offset += batch.len() as u64;
            if batch.len() < batch_size {
                return Ok(verification.finish(false));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn writer() -> EventLogWriter {
        EventLogWriter::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_first_event_links_to_genesis() {
        let writer = writer();
        let intent_id = IntentId::new();
        let event = writer
            .append(intent_id, "intent.submitted", json!({"goal": "g"}))
            .await
            .unwrap();
        assert_eq!(event.seq, 0);
        assert_eq!(event.previous_hash, GENESIS_HASH);
        assert_eq!(event.hash.len(), 64);
    }

    #[tokio::test]
    async fn test_chain_links_and_verifies() {
        let writer = writer();
        let intent_id = IntentId::new();
        let first = writer
            .append(intent_id, "intent.submitted", json!({}))
            .await
            .unwrap();
        let second = writer
            .append(intent_id, "intent.evaluating", json!({}))
            .await
            .unwrap();
        assert_eq!(second.previous_hash, first.hash);

        let report = writer.verify(intent_id, 10, 1000).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.events_verified, 2);
        assert!(!report.truncated);
    }

    #[tokio::test]
    async fn test_concurrent_appends_serialize() {
        let writer = Arc::new(writer());
        let intent_id = IntentId::new();

        let mut handles = Vec::new();
        for i in 0..20 {
            let writer = writer.clone();
            handles.push(tokio::spawn(async move {
                writer
                    .append(intent_id, "intent.audit", json!({"i": i}))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let report = writer.verify(intent_id, 7, 1000).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.events_verified, 20);
    }

    #[tokio::test]
    async fn test_verify_respects_max_events() {
        let writer = writer();
        let intent_id = IntentId::new();
        for i in 0..10 {
            writer
                .append(intent_id, "intent.audit", json!({"i": i}))
                .await
                .unwrap();
        }
        let report = writer.verify(intent_id, 3, 5).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.events_verified, 5);
        assert!(report.truncated);
    }

    #[tokio::test]
    async fn test_verify_empty_chain() {
        let writer = writer();
        let report = writer.verify(IntentId::new(), 10, 100).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.events_verified, 0);
    }
}
