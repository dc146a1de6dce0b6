// rust/vorion-lockchain/src/storage.rs
// Persistent append-only archive for chained events

use crate::chain::ChainLink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use thiserror::Error;

/// Storage error types
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Sequence {1} already archived for subject {0}")]
    DuplicateSequence(String, u64),
}

/// One archived chain event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedEvent {
    /// Chain subject (intent id)
    pub subject: String,
    /// Stable identifier of the archived event
    pub event_id: String,
    /// Zero-based position within the subject's chain
    pub seq: u64,
    /// Event type string
    pub event_type: String,
    /// Canonical JSON payload
    pub canonical: String,
    /// Wall-clock time of the event
    pub occurred_at: DateTime<Utc>,
    /// Chain hash stored with the event
    pub hash: String,
    /// Hash of the preceding event (genesis constant for seq 0)
    pub previous_hash: String,
}

impl ChainLink for ArchivedEvent {
    fn stored_hash(&self) -> &str {
        &self.hash
    }

    fn stored_previous_hash(&self) -> &str {
        &self.previous_hash
    }

    fn canonical(&self) -> String {
        self.canonical.clone()
    }
}

/// Sled-backed archive of per-subject event chains.
///
/// Key format: "event:{subject}:{seq:020}" (zero-padded so range scans walk
/// in chain order) plus a "head:{subject}" pointer at the latest sequence.
pub struct LockchainStorage {
    db: Db,
}

impl LockchainStorage {
    /// Open (or create) an archive at the given directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    fn event_key(subject: &str, seq: u64) -> String {
        format!("event:{}:{:020}", subject, seq)
    }

    fn head_key(subject: &str) -> String {
        format!("head:{}", subject)
    }

    /// Append an event at the next sequence for its subject.
    ///
    /// The caller is responsible for chain ordering (the engine serializes
    /// appends per intent); the archive only refuses to overwrite an existing
    /// sequence.
    pub fn append(&self, event: &ArchivedEvent) -> Result<(), StorageError> {
        let key = Self::event_key(&event.subject, event.seq);
        if self.db.contains_key(key.as_bytes())? {
            return Err(StorageError::DuplicateSequence(
                event.subject.clone(),
                event.seq,
            ));
        }
        let value = bincode::serialize(event)?;
        self.db.insert(key.as_bytes(), value)?;
        self.db.insert(
            Self::head_key(&event.subject).as_bytes(),
            &event.seq.to_be_bytes()[..],
        )?;
        self.db.flush()?;
        Ok(())
    }

    /// Latest archived event for a subject
    pub fn latest(&self, subject: &str) -> Result<Option<ArchivedEvent>, StorageError> {
        let head = match self.db.get(Self::head_key(subject).as_bytes())? {
            Some(bytes) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                u64::from_be_bytes(buf)
            }
            None => return Ok(None),
        };
        self.get(subject, head)
    }

    /// Fetch one event by sequence
    pub fn get(&self, subject: &str, seq: u64) -> Result<Option<ArchivedEvent>, StorageError> {
        match self.db.get(Self::event_key(subject, seq).as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Events for a subject starting at `start_seq`, at most `limit`
    pub fn range(
        &self,
        subject: &str,
        start_seq: u64,
        limit: usize,
    ) -> Result<Vec<ArchivedEvent>, StorageError> {
        let start = Self::event_key(subject, start_seq);
        let prefix = format!("event:{}:", subject);
        let mut events = Vec::with_capacity(limit);

        for result in self.db.range(start.as_bytes()..) {
            let (key, value) = result?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            events.push(bincode::deserialize::<ArchivedEvent>(&value)?);
            if events.len() >= limit {
                break;
            }
        }

        Ok(events)
    }

    /// Number of archived events for a subject
    pub fn count(&self, subject: &str) -> Result<u64, StorageError> {
        match self.db.get(Self::head_key(subject).as_bytes())? {
            Some(bytes) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf) + 1)
            }
            None => Ok(0),
        }
    }

    /// Check that the subject's sequence numbers are gap-free
    pub fn verify_continuity(&self, subject: &str) -> Result<bool, StorageError> {
        let count = self.count(subject)?;
        for seq in 0..count {
            if self.get(subject, seq)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Clear all data (for testing)
    #[cfg(test)]
    pub fn clear(&self) -> Result<(), StorageError> {
        self.db.clear()?;
        Ok(())
    }
}

impl std::fmt::Debug for LockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockchainStorage").finish()
    }
}
