// rust/vorion-lockchain/src/lib.rs
// Lockchain: hash-chained audit events with streaming verification

// CRITICAL: Enforce proper error handling - no unwrap/expect in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod chain;
pub mod storage;
pub mod verify;

pub use chain::{canonical_json, chain_hash, ChainLink, GENESIS_HASH};
pub use storage::{ArchivedEvent, LockchainStorage, StorageError};
pub use verify::{ChainReport, ChainStep, ChainVerification};

use thiserror::Error;

/// Top-level lockchain errors
#[derive(Debug, Error)]
pub enum LockchainError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Chain verification failed at sequence {0}")]
    ChainBroken(u64),

    #[error("Canonicalization failed: {0}")]
    Canonicalization(String),
}
