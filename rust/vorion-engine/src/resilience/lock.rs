//! Lease-based distributed lock over the shared store
//!
//! A lock record is set-if-absent with a TTL and an owner token; acquisition
//! retries with exponential backoff bounded by an acquire timeout. Release is
//! compare-and-delete so only the holder can release, and a holder may find
//! its lease already expired (logged, not fatal).

use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::observability::EngineMetrics;
use crate::store::kv::KvStore;

/// Acquisition parameters
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease TTL; the lock self-expires after this
    pub lock_timeout: Duration,
    /// Total time to keep retrying acquisition
    pub acquire_timeout: Duration,
    /// Initial retry delay
    pub retry_delay: Duration,
    /// Retry delay cap
    pub max_retry_delay: Duration,
    /// Randomize delays to avoid thundering herds
    pub jitter: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(50),
            max_retry_delay: Duration::from_millis(500),
            jitter: true,
        }
    }
}

/// Factory for lock guards over one shared store
pub struct DistributedLock {
    kv: Arc<dyn KvStore>,
    metrics: Arc<EngineMetrics>,
}

/// A held lock. Call [`release`](LockGuard::release) when done; dropping
/// without releasing leaves the lease to expire on its own (logged).
pub struct LockGuard {
    kv: Arc<dyn KvStore>,
    key: String,
    token: String,
    released: bool,
}

impl DistributedLock {
    pub fn new(kv: Arc<dyn KvStore>, metrics: Arc<EngineMetrics>) -> Self {
        Self { kv, metrics }
    }

    /// Try to acquire the lock at `key`.
    ///
    /// Returns `None` when the acquire timeout elapses without winning the
    /// lease. Two holders of the same key can never coexist within the
    /// overlap of their lease TTLs (assuming clock skew bounded by the TTL
    /// margin).
    pub async fn acquire(&self, key: &str, options: &LockOptions) -> EngineResult<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + options.acquire_timeout;
        let mut delay = options.retry_delay;

        loop {
            if self
                .kv
                .set_nx(key, &token, options.lock_timeout)
                .await?
            {
                self.metrics
                    .lock_acquisitions
                    .with_label_values(&["acquired"])
                    .inc();
                return Ok(Some(LockGuard {
                    kv: self.kv.clone(),
                    key: key.to_string(),
                    token,
                    released: false,
                }));
            }

            let sleep_for = if options.jitter {
                // ±25% around the nominal delay
                let nominal = delay.as_millis() as f64;
                let factor = rand::thread_rng().gen_range(0.75..=1.25);
                Duration::from_millis((nominal * factor) as u64)
            } else {
                delay
            };

            if Instant::now() + sleep_for >= deadline {
                self.metrics
                    .lock_acquisitions
                    .with_label_values(&["timeout"])
                    .inc();
                return Ok(None);
            }

            tokio::time::sleep(sleep_for).await;
            delay = (delay * 2).min(options.max_retry_delay);
        }
    }
}

impl LockGuard {
    /// Owner token held for this lease
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release the lock. Only the holder's token deletes the record; an
    /// expired lease is logged and ignored.
    pub async fn release(mut self) -> EngineResult<()> {
        self.released = true;
        let deleted = self.kv.delete_if_value(&self.key, &self.token).await?;
        if !deleted {
            tracing::warn!(key = %self.key, "lock already expired before release");
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!(key = %self.key, "lock guard dropped without release; lease will expire");
        }
    }
}
