//! Deduplication: fingerprint computation and race-safe reservation
//!
//! The fingerprint is an HMAC over the intent-identifying fields plus a time
//! bucket, so identical submissions inside the window collapse to one intent
//! while the secret keeps fingerprints unpredictable. Reservation resolves
//! concurrent identical submissions with a distributed lock; the store's
//! unique (tenant, fingerprint) constraint is the ultimate guard.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;
use vorion_lockchain::canonical_json;

use crate::config::DedupeConfig;
use crate::error::{EngineError, EngineResult};
use crate::intent::{Intent, IntentSubmission, TenantId};
use crate::observability::EngineMetrics;
use crate::resilience::lock::{DistributedLock, LockGuard, LockOptions};
use crate::store::kv::KvStore;
use crate::store::IntentStore;

type HmacSha256 = Hmac<Sha256>;

static PLAIN_HASH_WARNING: Once = Once::new();

/// How a reservation resolved
pub enum DedupeOutcome {
    /// No duplicate; the caller holds the reservation and may insert
    New(DedupeReservation),
    /// A live intent with this fingerprint already exists
    Duplicate(Intent),
    /// Lost the reservation race; the winner's intent is returned
    RaceResolved(Intent),
}

impl DedupeOutcome {
    /// Metric label for this outcome
    pub fn label(&self) -> &'static str {
        match self {
            DedupeOutcome::New(_) => "new",
            DedupeOutcome::Duplicate(_) => "duplicate",
            DedupeOutcome::RaceResolved(_) => "race_resolved",
        }
    }
}

/// Held while the caller inserts the new intent
pub struct DedupeReservation {
    guard: LockGuard,
    kv: Arc<dyn KvStore>,
    marker_key: String,
    marker_ttl: Duration,
}

impl DedupeReservation {
    /// Mark the fingerprint as taken and release the lock. Call after the
    /// intent row is persisted.
    pub async fn commit(self) -> EngineResult<()> {
        self.kv
            .set(&self.marker_key, "1", Some(self.marker_ttl))
            .await?;
        self.guard.release().await
    }

    /// Release without marking (the insert failed)
    pub async fn abort(self) -> EngineResult<()> {
        self.guard.release().await
    }
}

/// Fingerprinting and reservation service
pub struct DedupeService {
    kv: Arc<dyn KvStore>,
    lock: DistributedLock,
    intents: Arc<dyn IntentStore>,
    config: DedupeConfig,
    metrics: Arc<EngineMetrics>,
}

impl DedupeService {
    pub fn new(
        kv: Arc<dyn KvStore>,
        intents: Arc<dyn IntentStore>,
        config: DedupeConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            lock: DistributedLock::new(kv.clone(), metrics.clone()),
            kv,
            intents,
            config,
            metrics,
        }
    }

    /// Compute the dedupe fingerprint for a submission.
    ///
    /// `hex(HMAC-SHA256(secret, tenant || entity || goal || canonical(context)
    /// || type || idempotency_key || floor(now / window)))`. Without a
    /// configured secret (development) this degrades to a plain hash and
    /// warns once.
    pub fn fingerprint(&self, tenant: &TenantId, submission: &IntentSubmission) -> String {
        let bucket = if self.config.timestamp_window_seconds == 0 {
            0
        } else {
            chrono::Utc::now().timestamp() as u64 / self.config.timestamp_window_seconds
        };
        let material = format!(
            "{}\x1f{}\x1f{}\x1f{}\x1f{}\x1f{}\x1f{}",
            tenant,
            submission.entity_id,
            submission.goal,
            canonical_json(&submission.context),
            submission.intent_type.as_deref().unwrap_or(""),
            submission.idempotency_key.as_deref().unwrap_or(""),
            bucket,
        );

        match &self.config.secret {
            Some(secret) => {
                let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                    .expect("HMAC accepts keys of any length");
                mac.update(material.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            None => {
                PLAIN_HASH_WARNING.call_once(|| {
                    tracing::warn!(
                        "no dedupe secret configured; falling back to plain hash fingerprints"
                    );
                });
                hex::encode(Sha256::digest(material.as_bytes()))
            }
        }
    }

    fn lock_key(tenant: &TenantId, fingerprint: &str) -> String {
        format!("intent:dedupe:{}:{}", tenant, fingerprint)
    }

    fn marker_key(tenant: &TenantId, fingerprint: &str) -> String {
        format!("intent:dedupe:marker:{}:{}", tenant, fingerprint)
    }

    /// Reserve a fingerprint for insertion.
    ///
    /// 1. Check the ephemeral marker, then lookup; either resolves an
    ///    existing reservation as a `Duplicate` (or `Locked` while the
    ///    winner's row is not yet visible).
    /// 2. Acquire the dedupe lock; on timeout, check again - the winner's
    ///    marker or row resolves the race, otherwise the submission fails
    ///    `Locked`.
    /// 3. Under the lock, re-check marker and store, then hand the
    ///    reservation to the caller.
    ///
    /// The marker outlives the lock lease (TTL = dedupe window), so a
    /// committed reservation still short-circuits contenders even after a
    /// slow insert let the lease expire.
    pub async fn reserve(
        &self,
        tenant: &TenantId,
        fingerprint: &str,
    ) -> EngineResult<DedupeOutcome> {
        let marker_key = Self::marker_key(tenant, fingerprint);

        // Fast path: a live marker means the fingerprint was committed
        // within the dedupe window
        if self.kv.get(&marker_key).await?.is_some() {
            return match self.intents.find_by_fingerprint(tenant, fingerprint).await? {
                Some(existing) => {
                    self.record_outcome("duplicate");
                    Ok(DedupeOutcome::Duplicate(existing))
                }
                None => Err(EngineError::Locked(format!(
                    "intent with this fingerprint was just committed for tenant {}",
                    tenant
                ))),
            };
        }
        if let Some(existing) = self.intents.find_by_fingerprint(tenant, fingerprint).await? {
            self.record_outcome("duplicate");
            return Ok(DedupeOutcome::Duplicate(existing));
        }

        let options = LockOptions {
            lock_timeout: Duration::from_secs(self.config.ttl_seconds.min(30).max(1)),
            ..Default::default()
        };
        let guard = match self
            .lock
            .acquire(&Self::lock_key(tenant, fingerprint), &options)
            .await?
        {
            Some(guard) => guard,
            None => {
                // Lost the race; whoever holds the lock may have inserted
                return self.resolve_race(tenant, fingerprint, &marker_key).await;
            }
        };

        // Re-check under the lock: the previous holder may have committed
        // (marker set) before this acquirer won the lease
        if self.kv.get(&marker_key).await?.is_some() {
            let row = self.intents.find_by_fingerprint(tenant, fingerprint).await?;
            guard.release().await?;
            return match row {
                Some(existing) => {
                    self.record_outcome("race_resolved");
                    Ok(DedupeOutcome::RaceResolved(existing))
                }
                None => Err(EngineError::Locked(format!(
                    "intent with this fingerprint was just committed for tenant {}",
                    tenant
                ))),
            };
        }
        if let Some(existing) = self.intents.find_by_fingerprint(tenant, fingerprint).await? {
            guard.release().await?;
            self.record_outcome("race_resolved");
            return Ok(DedupeOutcome::RaceResolved(existing));
        }

        self.record_outcome("new");
        Ok(DedupeOutcome::New(DedupeReservation {
            guard,
            kv: self.kv.clone(),
            marker_key,
            marker_ttl: Duration::from_secs(self.config.ttl_seconds),
        }))
    }

    /// After losing the lock race: the winner's marker or row resolves to
    /// `RaceResolved`, anything else is `Locked`.
    async fn resolve_race(
        &self,
        tenant: &TenantId,
        fingerprint: &str,
        marker_key: &str,
    ) -> EngineResult<DedupeOutcome> {
        let marker = self.kv.get(marker_key).await?.is_some();
        match self.intents.find_by_fingerprint(tenant, fingerprint).await? {
            Some(existing) => {
                self.record_outcome("race_resolved");
                Ok(DedupeOutcome::RaceResolved(existing))
            }
            None if marker => Err(EngineError::Locked(format!(
                "intent with this fingerprint was just committed for tenant {}",
                tenant
            ))),
            None => Err(EngineError::Locked(format!(
                "dedupe reservation for tenant {} is held elsewhere",
                tenant
            ))),
        }
    }

    fn record_outcome(&self, outcome: &str) {
        self.metrics
            .dedupe_outcomes
            .with_label_values(&[outcome])
            .inc();
    }
}
