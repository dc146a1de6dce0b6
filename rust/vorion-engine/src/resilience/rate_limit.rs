//! Sliding-window rate limiter with atomic check-and-consume
//!
//! Windows live in the shared ephemeral store as ordered sets of
//! (timestamp, opaque id). Evict-count-insert runs as one indivisible store
//! operation, so two concurrent callers can never both pass when a single
//! slot remains. Store failures propagate; the engine fails closed.

use std::sync::Arc;
use uuid::Uuid;

use crate::config::{RateLimit, RateLimitsConfig};
use crate::error::EngineResult;
use crate::intent::{EntityId, TenantId};
use crate::observability::EngineMetrics;
use crate::store::kv::{KvStore, WindowSpec, WindowStatus};

/// Outcome of a check-and-consume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Window occupancy after the operation
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the oldest entry leaves the window
    pub reset_in_s: u64,
    /// Present when denied
    pub retry_after_s: Option<u64>,
    /// Which limit blocked ("tenant" or "entity"), when denied
    pub blocked_scope: Option<&'static str>,
}

impl RateLimitDecision {
    fn from_counts(allowed: bool, current: u64, limit: u64, reset_in_s: u64) -> Self {
        Self {
            allowed,
            current,
            limit,
            remaining: limit.saturating_sub(current),
            reset_in_s,
            retry_after_s: (!allowed).then_some(reset_in_s),
            blocked_scope: None,
        }
    }
}

/// Sliding-window rate limiter over the shared store
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    config: RateLimitsConfig,
    metrics: Arc<EngineMetrics>,
}

impl RateLimiter {
    pub fn new(
        kv: Arc<dyn KvStore>,
        config: RateLimitsConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            kv,
            config,
            metrics,
        }
    }

    fn tenant_key(tenant: &TenantId, intent_type: Option<&str>) -> String {
        format!(
            "ratelimit:{}:{}",
            tenant,
            intent_type.unwrap_or("default")
        )
    }

    fn entity_key(tenant: &TenantId, entity: &EntityId) -> String {
        format!("ratelimit:entity:{}:{}", tenant, entity)
    }

    fn now_ms() -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }

    fn reset_in_s(oldest_ms: Option<u64>, window_ms: u64, now_ms: u64) -> u64 {
        match oldest_ms {
            Some(oldest) => {
                let expires = oldest + window_ms;
                expires.saturating_sub(now_ms).div_ceil(1000)
            }
            None => 0,
        }
    }

    /// Check and consume one slot for (tenant[, entity]).
    ///
    /// With an entity, a single atomic operation covers both windows and
    /// consumes from both or neither.
    pub async fn check_and_consume(
        &self,
        tenant: &TenantId,
        entity: Option<&EntityId>,
        intent_type: Option<&str>,
    ) -> EngineResult<RateLimitDecision> {
        let limit = self.config.resolve(tenant.as_str(), intent_type);
        let now = Self::now_ms();
        let window_ms = limit.window_seconds * 1000;
        let member = Uuid::new_v4().to_string();
        let key = Self::tenant_key(tenant, intent_type);

        let decision = match entity {
            None => {
                let result = self
                    .kv
                    .window_consume(&key, now, window_ms, limit.limit, &member)
                    .await?;
                let reset = Self::reset_in_s(result.oldest_ms, window_ms, now);
                let mut decision =
                    RateLimitDecision::from_counts(result.allowed, result.current, limit.limit, reset);
                if !decision.allowed {
                    decision.blocked_scope = Some("tenant");
                }
                decision
            }
            Some(entity) => {
                let entity_limit = self.config.entity;
                let entity_window_ms = entity_limit.window_seconds * 1000;
                let result = self
                    .kv
                    .window_consume_pair(
                        &WindowSpec {
                            key,
                            limit: limit.limit,
                            window_ms,
                        },
                        &WindowSpec {
                            key: Self::entity_key(tenant, entity),
                            limit: entity_limit.limit,
                            window_ms: entity_window_ms,
                        },
                        now,
                        &member,
                    )
                    .await?;

                self.metrics
                    .rate_limit_checks
                    .with_label_values(&[
                        "entity",
                        if result.allowed { "allowed" } else { "denied" },
                    ])
                    .inc();

                match result.blocked_by {
                    Some(crate::store::kv::BlockedBy::Secondary) => {
                        let reset =
                            Self::reset_in_s(result.secondary.oldest_ms, entity_window_ms, now);
                        let mut decision = RateLimitDecision::from_counts(
                            false,
                            result.secondary.count,
                            entity_limit.limit,
                            reset,
                        );
                        decision.blocked_scope = Some("entity");
                        decision
                    }
                    Some(crate::store::kv::BlockedBy::Primary) => {
                        let reset = Self::reset_in_s(result.primary.oldest_ms, window_ms, now);
                        let mut decision = RateLimitDecision::from_counts(
                            false,
                            result.primary.count,
                            limit.limit,
                            reset,
                        );
                        decision.blocked_scope = Some("tenant");
                        decision
                    }
                    None => {
                        let reset = Self::reset_in_s(result.primary.oldest_ms, window_ms, now);
                        RateLimitDecision::from_counts(
                            true,
                            result.primary.count,
                            limit.limit,
                            reset,
                        )
                    }
                }
            }
        };

        let scope = decision.blocked_scope.unwrap_or("tenant");
        self.metrics
            .rate_limit_checks
            .with_label_values(&[scope, if decision.allowed { "allowed" } else { "denied" }])
            .inc();
        if decision.limit > 0 {
            self.metrics
                .rate_limit_usage
                .observe(decision.current as f64 / decision.limit as f64);
        }
        if !decision.allowed {
            self.metrics
                .rate_limit_denials
                .with_label_values(&[scope])
                .inc();
        }

        Ok(decision)
    }

    /// Read a window without consuming
    pub async fn status(
        &self,
        tenant: &TenantId,
        intent_type: Option<&str>,
    ) -> EngineResult<RateLimitDecision> {
        let limit = self.config.resolve(tenant.as_str(), intent_type);
        let now = Self::now_ms();
        let window_ms = limit.window_seconds * 1000;
        let WindowStatus { count, oldest_ms } = self
            .kv
            .window_status(&Self::tenant_key(tenant, intent_type), now, window_ms)
            .await?;
        let reset = Self::reset_in_s(oldest_ms, window_ms, now);
        Ok(RateLimitDecision::from_counts(
            count < limit.limit,
            count,
            limit.limit,
            reset,
        ))
    }

    /// Effective limit for a tenant and type
    pub fn resolve_limit(&self, tenant: &TenantId, intent_type: Option<&str>) -> RateLimit {
        self.config.resolve(tenant.as_str(), intent_type)
    }
}
