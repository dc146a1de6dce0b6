//! Engine configuration
//!
//! Provides configuration defaults, validation, and environment-based
//! overrides (`VORION_*`).

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Intent types with dedicated limit/gate configuration. Types outside this
/// set fall through to the default rate limit.
pub const KNOWN_INTENT_TYPES: [&str; 4] = ["default", "high-risk", "data-export", "admin-action"];

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Handlers per stage queue
    pub queue_concurrency: usize,
    /// Retry budget for stage jobs
    pub max_retries: u32,
    /// Base backoff between job retries (milliseconds)
    pub retry_backoff_ms: u64,
    /// Per-job processing deadline (milliseconds)
    pub job_timeout_ms: u64,
    /// Event retention horizon (days); enforced by the retention scheduler
    pub event_retention_days: u32,
    /// Soft-deleted intent retention horizon (days)
    pub soft_delete_retention_days: u32,
    /// Production mode tightens the webhook SSRF guard
    pub production: bool,
    /// Key for context encryption and webhook-secret envelopes (hex, 32 bytes)
    pub encryption_key: Option<String>,
    /// Dedupe fingerprinting and reservation
    pub dedupe: DedupeConfig,
    /// Context/metadata handling at intake
    pub intake: IntakeConfig,
    /// Trust gate thresholds
    pub trust: TrustConfig,
    /// Sliding-window rate limits
    pub rate_limits: RateLimitsConfig,
    /// Per-tenant in-flight intent caps
    pub concurrency: TenantConcurrencyConfig,
    /// Outbound webhook behavior
    pub webhook: WebhookConfig,
    /// Sandbox resource limits
    pub cognigate: SandboxConfig,
    /// Circuit breaker defaults and per-dependency overrides
    pub circuit_breakers: CircuitBreakerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_concurrency: 10,
            max_retries: 3,
            retry_backoff_ms: 1000,
            job_timeout_ms: 30_000,
            event_retention_days: 90,
            soft_delete_retention_days: 30,
            production: false,
            encryption_key: None,
            dedupe: DedupeConfig::default(),
            intake: IntakeConfig::default(),
            trust: TrustConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            concurrency: TenantConcurrencyConfig::default(),
            webhook: WebhookConfig::default(),
            cognigate: SandboxConfig::default(),
            circuit_breakers: CircuitBreakerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, starting from defaults
    pub fn from_env() -> EngineResult<Self> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("VORION_QUEUE_CONCURRENCY") {
            config.queue_concurrency = parse_env("VORION_QUEUE_CONCURRENCY", &val)?;
        }
        if let Ok(val) = std::env::var("VORION_MAX_RETRIES") {
            config.max_retries = parse_env("VORION_MAX_RETRIES", &val)?;
        }
        if let Ok(val) = std::env::var("VORION_RETRY_BACKOFF_MS") {
            config.retry_backoff_ms = parse_env("VORION_RETRY_BACKOFF_MS", &val)?;
        }
        if let Ok(val) = std::env::var("VORION_JOB_TIMEOUT_MS") {
            config.job_timeout_ms = parse_env("VORION_JOB_TIMEOUT_MS", &val)?;
        }
        if let Ok(val) = std::env::var("VORION_DEDUPE_SECRET") {
            config.dedupe.secret = Some(val);
        }
        if let Ok(val) = std::env::var("VORION_ENCRYPTION_KEY") {
            config.encryption_key = Some(val);
        }
        if let Ok(val) = std::env::var("VORION_ENV") {
            config.production = val == "production";
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> EngineResult<()> {
        if self.queue_concurrency == 0 {
            return Err(EngineError::Validation(
                "queue_concurrency must be at least 1".to_string(),
            ));
        }
        if self.job_timeout_ms == 0 {
            return Err(EngineError::Validation(
                "job_timeout_ms must be positive".to_string(),
            ));
        }
        if let Some(key) = &self.encryption_key {
            let decoded = hex::decode(key)
                .map_err(|e| EngineError::Validation(format!("encryption_key is not hex: {}", e)))?;
            if decoded.len() != 32 {
                return Err(EngineError::Validation(
                    "encryption_key must be 32 bytes of hex".to_string(),
                ));
            }
        }
        self.rate_limits.validate()?;
        self.webhook.validate()?;
        self.cognigate.validate()?;
        Ok(())
    }

    /// Job lease duration: stage timeout plus a safety margin (at least 5 s)
    pub fn job_lease(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms) + Duration::from_secs(5)
    }
}

/// Dedupe fingerprinting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    /// HMAC key for fingerprints; absent in development falls back to a
    /// plain hash (logged once)
    pub secret: Option<String>,
    /// TTL of the reservation marker (seconds)
    pub ttl_seconds: u64,
    /// Width of the fingerprint time bucket (seconds)
    pub timestamp_window_seconds: u64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ttl_seconds: 300,
            timestamp_window_seconds: 300,
        }
    }
}

/// Intake payload handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Dot-paths within context/metadata replaced by the redaction token
    pub sensitive_paths: Vec<String>,
    /// Encrypt context and metadata at rest
    pub encrypt_context: bool,
    /// Skip the consent-registry check
    pub bypass_consent: bool,
    /// Skip the intake trust gate
    pub bypass_trust_gate: bool,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            sensitive_paths: Vec::new(),
            encrypt_context: false,
            bypass_consent: false,
            bypass_trust_gate: false,
        }
    }
}

/// Trust gate thresholds per intent type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Minimum level for types without an explicit gate
    pub default_min_level: u8,
    /// Per-type minimum levels
    pub gates: HashMap<String, u8>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        let mut gates = HashMap::new();
        gates.insert("high-risk".to_string(), 3);
        gates.insert("data-export".to_string(), 2);
        gates.insert("admin-action".to_string(), 4);
        Self {
            default_min_level: 1,
            gates,
        }
    }
}

impl TrustConfig {
    /// Required trust level for an intent type
    pub fn required_level(&self, intent_type: Option<&str>) -> u8 {
        intent_type
            .and_then(|t| self.gates.get(t))
            .copied()
            .unwrap_or(self.default_min_level)
    }
}

/// One sliding-window limit
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u64,
    pub window_seconds: u64,
}

/// Rate limit configuration per intent type, with tenant overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub default: RateLimit,
    pub high_risk: RateLimit,
    pub data_export: RateLimit,
    pub admin_action: RateLimit,
    /// Per-entity limit layered on top of the tenant window
    pub entity: RateLimit,
    /// Tenant-specific overrides take precedence over type limits
    pub tenant_overrides: HashMap<String, RateLimit>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            default: RateLimit {
                limit: 100,
                window_seconds: 60,
            },
            high_risk: RateLimit {
                limit: 10,
                window_seconds: 60,
            },
            data_export: RateLimit {
                limit: 5,
                window_seconds: 300,
            },
            admin_action: RateLimit {
                limit: 20,
                window_seconds: 60,
            },
            entity: RateLimit {
                limit: 50,
                window_seconds: 60,
            },
            tenant_overrides: HashMap::new(),
        }
    }
}

impl RateLimitsConfig {
    /// Resolve the limit for (tenant, type): tenant override, then type
    /// limit, then the service default
    pub fn resolve(&self, tenant: &str, intent_type: Option<&str>) -> RateLimit {
        if let Some(limit) = self.tenant_overrides.get(tenant) {
            return *limit;
        }
        match intent_type {
            Some("high-risk") => self.high_risk,
            Some("data-export") => self.data_export,
            Some("admin-action") => self.admin_action,
            Some("default") | None => self.default,
            Some(other) => {
                tracing::debug!(intent_type = other, "unknown intent type, using default rate limit");
                self.default
            }
        }
    }

    fn validate(&self) -> EngineResult<()> {
        for (name, limit) in [
            ("default", self.default),
            ("high_risk", self.high_risk),
            ("data_export", self.data_export),
            ("admin_action", self.admin_action),
            ("entity", self.entity),
        ] {
            if limit.limit == 0 || limit.window_seconds == 0 {
                return Err(EngineError::Validation(format!(
                    "rate limit {} must have positive limit and window",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Per-tenant in-flight intent caps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConcurrencyConfig {
    pub default_max_in_flight: u64,
    pub tenant_max_in_flight: HashMap<String, u64>,
}

impl Default for TenantConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_max_in_flight: 100,
            tenant_max_in_flight: HashMap::new(),
        }
    }
}

impl TenantConcurrencyConfig {
    /// In-flight cap for a tenant
    pub fn max_in_flight(&self, tenant: &str) -> u64 {
        self.tenant_max_in_flight
            .get(tenant)
            .copied()
            .unwrap_or(self.default_max_in_flight)
    }
}

/// Outbound webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Per-attempt delivery timeout (milliseconds, clamped 1000..60000)
    pub timeout_ms: u64,
    /// Delivery attempts per event
    pub retry_attempts: u32,
    /// Base delay between delivery attempts (milliseconds)
    pub retry_delay_ms: u64,
    /// Permit delivery when DNS re-resolution no longer matches the pin
    pub allow_dns_change: bool,
    /// Consecutive failures before an endpoint's breaker opens
    pub circuit_failure_threshold: u32,
    /// Open-state duration before a probe is allowed (milliseconds)
    pub circuit_reset_timeout_ms: u64,
    /// Concurrent deliveries per dispatch batch
    pub dispatch_concurrency: usize,
    /// Signature timestamp tolerance for verification (seconds)
    pub signature_tolerance_s: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            allow_dns_change: false,
            circuit_failure_threshold: 5,
            circuit_reset_timeout_ms: 300_000,
            dispatch_concurrency: 10,
            signature_tolerance_s: 300,
        }
    }
}

impl WebhookConfig {
    /// Delivery timeout clamped to the supported 1s..60s range
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.clamp(1000, 60_000))
    }

    fn validate(&self) -> EngineResult<()> {
        if self.dispatch_concurrency == 0 {
            return Err(EngineError::Validation(
                "webhook dispatch_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sandbox resource limits handed to the execution collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_memory_mb: u64,
    pub max_cpu_percent: u8,
    /// Wall-clock execution timeout (milliseconds)
    pub timeout_ms: u64,
    /// Concurrent executions across the process
    pub max_concurrent: usize,
    /// Optional network operation cap
    pub max_network_ops: Option<u64>,
    /// Optional filesystem operation cap
    pub max_fs_ops: Option<u64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            max_cpu_percent: 50,
            timeout_ms: 30_000,
            max_concurrent: 4,
            max_network_ops: None,
            max_fs_ops: None,
        }
    }
}

impl SandboxConfig {
    fn validate(&self) -> EngineResult<()> {
        if self.max_cpu_percent == 0 || self.max_cpu_percent > 100 {
            return Err(EngineError::Validation(
                "cognigate max_cpu_percent must be in 1..=100".to_string(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(EngineError::Validation(
                "cognigate max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker defaults and named-dependency overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// Probe calls allowed while half-open
    pub half_open_probes: u32,
    /// Per-dependency overrides keyed by breaker name
    pub overrides: HashMap<String, CircuitBreakerOverride>,
}

/// Override for one named dependency
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct CircuitBreakerOverride {
    pub failure_threshold: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_probes: 1,
            overrides: HashMap::new(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Effective settings for a named dependency
    pub fn for_dependency(&self, name: &str) -> (u32, Duration, u32) {
        let overridden = self.overrides.get(name);
        let threshold = overridden
            .and_then(|o| o.failure_threshold)
            .unwrap_or(self.failure_threshold);
        let reset = overridden
            .and_then(|o| o.reset_timeout_ms)
            .unwrap_or(self.reset_timeout_ms);
        (threshold, Duration::from_millis(reset), self.half_open_probes)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> EngineResult<T> {
    value
        .parse()
        .map_err(|_| EngineError::Validation(format!("invalid value for {}: {}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rate_limit_resolution_order() {
        let mut config = RateLimitsConfig::default();
        config.tenant_overrides.insert(
            "t-special".to_string(),
            RateLimit {
                limit: 7,
                window_seconds: 10,
            },
        );

        // Tenant override wins even for a typed intent
        assert_eq!(config.resolve("t-special", Some("high-risk")).limit, 7);
        // Typed limit
        assert_eq!(config.resolve("t-other", Some("high-risk")).limit, 10);
        // Unknown type falls through to the default limit
        assert_eq!(config.resolve("t-other", Some("exotic")).limit, 100);
    }

    #[test]
    fn test_trust_gate_lookup() {
        let trust = TrustConfig::default();
        assert_eq!(trust.required_level(Some("high-risk")), 3);
        assert_eq!(trust.required_level(Some("unknown-type")), 1);
        assert_eq!(trust.required_level(None), 1);
    }

    #[test]
    fn test_webhook_timeout_clamped() {
        let mut webhook = WebhookConfig::default();
        webhook.timeout_ms = 10;
        assert_eq!(webhook.timeout(), Duration::from_secs(1));
        webhook.timeout_ms = 600_000;
        assert_eq!(webhook.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_bad_encryption_key_rejected() {
        let mut config = EngineConfig::default();
        config.encryption_key = Some("abcd".to_string());
        assert!(config.validate().is_err());
    }
}
