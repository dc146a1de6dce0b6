//! Circuit breaker - fault tolerance for external dependencies
//!
//! One named state machine per dependency, shared across the process fleet
//! through the ephemeral store so every instance sees the same state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CircuitBreakerConfig;
use crate::error::{EngineError, EngineResult};
use crate::observability::EngineMetrics;
use crate::store::kv::KvStore;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing; calls are rejected immediately
    Open,
    /// Reset timeout elapsed; probe calls allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

/// Persisted breaker record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BreakerRecord {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at_ms: Option<u64>,
    probes_used: u32,
}

impl Default for BreakerRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at_ms: None,
            probes_used: 0,
        }
    }
}

/// Admin-facing breaker status
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at_ms: Option<u64>,
}

/// State TTL; a breaker untouched for a day resets to closed
const STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Circuit breaker for one named dependency
pub struct CircuitBreaker {
    name: String,
    /// Ephemeral-store key the state record lives at
    key: String,
    kv: Arc<dyn KvStore>,
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_probes: u32,
    metrics: Arc<EngineMetrics>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        kv: Arc<dyn KvStore>,
        failure_threshold: u32,
        reset_timeout: Duration,
        half_open_probes: u32,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let name = name.into();
        Self {
            key: format!("circuit:{}", name),
            name,
            kv,
            failure_threshold,
            reset_timeout,
            half_open_probes: half_open_probes.max(1),
            metrics,
        }
    }

    /// Use an explicit store key instead of the `circuit:{name}` default
    /// (webhook endpoints keep their `webhook:circuit:{tenant}:{id}` layout)
    pub fn with_store_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self) -> String {
        self.key.clone()
    }

    fn now_ms() -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }

    fn decode(value: Option<&str>) -> BreakerRecord {
        value
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default()
    }

    fn encode(record: &BreakerRecord) -> String {
        serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string())
    }

    async fn write(&self, record: &BreakerRecord) -> EngineResult<()> {
        self.kv
            .set(&self.key(), &Self::encode(record), Some(STATE_TTL))
            .await
    }

    fn record_transition(&self, from: CircuitState, to: CircuitState) {
        if from == to {
            return;
        }
        tracing::info!(
            breaker = %self.name,
            from = from.as_str(),
            to = to.as_str(),
            "circuit breaker state change"
        );
        self.metrics
            .circuit_transitions
            .with_label_values(&[&self.name, from.as_str(), to.as_str()])
            .inc();
        if to == CircuitState::Open {
            self.metrics
                .circuit_trips
                .with_label_values(&[&self.name])
                .inc();
        }
        self.metrics
            .circuit_state
            .with_label_values(&[&self.name])
            .set(to.gauge_value());
    }

    /// Decide whether a call may proceed, applying the open -> half-open
    /// transition when the reset timeout has elapsed. Returns the admitted
    /// state or `CircuitOpen`.
    async fn admit(&self) -> EngineResult<CircuitState> {
        let reset_ms = self.reset_timeout.as_millis() as u64;
        let now = Self::now_ms();

        let result = self
            .kv
            .fetch_update(
                &self.key(),
                Some(STATE_TTL),
                Box::new(move |current| {
                    let mut record = Self::decode(current);
                    match record.state {
                        CircuitState::Open => {
                            let elapsed = record
                                .opened_at_ms
                                .map(|t| now.saturating_sub(t))
                                .unwrap_or(0);
                            if elapsed >= reset_ms {
                                record.state = CircuitState::HalfOpen;
                                record.probes_used = 1;
                            }
                        }
                        CircuitState::HalfOpen => {
                            record.probes_used += 1;
                        }
                        CircuitState::Closed => {}
                    }
                    Some(Self::encode(&record))
                }),
            )
            .await?;

        let record = Self::decode(result.as_deref());
        match record.state {
            CircuitState::Open => Err(EngineError::CircuitOpen(self.name.clone())),
            CircuitState::HalfOpen if record.probes_used > self.half_open_probes => {
                Err(EngineError::CircuitOpen(self.name.clone()))
            }
            state => Ok(state),
        }
    }

    /// Record a successful call
    pub async fn on_success(&self) -> EngineResult<()> {
        let before = self.status().await?.state;
        let record = BreakerRecord::default();
        self.write(&record).await?;
        self.record_transition(before, CircuitState::Closed);
        Ok(())
    }

    /// Record a failed call
    pub async fn on_failure(&self) -> EngineResult<()> {
        let threshold = self.failure_threshold;
        let now = Self::now_ms();
        let before = self.status().await?.state;

        let result = self
            .kv
            .fetch_update(
                &self.key(),
                Some(STATE_TTL),
                Box::new(move |current| {
                    let mut record = Self::decode(current);
                    match record.state {
                        // A failed probe re-opens immediately
                        CircuitState::HalfOpen => {
                            record.state = CircuitState::Open;
                            record.opened_at_ms = Some(now);
                            record.consecutive_failures += 1;
                            record.probes_used = 0;
                        }
                        _ => {
                            record.consecutive_failures += 1;
                            if record.consecutive_failures >= threshold {
                                record.state = CircuitState::Open;
                                record.opened_at_ms = Some(now);
                            }
                        }
                    }
                    Some(Self::encode(&record))
                }),
            )
            .await?;

        let after = Self::decode(result.as_deref()).state;
        self.record_transition(before, after);
        Ok(())
    }

    /// Execute an operation under the breaker.
    ///
    /// Rejected calls return `CircuitOpen` without invoking the operation;
    /// the operation's own error is passed through after being recorded as a
    /// failure.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        match self.admit().await {
            Ok(_) => {}
            Err(e) => {
                self.metrics
                    .circuit_executions
                    .with_label_values(&[&self.name, "rejected"])
                    .inc();
                return Err(e);
            }
        }

        match operation().await {
            Ok(result) => {
                self.metrics
                    .circuit_executions
                    .with_label_values(&[&self.name, "success"])
                    .inc();
                self.on_success().await?;
                Ok(result)
            }
            Err(e) => {
                self.metrics
                    .circuit_executions
                    .with_label_values(&[&self.name, "failure"])
                    .inc();
                self.on_failure().await?;
                Err(e)
            }
        }
    }

    /// Whether calls are currently rejected
    pub async fn is_open(&self) -> EngineResult<bool> {
        Ok(self.status().await?.state == CircuitState::Open)
    }

    /// Force the breaker open (admin surface)
    pub async fn force_open(&self) -> EngineResult<()> {
        let before = self.status().await?.state;
        let record = BreakerRecord {
            state: CircuitState::Open,
            consecutive_failures: self.failure_threshold,
            opened_at_ms: Some(Self::now_ms()),
            probes_used: 0,
        };
        self.write(&record).await?;
        self.record_transition(before, CircuitState::Open);
        Ok(())
    }

    /// Force the breaker closed (admin surface)
    pub async fn force_close(&self) -> EngineResult<()> {
        self.on_success().await
    }

    /// Reset to the initial closed state
    pub async fn reset(&self) -> EngineResult<()> {
        self.on_success().await
    }

    /// Current status
    pub async fn status(&self) -> EngineResult<BreakerStatus> {
        let record = Self::decode(self.kv.get(&self.key()).await?.as_deref());
        Ok(BreakerStatus {
            name: self.name.clone(),
            state: record.state,
            consecutive_failures: record.consecutive_failures,
            opened_at_ms: record.opened_at_ms,
        })
    }
}

/// Registry of named breakers, constructed once at startup
pub struct CircuitBreakerRegistry {
    kv: Arc<dyn KvStore>,
    config: CircuitBreakerConfig,
    metrics: Arc<EngineMetrics>,
    breakers: parking_lot::RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        kv: Arc<dyn KvStore>,
        config: CircuitBreakerConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            kv,
            config,
            metrics,
            breakers: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for a named dependency
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return breaker.clone();
        }
        let (threshold, reset, probes) = self.config.for_dependency(name);
        let breaker = Arc::new(CircuitBreaker::new(
            name,
            self.kv.clone(),
            threshold,
            reset,
            probes,
            self.metrics.clone(),
        ));
        self.breakers
            .write()
            .entry(name.to_string())
            .or_insert(breaker)
            .clone()
    }

    /// Get or create a breaker with explicit settings (webhook endpoints
    /// carry their own thresholds)
    pub fn get_with(
        &self,
        name: &str,
        failure_threshold: u32,
        reset_timeout: Duration,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return breaker.clone();
        }
        let breaker = Arc::new(
            CircuitBreaker::new(
                name,
                self.kv.clone(),
                failure_threshold,
                reset_timeout,
                self.config.half_open_probes,
                self.metrics.clone(),
            )
            .with_store_key(name),
        );
        self.breakers
            .write()
            .entry(name.to_string())
            .or_insert(breaker)
            .clone()
    }

    /// Names of every breaker created so far
    pub fn names(&self) -> Vec<String> {
        self.breakers.read().keys().cloned().collect()
    }
}
