//! Prometheus metrics for the intent engine
//!
//! One [`EngineMetrics`] instance is registered per engine on a caller-owned
//! registry; exposition is the metrics collaborator's concern.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};

use crate::error::{EngineError, EngineResult};

/// Metric instruments emitted by the engine
pub struct EngineMetrics {
    // Intent lifecycle
    pub intents_submitted: IntCounterVec,
    pub status_transitions: IntCounterVec,
    pub intents_by_status: IntGaugeVec,
    pub processing_duration: HistogramVec,
    pub context_bytes: Histogram,

    // Trust
    pub trust_gate_evaluations: IntCounterVec,
    pub trust_level_at_submission: Histogram,
    pub trust_drift: Histogram,
    pub trust_drift_severity: IntCounterVec,
    pub trust_degradations: IntCounter,
    pub trust_fetch_duration: Histogram,

    // Queues
    pub queue_depth: IntGaugeVec,
    pub queue_active: IntGaugeVec,
    pub jobs_processed: IntCounterVec,
    pub job_duration: HistogramVec,
    pub dlq_size: IntGauge,

    // Circuit breakers
    pub circuit_state: IntGaugeVec,
    pub circuit_transitions: IntCounterVec,
    pub circuit_trips: IntCounterVec,
    pub circuit_executions: IntCounterVec,

    // Rate limiting
    pub rate_limit_checks: IntCounterVec,
    pub rate_limit_usage: Histogram,
    pub rate_limit_denials: IntCounterVec,

    // Webhooks
    pub webhook_deliveries: IntCounterVec,
    pub webhook_batch_duration: Histogram,
    pub webhook_in_flight: IntGauge,

    // Execution
    pub executions: IntCounterVec,
    pub execution_duration: Histogram,
    pub execution_memory_peak_mb: Histogram,
    pub executions_in_progress: IntGauge,

    // Coordination
    pub lock_acquisitions: IntCounterVec,
    pub dedupe_outcomes: IntCounterVec,

    // Policy
    pub policy_evaluations: IntCounterVec,
    pub policy_duration: Histogram,
    pub policy_overrides: IntCounter,
}

impl EngineMetrics {
    /// Build and register every instrument on the given registry
    pub fn new(registry: &Registry) -> EngineResult<Self> {
        let metrics = Self {
            intents_submitted: IntCounterVec::new(
                Opts::new("vorion_intents_submitted_total", "Intents accepted at intake"),
                &["intent_type"],
            )
            .map_err(internal)?,
            status_transitions: IntCounterVec::new(
                Opts::new(
                    "vorion_intent_status_transitions_total",
                    "Intent status transitions",
                ),
                &["from", "to"],
            )
            .map_err(internal)?,
            intents_by_status: IntGaugeVec::new(
                Opts::new("vorion_intents_current", "Intents currently in each status"),
                &["status"],
            )
            .map_err(internal)?,
            processing_duration: HistogramVec::new(
                HistogramOpts::new(
                    "vorion_intent_processing_duration_seconds",
                    "Stage handler duration",
                ),
                &["stage"],
            )
            .map_err(internal)?,
            context_bytes: Histogram::with_opts(
                HistogramOpts::new("vorion_intent_context_bytes", "Serialized context size")
                    .buckets(prometheus::exponential_buckets(64.0, 4.0, 8).map_err(internal)?),
            )
            .map_err(internal)?,

            trust_gate_evaluations: IntCounterVec::new(
                Opts::new("vorion_trust_gate_evaluations_total", "Trust gate checks"),
                &["outcome"],
            )
            .map_err(internal)?,
            trust_level_at_submission: Histogram::with_opts(
                HistogramOpts::new(
                    "vorion_trust_level_at_submission",
                    "Entity trust level at intake",
                )
                .buckets(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
            )
            .map_err(internal)?,
            trust_drift: Histogram::with_opts(
                HistogramOpts::new(
                    "vorion_trust_drift",
                    "Snapshot score minus decision-time score",
                )
                .buckets(vec![-100.0, -50.0, -20.0, 0.0, 20.0, 50.0, 100.0]),
            )
            .map_err(internal)?,
            trust_drift_severity: IntCounterVec::new(
                Opts::new(
                    "vorion_trust_drift_severity_total",
                    "Trust drift beyond severity thresholds",
                ),
                &["severity"],
            )
            .map_err(internal)?,
            trust_degradations: IntCounter::new(
                "vorion_trust_degradations_total",
                "Decisions made on cached or defaulted trust",
            )
            .map_err(internal)?,
            trust_fetch_duration: Histogram::with_opts(HistogramOpts::new(
                "vorion_trust_fetch_duration_seconds",
                "Decision-time trust fetch duration",
            ))
            .map_err(internal)?,

            queue_depth: IntGaugeVec::new(
                Opts::new("vorion_queue_depth", "Jobs waiting per stage"),
                &["stage"],
            )
            .map_err(internal)?,
            queue_active: IntGaugeVec::new(
                Opts::new("vorion_queue_active", "Jobs in flight per stage"),
                &["stage"],
            )
            .map_err(internal)?,
            jobs_processed: IntCounterVec::new(
                Opts::new("vorion_jobs_processed_total", "Stage jobs processed"),
                &["stage", "outcome"],
            )
            .map_err(internal)?,
            job_duration: HistogramVec::new(
                HistogramOpts::new(
                    "vorion_job_processing_duration_seconds",
                    "Stage job duration",
                ),
                &["stage"],
            )
            .map_err(internal)?,
            dlq_size: IntGauge::new("vorion_dlq_size", "Dead-letter queue size")
                .map_err(internal)?,

            circuit_state: IntGaugeVec::new(
                Opts::new(
                    "vorion_circuit_state",
                    "Breaker state (0 closed, 1 half-open, 2 open)",
                ),
                &["name"],
            )
            .map_err(internal)?,
            circuit_transitions: IntCounterVec::new(
                Opts::new("vorion_circuit_transitions_total", "Breaker state changes"),
                &["name", "from", "to"],
            )
            .map_err(internal)?,
            circuit_trips: IntCounterVec::new(
                Opts::new("vorion_circuit_trips_total", "Breaker open events"),
                &["name"],
            )
            .map_err(internal)?,
            circuit_executions: IntCounterVec::new(
                Opts::new("vorion_circuit_executions_total", "Calls through breakers"),
                &["name", "outcome"],
            )
            .map_err(internal)?,

            rate_limit_checks: IntCounterVec::new(
                Opts::new("vorion_rate_limit_checks_total", "Rate limit checks"),
                &["scope", "outcome"],
            )
            .map_err(internal)?,
            rate_limit_usage: Histogram::with_opts(
                HistogramOpts::new(
                    "vorion_rate_limit_usage_ratio",
                    "Window occupancy at check time",
                )
                .buckets(vec![0.1, 0.25, 0.5, 0.75, 0.9, 1.0]),
            )
            .map_err(internal)?,
            rate_limit_denials: IntCounterVec::new(
                Opts::new("vorion_rate_limit_denials_total", "Denied rate limit checks"),
                &["scope"],
            )
            .map_err(internal)?,

            webhook_deliveries: IntCounterVec::new(
                Opts::new("vorion_webhook_deliveries_total", "Webhook delivery outcomes"),
                &["outcome"],
            )
            .map_err(internal)?,
            webhook_batch_duration: Histogram::with_opts(HistogramOpts::new(
                "vorion_webhook_batch_duration_seconds",
                "Fan-out batch duration",
            ))
            .map_err(internal)?,
            webhook_in_flight: IntGauge::new(
                "vorion_webhook_in_flight",
                "Deliveries currently in flight",
            )
            .map_err(internal)?,

            executions: IntCounterVec::new(
                Opts::new("vorion_executions_total", "Sandbox executions"),
                &["outcome"],
            )
            .map_err(internal)?,
            execution_duration: Histogram::with_opts(HistogramOpts::new(
                "vorion_execution_duration_seconds",
                "Sandbox execution duration",
            ))
            .map_err(internal)?,
            execution_memory_peak_mb: Histogram::with_opts(
                HistogramOpts::new(
                    "vorion_execution_memory_peak_mb",
                    "Sandbox peak memory",
                )
                .buckets(prometheus::exponential_buckets(16.0, 2.0, 8).map_err(internal)?),
            )
            .map_err(internal)?,
            executions_in_progress: IntGauge::new(
                "vorion_executions_in_progress",
                "Sandbox executions in progress",
            )
            .map_err(internal)?,

            lock_acquisitions: IntCounterVec::new(
                Opts::new("vorion_lock_acquisitions_total", "Distributed lock attempts"),
                &["outcome"],
            )
            .map_err(internal)?,
            dedupe_outcomes: IntCounterVec::new(
                Opts::new("vorion_dedupe_total", "Dedupe reservation outcomes"),
                &["outcome"],
            )
            .map_err(internal)?,

            policy_evaluations: IntCounterVec::new(
                Opts::new("vorion_policy_evaluations_total", "Policy engine evaluations"),
                &["outcome"],
            )
            .map_err(internal)?,
            policy_duration: Histogram::with_opts(HistogramOpts::new(
                "vorion_policy_evaluation_duration_seconds",
                "Policy evaluation duration",
            ))
            .map_err(internal)?,
            policy_overrides: IntCounter::new(
                "vorion_policy_overrides_total",
                "Decisions where policy overrode the rule action",
            )
            .map_err(internal)?,
        };

        metrics.register_all(registry)?;
        Ok(metrics)
    }

    fn register_all(&self, registry: &Registry) -> EngineResult<()> {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(self.intents_submitted.clone()),
            Box::new(self.status_transitions.clone()),
            Box::new(self.intents_by_status.clone()),
            Box::new(self.processing_duration.clone()),
            Box::new(self.context_bytes.clone()),
            Box::new(self.trust_gate_evaluations.clone()),
            Box::new(self.trust_level_at_submission.clone()),
            Box::new(self.trust_drift.clone()),
            Box::new(self.trust_drift_severity.clone()),
            Box::new(self.trust_degradations.clone()),
            Box::new(self.trust_fetch_duration.clone()),
            Box::new(self.queue_depth.clone()),
            Box::new(self.queue_active.clone()),
            Box::new(self.jobs_processed.clone()),
            Box::new(self.job_duration.clone()),
            Box::new(self.dlq_size.clone()),
            Box::new(self.circuit_state.clone()),
            Box::new(self.circuit_transitions.clone()),
            Box::new(self.circuit_trips.clone()),
            Box::new(self.circuit_executions.clone()),
            Box::new(self.rate_limit_checks.clone()),
            Box::new(self.rate_limit_usage.clone()),
            Box::new(self.rate_limit_denials.clone()),
            Box::new(self.webhook_deliveries.clone()),
            Box::new(self.webhook_batch_duration.clone()),
            Box::new(self.webhook_in_flight.clone()),
            Box::new(self.executions.clone()),
            Box::new(self.execution_duration.clone()),
            Box::new(self.execution_memory_peak_mb.clone()),
            Box::new(self.executions_in_progress.clone()),
            Box::new(self.lock_acquisitions.clone()),
            Box::new(self.dedupe_outcomes.clone()),
            Box::new(self.policy_evaluations.clone()),
            Box::new(self.policy_duration.clone()),
            Box::new(self.policy_overrides.clone()),
        ];
        for collector in collectors {
            registry.register(collector).map_err(internal)?;
        }
        Ok(())
    }

    /// Record a trust drift observation with severity bucketing
    pub fn observe_drift(&self, drift: i64) {
        self.trust_drift.observe(drift as f64);
        let magnitude = drift.unsigned_abs();
        if magnitude >= 100 {
            self.trust_drift_severity.with_label_values(&["severe"]).inc();
        } else if magnitude >= 50 {
            self.trust_drift_severity
                .with_label_values(&["moderate"])
                .inc();
        } else if magnitude >= 20 {
            self.trust_drift_severity.with_label_values(&["minor"]).inc();
        }
    }
}

fn internal<E: std::fmt::Display>(e: E) -> EngineError {
    EngineError::Internal(format!("metrics registration failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new();
        let metrics = EngineMetrics::new(&registry).unwrap();
        metrics
            .intents_submitted
            .with_label_values(&["default"])
            .inc();
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "vorion_intents_submitted_total"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        EngineMetrics::new(&registry).unwrap();
        assert!(EngineMetrics::new(&registry).is_err());
    }

    #[test]
    fn test_drift_severity_buckets() {
        let registry = Registry::new();
        let metrics = EngineMetrics::new(&registry).unwrap();
        metrics.observe_drift(25);
        metrics.observe_drift(-60);
        metrics.observe_drift(150);
        assert_eq!(
            metrics
                .trust_drift_severity
                .with_label_values(&["minor"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .trust_drift_severity
                .with_label_values(&["moderate"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .trust_drift_severity
                .with_label_values(&["severe"])
                .get(),
            1
        );
    }
}
