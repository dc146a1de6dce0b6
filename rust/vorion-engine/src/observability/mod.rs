//! Observability: metrics, tracing setup, and trace-context propagation

pub mod metrics;

pub use metrics::EngineMetrics;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// W3C trace context carried by stage jobs and outbound webhooks
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceContext {
    pub traceparent: Option<String>,
    pub tracestate: Option<String>,
}

impl TraceContext {
    /// Start a fresh trace with a sampled root span
    pub fn new_root() -> Self {
        let mut rng = rand::thread_rng();
        let mut trace_id = [0u8; 16];
        let mut span_id = [0u8; 8];
        rng.fill_bytes(&mut trace_id);
        rng.fill_bytes(&mut span_id);
        Self {
            traceparent: Some(format!(
                "00-{}-{}-01",
                hex::encode(trace_id),
                hex::encode(span_id)
            )),
            tracestate: None,
        }
    }

    /// Derive a child context sharing the trace id with a new span id
    pub fn child(&self) -> Self {
        let Some(parent) = &self.traceparent else {
            return Self::new_root();
        };
        let parts: Vec<&str> = parent.split('-').collect();
        if parts.len() != 4 {
            return Self::new_root();
        }
        let mut span_id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut span_id);
        Self {
            traceparent: Some(format!(
                "{}-{}-{}-{}",
                parts[0],
                parts[1],
                hex::encode(span_id),
                parts[3]
            )),
            tracestate: self.tracestate.clone(),
        }
    }
}

/// Initialize the global tracing subscriber from `RUST_LOG`.
///
/// Explicit so nothing happens at module load time; safe to call more than
/// once (subsequent calls are no-ops).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}
