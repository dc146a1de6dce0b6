//! Error types for the intent engine

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Comprehensive error taxonomy for the intent engine.
///
/// Kinds map one-to-one onto the wire-level error codes the service surface
/// reports; [`EngineError::kind`] returns that code.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Submission or input failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entity trust level below the gate for the intent type
    #[error("Trust level {actual} below required level {required}")]
    TrustInsufficient { required: u8, actual: u8 },

    /// Required consent absent or revoked
    #[error("Consent required: {consent_type} ({reason})")]
    ConsentRequired { consent_type: String, reason: String },

    /// A rate or concurrency limit rejected the request
    #[error("Rate limit exceeded for {scope}, retry after {retry_after_s}s")]
    RateLimited { scope: String, retry_after_s: u64 },

    /// A lock required for the operation could not be acquired in time
    #[error("Resource locked: {0}")]
    Locked(String),

    /// Status transition not permitted by the state machine
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Referenced resource does not exist (or is not visible to the tenant)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation conflicts with current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A store statement exceeded its deadline
    #[error("Statement timed out: {0}")]
    StatementTimeout(String),

    /// A circuit breaker rejected the call. Internal marker - callers either
    /// degrade gracefully or translate this before it reaches a client.
    #[error("Circuit open for dependency {0}")]
    CircuitOpen(String),

    /// The intent row was persisted but the stage job could not be enqueued
    #[error("Failed to enqueue stage job: {0}")]
    EnqueueFailed(String),

    /// Durable or ephemeral store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Wire-level error code for this kind
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION",
            EngineError::TrustInsufficient { .. } => "TRUST_INSUFFICIENT",
            EngineError::ConsentRequired { .. } => "CONSENT_REQUIRED",
            EngineError::RateLimited { .. } => "INTENT_RATE_LIMIT",
            EngineError::Locked(_) => "INTENT_LOCKED",
            EngineError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::StatementTimeout(_) => "STATEMENT_TIMEOUT",
            EngineError::CircuitOpen(_) => "CIRCUIT_OPEN",
            EngineError::EnqueueFailed(_) => "ENQUEUE_FAILED",
            EngineError::Store(_) => "INTERNAL",
            EngineError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a worker may recover from this error by retrying the job
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Store(_)
                | EngineError::StatementTimeout(_)
                | EngineError::EnqueueFailed(_)
                | EngineError::Internal(_)
        )
    }

    /// Message safe to return to a caller. Internal errors are flattened so
    /// stack details never leak.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Store(_) | EngineError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(
            EngineError::TrustInsufficient {
                required: 3,
                actual: 0
            }
            .kind(),
            "TRUST_INSUFFICIENT"
        );
        assert_eq!(
            EngineError::RateLimited {
                scope: "tenant".to_string(),
                retry_after_s: 60
            }
            .kind(),
            "INTENT_RATE_LIMIT"
        );
    }

    #[test]
    fn test_internal_errors_do_not_leak() {
        let error = EngineError::Store("connection refused at 10.0.0.5:5432".to_string());
        assert!(!error.user_message().contains("10.0.0.5"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::Store("timeout".to_string()).is_retryable());
        assert!(!EngineError::Validation("bad".to_string()).is_retryable());
        assert!(!EngineError::TrustInsufficient {
            required: 3,
            actual: 1
        }
        .is_retryable());
    }
}
