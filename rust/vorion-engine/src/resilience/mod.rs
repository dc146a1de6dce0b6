//! Resiliency primitives shared by the pipeline and its collaborators

pub mod circuit_breaker;
pub mod dlq;
pub mod lock;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{BreakerStatus, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use dlq::{DeadLetterQueue, DeadLetterRecord, JobError};
pub use lock::{DistributedLock, LockGuard, LockOptions};
pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use retry::RetryPolicy;
