//! Reliability primitives: per-target circuit breakers and retry backoff

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitState,
};
pub use retry::RetryPolicy;
