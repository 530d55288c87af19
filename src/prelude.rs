//! Convenient re-exports for common backstop types.
pub use crate::{
    circuit_breaker::{CircuitBreakerConfig, CircuitState, FailureThreshold},
    error::{ConfigError, ResilienceError},
    orchestrator::{CallOptions, Orchestrator, ResilienceConfig},
    outcome::{ConnectionErrorKind, Outcome, TransportError},
    rate_limit::{RateLimitHeaders, RateLimiterConfig},
    retry::RetryConfig,
    transport::{Idempotency, RouteKey, Transport},
    ResilienceLayer,
};
