#![forbid(unsafe_code)]

//! # backstop
//!
//! Resilience layer for outbound API calls: bounded retry with backoff, per-route circuit
//! breakers, and rate limiting corrected by the server's own quota headers.
//!
//! ## Features
//!
//! - **Retry** with capped exponential backoff, symmetric jitter, and `Retry-After` compliance
//! - **Circuit breakers** per route, tripping on consecutive failures or a failure ratio
//! - **Rate limiting** per route and account-wide, remapped onto server-assigned buckets
//! - **Cancellation and deadlines** observed at every suspension point
//! - **Telemetry** as structured events into any `tower::Service` sink
//! - **Tower integration** through [`ResilienceLayer`]
//!
//! ## Quick Start
//!
//! ```rust
//! use backstop::{CallOptions, Orchestrator, ResilienceConfig, TransportError};
//! use http::{Response, StatusCode};
//!
//! #[tokio::main]
//! async fn main() {
//!     let orchestrator = Orchestrator::new(ResilienceConfig::default()).unwrap();
//!
//!     let response = orchestrator
//!         .execute("GET /users/{id}", CallOptions::idempotent(), || async {
//!             // Your HTTP client call here
//!             Ok::<_, TransportError>(Response::new(()))
//!         })
//!         .await
//!         .unwrap();
//!     assert_eq!(response.status(), StatusCode::OK);
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod error;
pub mod jitter;
pub mod layer;
pub mod orchestrator;
pub mod outcome;
pub mod prelude;
pub mod presets;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod sleeper;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use backoff::Backoff;
pub use circuit_breaker::{
    Admission, BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState,
    FailureThreshold, Verdict,
};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use clock::{Clock, FixedWallClock, ManualClock, MonotonicClock, SystemWallClock, WallClock};
pub use error::{ConfigError, RegistryError, ResilienceError};
pub use jitter::Jitter;
pub use layer::{ResilienceLayer, ResilienceService};
pub use orchestrator::{CallOptions, Orchestrator, OrchestratorBuilder, ResilienceConfig};
pub use outcome::{parse_retry_after, ConnectionErrorKind, Outcome, TransportError};
pub use rate_limit::{
    Bucket, BucketSnapshot, RateLimitFeedback, RateLimitHeaders, RateLimitUpdate, RateLimiter,
    RateLimiterConfig,
};
pub use registry::Registry;
pub use retry::{RetryConfig, RetryDecision, RetryPolicy};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{LogSink, MemorySink, NullSink, PolicyEvent, TelemetrySink};
pub use transport::{Idempotency, RouteKey, ServiceTransport, Transport};
