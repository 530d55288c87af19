//! Ready-made configurations for common kinds of outbound traffic.
//!
//! ```rust
//! use backstop::{presets, Orchestrator};
//!
//! let orchestrator = Orchestrator::new(presets::chat_gateway()).unwrap();
//! assert_eq!(orchestrator.rate_limiter().config().global_capacity, Some(50));
//! ```
//!
//! - [`external_api`]: third-party REST APIs (patient retry, tolerant breaker)
//! - [`chat_gateway`]: header-driven per-route buckets under an account-wide ceiling
//! - [`batch_job`]: long-running background work (many retries, ratio-based breaker)

use crate::circuit_breaker::{CircuitBreakerConfig, FailureThreshold};
use crate::orchestrator::ResilienceConfig;
use crate::rate_limit::RateLimiterConfig;
use crate::retry::RetryConfig;
use std::time::Duration;

const EXTERNAL_API_RETRIES: u32 = 5;
const EXTERNAL_API_INITIAL_DELAY_MILLIS: u64 = 500;
const EXTERNAL_API_MAX_DELAY_SECS: u64 = 60;
const EXTERNAL_API_BREAKER_THRESHOLD: u32 = 15;
const EXTERNAL_API_BREAKER_OPEN_SECS: u64 = 120;

const CHAT_RETRIES: u32 = 3;
const CHAT_INITIAL_DELAY_MILLIS: u64 = 1_000;
const CHAT_MAX_DELAY_SECS: u64 = 30;
const CHAT_ROUTE_CAPACITY: u32 = 5;
const CHAT_GLOBAL_CAPACITY: u32 = 50;

const BATCH_RETRIES: u32 = 8;
const BATCH_INITIAL_DELAY_SECS: u64 = 1;
const BATCH_MAX_DELAY_SECS: u64 = 300;
const BATCH_FAILURE_RATIO: f64 = 0.5;
const BATCH_MINIMUM_CALLS: u32 = 20;
const BATCH_RATIO_WINDOW_SECS: u64 = 60;
const BATCH_HALF_OPEN_PROBES: u32 = 3;
const BATCH_SUCCESSES_TO_CLOSE: u32 = 2;
const BATCH_CAPACITY: u32 = 10;

/// Third-party API: five jittered retries from 500ms up to 60s, a breaker that opens after 15
/// consecutive failures for two minutes, and the default 50 requests per second per route.
pub fn external_api() -> ResilienceConfig {
    ResilienceConfig {
        retry: RetryConfig {
            max_retries: EXTERNAL_API_RETRIES,
            initial_delay: Duration::from_millis(EXTERNAL_API_INITIAL_DELAY_MILLIS),
            max_delay: Duration::from_secs(EXTERNAL_API_MAX_DELAY_SECS),
            multiplier: 2.0,
            jitter: true,
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: FailureThreshold::Consecutive(EXTERNAL_API_BREAKER_THRESHOLD),
            open_duration: Duration::from_secs(EXTERNAL_API_BREAKER_OPEN_SECS),
            ..CircuitBreakerConfig::default()
        },
        rate_limiter: RateLimiterConfig::default(),
    }
}

/// Chat-platform gateway: small per-route buckets that the server corrects through
/// `X-RateLimit-*` headers and bucket ids, under a 50 requests per second global ceiling.
pub fn chat_gateway() -> ResilienceConfig {
    ResilienceConfig {
        retry: RetryConfig {
            max_retries: CHAT_RETRIES,
            initial_delay: Duration::from_millis(CHAT_INITIAL_DELAY_MILLIS),
            max_delay: Duration::from_secs(CHAT_MAX_DELAY_SECS),
            multiplier: 2.0,
            jitter: true,
        },
        circuit_breaker: CircuitBreakerConfig::default(),
        rate_limiter: RateLimiterConfig::new(CHAT_ROUTE_CAPACITY, Duration::from_secs(1))
            .with_global_capacity(CHAT_GLOBAL_CAPACITY),
    }
}

/// Background batch work: eight retries up to five minutes apart, and a breaker that opens when
/// half of at least 20 calls in a minute fail, closing after two of three probes succeed.
pub fn batch_job() -> ResilienceConfig {
    ResilienceConfig {
        retry: RetryConfig {
            max_retries: BATCH_RETRIES,
            initial_delay: Duration::from_secs(BATCH_INITIAL_DELAY_SECS),
            max_delay: Duration::from_secs(BATCH_MAX_DELAY_SECS),
            multiplier: 2.0,
            jitter: true,
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: FailureThreshold::Ratio {
                ratio: BATCH_FAILURE_RATIO,
                minimum_calls: BATCH_MINIMUM_CALLS,
                window: Duration::from_secs(BATCH_RATIO_WINDOW_SECS),
            },
            open_duration: Duration::from_secs(60),
            half_open_max_probes: BATCH_HALF_OPEN_PROBES,
            half_open_successes_to_close: BATCH_SUCCESSES_TO_CLOSE,
        },
        rate_limiter: RateLimiterConfig::new(BATCH_CAPACITY, Duration::from_secs(1)),
    }
}
