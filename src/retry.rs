//! Retry decisions.
//!
//! [`RetryPolicy::decide`] is a pure function of the attempt index and the classified
//! [`Outcome`]; the orchestrator performs the actual sleep.
//!
//! Semantics:
//! - `max_retries` counts retries only, so a permanently failing retryable call is attempted
//!   `max_retries + 1` times.
//! - `attempt` is the zero-based index of the attempt that just failed.
//! - A server-supplied `Retry-After` replaces the computed backoff (it is neither jittered nor
//!   capped by `max_delay`).
//!
//! ```rust
//! use std::time::Duration;
//! use backstop::{Outcome, RetryConfig, RetryPolicy};
//! use http::StatusCode;
//!
//! let policy = RetryPolicy::new(RetryConfig {
//!     max_retries: 2,
//!     initial_delay: Duration::from_millis(100),
//!     jitter: false,
//!     ..RetryConfig::default()
//! })
//! .unwrap();
//!
//! let failed = Outcome::HttpError { status: StatusCode::SERVICE_UNAVAILABLE, retry_after: None };
//! assert_eq!(policy.decide(0, &failed).delay, Duration::from_millis(100));
//! assert_eq!(policy.decide(1, &failed).delay, Duration::from_millis(200));
//! assert!(!policy.decide(2, &failed).retry);
//! ```

use crate::backoff::Backoff;
use crate::error::ConfigError;
use crate::jitter::Jitter;
use crate::outcome::Outcome;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Caller-facing retry configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A config that never retries.
    pub fn disabled() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }
}

/// Whether to retry and how long to wait first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub const STOP: RetryDecision = RetryDecision { retry: false, delay: Duration::ZERO };

    fn after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

type Classifier = Arc<dyn Fn(&Outcome) -> bool + Send + Sync>;

/// Validated retry policy: backoff, jitter, ceiling, and classification.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
    jitter: Jitter,
    classifier: Option<Classifier>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("classifier", &self.classifier.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Result<Self, ConfigError> {
        let backoff = Backoff::new(config.initial_delay, config.max_delay, config.multiplier)?;
        Ok(Self {
            max_retries: config.max_retries,
            backoff,
            jitter: Jitter::from_enabled(config.jitter),
            classifier: None,
        })
    }

    /// Override the default retryability classification.
    pub fn with_classifier<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Outcome) -> bool + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(predicate));
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Whether `outcome` may be retried at all, ignoring the ceiling.
    pub fn is_retryable(&self, outcome: &Outcome) -> bool {
        if matches!(outcome, Outcome::Success | Outcome::Cancelled) {
            return false;
        }
        match &self.classifier {
            Some(predicate) => predicate(outcome),
            None => outcome.is_retryable(),
        }
    }

    /// Decide whether the attempt with index `attempt` that produced `outcome` should be retried.
    pub fn decide(&self, attempt: u32, outcome: &Outcome) -> RetryDecision {
        self.decide_with_rng(attempt, outcome, &mut rand::rng())
    }

    /// [`decide`](Self::decide) with an injected RNG for the jitter draw.
    pub fn decide_with_rng<R: Rng>(&self, attempt: u32, outcome: &Outcome, rng: &mut R) -> RetryDecision {
        if attempt >= self.max_retries || !self.is_retryable(outcome) {
            return RetryDecision::STOP;
        }
        if let Some(server_wait) = outcome.retry_after() {
            return RetryDecision::after(server_wait);
        }
        let base = self.backoff.delay(attempt);
        RetryDecision::after(self.jitter.apply_with_rng(base, self.backoff.max(), rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::ConnectionErrorKind;
    use http::StatusCode;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn server_error() -> Outcome {
        Outcome::HttpError { status: StatusCode::INTERNAL_SERVER_ERROR, retry_after: None }
    }

    fn policy(max_retries: u32, jitter: bool) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter,
        })
        .unwrap()
    }

    #[test]
    fn never_retries_at_or_past_ceiling() {
        let p = policy(2, false);
        assert!(p.decide(0, &server_error()).retry);
        assert!(p.decide(1, &server_error()).retry);
        assert_eq!(p.decide(2, &server_error()), RetryDecision::STOP);
        assert_eq!(p.decide(9, &server_error()), RetryDecision::STOP);
    }

    #[test]
    fn zero_retries_never_retries() {
        let p = RetryPolicy::new(RetryConfig::disabled()).unwrap();
        assert!(!p.decide(0, &server_error()).retry);
    }

    #[test]
    fn pre_jitter_delay_is_capped_exponential() {
        let p = policy(20, false);
        for attempt in 0..10u32 {
            let expected =
                Duration::from_millis(100 * 2u64.pow(attempt)).min(Duration::from_secs(2));
            assert_eq!(p.decide(attempt, &server_error()).delay, expected);
        }
    }

    #[test]
    fn jittered_delay_within_bounds() {
        let p = policy(20, true);
        let mut rng = StdRng::seed_from_u64(11);
        for attempt in 0..10u32 {
            let base = p.backoff().delay(attempt);
            for _ in 0..50 {
                let d = p.decide_with_rng(attempt, &server_error(), &mut rng).delay;
                assert!(d >= base.mul_f64(0.75).min(Duration::from_secs(2)));
                assert!(d <= base.mul_f64(1.25).min(Duration::from_secs(2)));
            }
        }
    }

    #[test]
    fn fatal_outcomes_are_not_retried() {
        let p = policy(5, false);
        let not_found = Outcome::HttpError { status: StatusCode::NOT_FOUND, retry_after: None };
        assert!(!p.decide(0, &not_found).retry);
        let invalid = Outcome::ConnectionError(ConnectionErrorKind::InvalidRequest);
        assert!(!p.decide(0, &invalid).retry);
        assert!(!p.decide(0, &Outcome::Cancelled).retry);
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let p = policy(5, true);
        let throttled = Outcome::HttpError {
            status: StatusCode::TOO_MANY_REQUESTS,
            retry_after: Some(Duration::from_secs(5)),
        };
        let decision = p.decide(0, &throttled);
        assert!(decision.retry);
        assert_eq!(decision.delay, Duration::from_secs(5));
    }

    #[test]
    fn retry_after_does_not_bypass_ceiling() {
        let p = policy(1, false);
        let throttled = Outcome::HttpError {
            status: StatusCode::TOO_MANY_REQUESTS,
            retry_after: Some(Duration::from_secs(1)),
        };
        assert!(!p.decide(1, &throttled).retry);
    }

    #[test]
    fn classifier_overrides_default() {
        let p = policy(3, false).with_classifier(|outcome| {
            matches!(outcome, Outcome::HttpError { status, .. } if *status == StatusCode::CONFLICT)
        });
        let conflict = Outcome::HttpError { status: StatusCode::CONFLICT, retry_after: None };
        assert!(p.decide(0, &conflict).retry);
        assert!(!p.decide(0, &server_error()).retry);
        assert!(!p.decide(0, &Outcome::Cancelled).retry);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = RetryPolicy::new(RetryConfig { multiplier: 0.5, ..RetryConfig::default() });
        assert!(matches!(err, Err(ConfigError::InvalidMultiplier(_))));
    }
}
