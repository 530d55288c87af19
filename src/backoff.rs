//! Exponential backoff with a ceiling.
//!
//! Attempt semantics: `attempt` is the zero-based index of the attempt that just failed, so the
//! first retry waits `initial`, the second `initial * multiplier`, and so on:
//!
//! ```rust
//! use std::time::Duration;
//! use backstop::Backoff;
//!
//! let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2.0).unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(100));
//! assert_eq!(backoff.delay(1), Duration::from_millis(200));
//! assert_eq!(backoff.delay(2), Duration::from_millis(400));
//! assert_eq!(backoff.delay(10), Duration::from_secs(1)); // capped
//! ```
//!
//! Overflow behavior: any computation that would overflow saturates to `max`.

use crate::error::ConfigError;
use std::time::Duration;

/// Validated exponential backoff: `min(initial * multiplier^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Create a backoff, rejecting a zero `initial`, `max < initial`, and multipliers that are not
    /// finite values above 1.0.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Result<Self, ConfigError> {
        if initial.is_zero() {
            return Err(ConfigError::ZeroInitialDelay);
        }
        if max < initial {
            return Err(ConfigError::MaxDelayBelowInitial { initial, max });
        }
        if !multiplier.is_finite() || multiplier <= 1.0 {
            return Err(ConfigError::InvalidMultiplier(multiplier));
        }
        Ok(Self { initial, max, multiplier })
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Pre-jitter delay after the attempt with index `attempt` failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let nanos = self.initial.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max.as_nanos() as f64 {
            return self.max;
        }
        Duration::from_nanos(nanos.round() as u64).min(self.max)
    }
}
