//! Jitter strategies to keep many clients from retrying in lockstep.
//!
//! - `None`: deterministic delays, useful for tests and tightly scheduled jobs.
//! - `Symmetric`: `base + 0.5 * base * U` with `U` uniform in `[-0.5, 0.5]`, i.e. within ±25% of
//!   the base delay, then clamped to `[0, max]`.
//!
//! RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//! [`Jitter::apply_with_rng`].

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Use the exact backoff delay.
    None,
    /// Spread the delay uniformly across ±25% of its value.
    #[default]
    Symmetric,
}

impl Jitter {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Jitter::Symmetric
        } else {
            Jitter::None
        }
    }

    /// Apply jitter to `delay`, never exceeding `max`.
    pub fn apply(&self, delay: Duration, max: Duration) -> Duration {
        self.apply_with_rng(delay, max, &mut rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, max: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay.min(max),
            Jitter::Symmetric => {
                let base = delay.as_secs_f64();
                if base == 0.0 {
                    return Duration::ZERO;
                }
                let u: f64 = rng.random_range(-0.5..=0.5);
                let jittered = (base + 0.5 * base * u).max(0.0);
                Duration::try_from_secs_f64(jittered).unwrap_or(max).min(max)
            }
        }
    }
}
