//! Error types surfaced to callers.
//!
//! Every error produced after at least one network attempt carries the number of attempts that
//! were made, so callers always learn how hard the orchestrator tried before giving up.

use crate::outcome::{ConnectionErrorKind, Outcome};
use http::StatusCode;
use std::time::Duration;

/// Terminal error of an orchestrated call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResilienceError {
    /// No response was received (timeout, reset, DNS, ...).
    #[error("{kind}: {message} (after {attempts} attempt(s))")]
    Transport { kind: ConnectionErrorKind, message: String, attempts: u32 },
    /// The server answered 429.
    #[error("rate limited with status {status}{} (after {attempts} attempt(s))", hint(.retry_after, .global))]
    RateLimited { status: StatusCode, retry_after: Option<Duration>, global: bool, attempts: u32 },
    /// The server answered with a 5xx status (or 408).
    #[error("server error {status} (after {attempts} attempt(s))")]
    Server { status: StatusCode, attempts: u32 },
    /// The server rejected the request with a 4xx status other than 429/408.
    #[error("client error {status} (after {attempts} attempt(s))")]
    Client { status: StatusCode, attempts: u32 },
    /// The route's circuit breaker rejected the call before any network attempt.
    #[error("circuit open for route '{route}' ({failure_count} failures, retry in {retry_in:?})")]
    CircuitOpen { route: String, failure_count: u32, retry_in: Duration },
    /// Caller input was malformed; nothing was attempted.
    #[error("invalid call: {0}")]
    Validation(String),
    /// The caller cancelled the call.
    #[error("cancelled (after {attempts} attempt(s))")]
    Cancelled { attempts: u32 },
    /// The overall deadline elapsed before the call could complete.
    #[error("deadline of {deadline:?} exceeded (after {attempts} attempt(s))")]
    DeadlineExceeded { deadline: Duration, attempts: u32 },
}

fn hint(retry_after: &Option<Duration>, global: &bool) -> String {
    let scope = if *global { ", global" } else { "" };
    match retry_after {
        Some(wait) => format!(" (retry after {:?}{})", wait, scope),
        None if *global => " (global)".to_string(),
        None => String::new(),
    }
}

impl ResilienceError {
    /// Build the terminal error for a failed outcome.
    pub(crate) fn from_outcome(
        outcome: Outcome,
        message: Option<String>,
        global: bool,
        attempts: u32,
    ) -> Self {
        match outcome {
            Outcome::ConnectionError(kind) => ResilienceError::Transport {
                kind,
                message: message.unwrap_or_default(),
                attempts,
            },
            Outcome::HttpError { status, retry_after } if status == StatusCode::TOO_MANY_REQUESTS => {
                ResilienceError::RateLimited { status, retry_after, global, attempts }
            }
            Outcome::HttpError { status, .. }
                if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT =>
            {
                ResilienceError::Server { status, attempts }
            }
            Outcome::HttpError { status, .. } => ResilienceError::Client { status, attempts },
            Outcome::Cancelled | Outcome::Success => ResilienceError::Cancelled { attempts },
        }
    }

    /// Number of network attempts made before this error was produced.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Transport { attempts, .. }
            | Self::RateLimited { attempts, .. }
            | Self::Server { attempts, .. }
            | Self::Client { attempts, .. }
            | Self::Cancelled { attempts }
            | Self::DeadlineExceeded { attempts, .. } => *attempts,
            Self::CircuitOpen { .. } | Self::Validation(_) => 0,
        }
    }

    /// HTTP status of the last response, if one was received.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::RateLimited { status, .. } | Self::Server { status, .. } | Self::Client { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Whether the failure class is transient (the ceiling, not the class, stopped retries).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { kind, .. } => kind.is_retryable(),
            Self::RateLimited { .. } | Self::Server { .. } => true,
            _ => false,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// Remaining open time reported by a circuit rejection.
    pub fn circuit_retry_in(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("multiplier must be finite and > 1.0 (got {0})")]
    InvalidMultiplier(f64),
    #[error("initial_delay must be > 0")]
    ZeroInitialDelay,
    #[error("max_delay ({max:?}) must be >= initial_delay ({initial:?})")]
    MaxDelayBelowInitial { initial: Duration, max: Duration },
    #[error("failure_threshold must be > 0")]
    ZeroFailureThreshold,
    #[error("failure ratio must be within (0, 1] (got {0})")]
    InvalidFailureRatio(f64),
    #[error("ratio window must be > 0")]
    ZeroRatioWindow,
    #[error("open_duration must be > 0")]
    ZeroOpenDuration,
    #[error("half_open_max_probes must be > 0")]
    ZeroHalfOpenProbes,
    #[error("half_open_successes_to_close must be within 1..=half_open_max_probes (got {provided}, max {max})")]
    InvalidHalfOpenSuccesses { provided: u32, max: u32 },
    #[error("bucket capacity must be > 0")]
    ZeroCapacity,
    #[error("refill_interval must be > 0")]
    ZeroRefillInterval,
}

/// Errors from per-route registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("no state registered for route '{route}'")]
    NotFound { route: String },
}
