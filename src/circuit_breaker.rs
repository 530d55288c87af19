//! Circuit breaker for one route.
//!
//! The breaker's data lives in a [`BreakerState`] value whose transitions are pure functions of
//! `(state, event, now, config)`. [`CircuitBreaker`] guards one such value with a mutex that is held
//! only for the read-modify-write, never across an await point.
//!
//! State machine:
//! - **Closed**: calls are admitted; failures are counted against the [`FailureThreshold`].
//!   Crossing it opens the breaker.
//! - **Open**: calls are rejected without a network attempt until `open_duration` has elapsed
//!   since the breaker opened, after which the next admission moves it to half-open.
//! - **HalfOpen**: at most `half_open_max_probes` probes are in flight at once. Reaching
//!   `half_open_successes_to_close` probe successes closes the breaker; any probe failure reopens
//!   it and restarts the open timer.

use crate::clock::{duration_to_millis, Clock, MonotonicClock};
use crate::error::ConfigError;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open duration elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half-open"),
        }
    }
}

/// When a closed breaker trips.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailureThreshold {
    /// Trip after this many consecutive failures; any success resets the streak.
    Consecutive(u32),
    /// Trip when, inside the current tumbling `window`, at least `minimum_calls` calls completed
    /// and the failure share reached `ratio`.
    Ratio { ratio: f64, minimum_calls: u32, window: Duration },
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct CircuitBreakerConfig {
    pub failure_threshold: FailureThreshold,
    pub open_duration: Duration,
    pub half_open_max_probes: u32,
    /// Probe successes required to close; defaults to 1 (first success closes).
    pub half_open_successes_to_close: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: FailureThreshold::Consecutive(5),
            open_duration: Duration::from_secs(30),
            half_open_max_probes: 1,
            half_open_successes_to_close: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Consecutive-failure breaker with one half-open probe.
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Result<Self, ConfigError> {
        let cfg = Self {
            failure_threshold: FailureThreshold::Consecutive(failure_threshold),
            open_duration,
            ..Self::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_half_open_probes(mut self, probes: u32) -> Result<Self, ConfigError> {
        self.half_open_max_probes = probes;
        self.validate()?;
        Ok(self)
    }

    pub fn with_successes_to_close(mut self, successes: u32) -> Result<Self, ConfigError> {
        self.half_open_successes_to_close = successes;
        self.validate()?;
        Ok(self)
    }

    pub fn with_failure_threshold(mut self, threshold: FailureThreshold) -> Result<Self, ConfigError> {
        self.failure_threshold = threshold;
        self.validate()?;
        Ok(self)
    }

    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self {
            failure_threshold: FailureThreshold::Consecutive(u32::MAX),
            open_duration: Duration::from_secs(1),
            half_open_max_probes: u32::MAX,
            half_open_successes_to_close: 1,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.failure_threshold {
            FailureThreshold::Consecutive(0) => return Err(ConfigError::ZeroFailureThreshold),
            FailureThreshold::Consecutive(_) => {}
            FailureThreshold::Ratio { ratio, minimum_calls, window } => {
                if !(ratio > 0.0 && ratio <= 1.0) {
                    return Err(ConfigError::InvalidFailureRatio(ratio));
                }
                if minimum_calls == 0 {
                    return Err(ConfigError::ZeroFailureThreshold);
                }
                if window.is_zero() {
                    return Err(ConfigError::ZeroRatioWindow);
                }
            }
        }
        if self.open_duration.is_zero() {
            return Err(ConfigError::ZeroOpenDuration);
        }
        if self.half_open_max_probes == 0 {
            return Err(ConfigError::ZeroHalfOpenProbes);
        }
        if self.half_open_successes_to_close == 0
            || self.half_open_successes_to_close > self.half_open_max_probes
        {
            return Err(ConfigError::InvalidHalfOpenSuccesses {
                provided: self.half_open_successes_to_close,
                max: self.half_open_max_probes,
            });
        }
        Ok(())
    }
}

/// How a call was admitted; pass it back when recording the call's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted while closed.
    Normal,
    /// Admitted as a half-open probe; occupies a probe slot until recorded or released.
    /// `epoch` names the half-open episode the slot belongs to.
    Probe { epoch: u64 },
}

/// Result of a finished call as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
}

/// Breaker counters and state. All transitions are pure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerState {
    pub state: CircuitState,
    /// Consecutive failures (`Consecutive`) or failures in the current window (`Ratio`).
    pub failure_count: u32,
    /// Probe successes while half-open.
    pub success_count: u32,
    /// Calls recorded in the current ratio window.
    pub window_calls: u32,
    pub window_started_at: u64,
    /// Clock millis of the last counted failure; the open timer runs from here.
    pub last_failure_time: Option<u64>,
    pub half_open_probes_in_flight: u32,
    /// Failure count that caused the most recent trip.
    pub tripped_at_failures: u32,
    /// Bumped on every state change. Probes from an earlier episode do not match it.
    pub epoch: u64,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self::closed(0)
    }
}

impl BreakerState {
    pub fn closed(now: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            window_calls: 0,
            window_started_at: now,
            last_failure_time: None,
            half_open_probes_in_flight: 0,
            tripped_at_failures: 0,
            epoch: 0,
        }
    }

    fn reclosed(self, now: u64) -> Self {
        Self { epoch: self.epoch.wrapping_add(1), ..Self::closed(now) }
    }

    fn opened(self, now: u64, failures: u32) -> Self {
        Self {
            state: CircuitState::Open,
            failure_count: 0,
            success_count: 0,
            window_calls: 0,
            window_started_at: now,
            last_failure_time: Some(now),
            half_open_probes_in_flight: 0,
            tripped_at_failures: failures,
            epoch: self.epoch.wrapping_add(1),
        }
    }

    fn open_elapsed(&self, now: u64, config: &CircuitBreakerConfig) -> bool {
        let opened = self.last_failure_time.unwrap_or(0);
        now.saturating_sub(opened) >= duration_to_millis(config.open_duration)
    }

    /// Time until an open breaker starts probing; zero when not open.
    pub fn retry_in(&self, now: u64, config: &CircuitBreakerConfig) -> Duration {
        if self.state != CircuitState::Open {
            return Duration::ZERO;
        }
        let elapsed = now.saturating_sub(self.last_failure_time.unwrap_or(0));
        Duration::from_millis(duration_to_millis(config.open_duration).saturating_sub(elapsed))
    }

    /// Side-effect free admission check.
    pub fn would_admit(&self, now: u64, config: &CircuitBreakerConfig) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.open_elapsed(now, config),
            CircuitState::HalfOpen => self.half_open_probes_in_flight < config.half_open_max_probes,
        }
    }

    /// Admission transition. Moves Open to HalfOpen once the open timer elapsed and claims a
    /// probe slot while half-open.
    pub fn admit(mut self, now: u64, config: &CircuitBreakerConfig) -> (Self, Option<Admission>) {
        if self.state == CircuitState::Open {
            if !self.open_elapsed(now, config) {
                return (self, None);
            }
            self.state = CircuitState::HalfOpen;
            self.success_count = 0;
            self.half_open_probes_in_flight = 0;
            self.epoch = self.epoch.wrapping_add(1);
        }
        match self.state {
            CircuitState::Closed => (self.roll_window(now, config), Some(Admission::Normal)),
            CircuitState::HalfOpen if self.half_open_probes_in_flight < config.half_open_max_probes => {
                self.half_open_probes_in_flight += 1;
                let epoch = self.epoch;
                (self, Some(Admission::Probe { epoch }))
            }
            _ => (self, None),
        }
    }

    /// Record the verdict of a call admitted with `admission`.
    pub fn record(
        mut self,
        admission: Admission,
        verdict: Verdict,
        now: u64,
        config: &CircuitBreakerConfig,
    ) -> Self {
        match admission {
            // Probes from an earlier episode neither free a slot nor move the state.
            Admission::Probe { epoch } if epoch != self.epoch => self,
            Admission::Probe { .. } => {
                self.half_open_probes_in_flight = self.half_open_probes_in_flight.saturating_sub(1);
                if self.state != CircuitState::HalfOpen {
                    return self;
                }
                match verdict {
                    Verdict::Success => {
                        self.success_count += 1;
                        if self.success_count >= config.half_open_successes_to_close {
                            return self.reclosed(now);
                        }
                        self
                    }
                    Verdict::Failure => self.opened(now, self.tripped_at_failures),
                }
            }
            // Results of calls admitted before a trip do not drive half-open/open transitions.
            Admission::Normal if self.state != CircuitState::Closed => self,
            Admission::Normal => {
                let mut next = self.roll_window(now, config);
                next.window_calls = next.window_calls.saturating_add(1);
                match verdict {
                    Verdict::Success => {
                        if let FailureThreshold::Consecutive(_) = config.failure_threshold {
                            next.failure_count = 0;
                        }
                        next
                    }
                    Verdict::Failure => {
                        next.failure_count = next.failure_count.saturating_add(1);
                        next.last_failure_time = Some(now);
                        if next.should_trip(config) {
                            let failures = next.failure_count;
                            return next.opened(now, failures);
                        }
                        next
                    }
                }
            }
        }
    }

    /// Release a probe slot without a verdict (the call was cancelled).
    pub fn release(mut self, admission: Admission) -> Self {
        if admission == (Admission::Probe { epoch: self.epoch }) {
            self.half_open_probes_in_flight = self.half_open_probes_in_flight.saturating_sub(1);
        }
        self
    }

    fn should_trip(&self, config: &CircuitBreakerConfig) -> bool {
        match config.failure_threshold {
            FailureThreshold::Consecutive(n) => self.failure_count >= n,
            FailureThreshold::Ratio { ratio, minimum_calls, .. } => {
                self.window_calls >= minimum_calls
                    && f64::from(self.failure_count) / f64::from(self.window_calls) >= ratio
            }
        }
    }

    fn roll_window(mut self, now: u64, config: &CircuitBreakerConfig) -> Self {
        if let FailureThreshold::Ratio { window, .. } = config.failure_threshold {
            if now.saturating_sub(self.window_started_at) >= duration_to_millis(window) {
                self.window_started_at = now;
                self.window_calls = 0;
                self.failure_count = 0;
            }
        }
        self
    }
}

/// Read-only view of a breaker for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_probes_in_flight: u32,
    pub last_failure_time: Option<Duration>,
    /// Remaining open time (zero unless open).
    pub retry_in: Duration,
}

/// A state change observed while applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    /// Failures that caused an opening transition.
    pub failures: u32,
}

/// Thread-safe breaker for a single route.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_validated(config, clock))
    }

    pub(crate) fn from_validated(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self { state: Mutex::new(BreakerState::closed(now)), config, clock }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn update<R>(&self, f: impl FnOnce(BreakerState, u64) -> (BreakerState, R)) -> (R, Option<Transition>) {
        let now = self.clock.now_millis();
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = *guard;
        let (after, out) = f(before, now);
        *guard = after;
        drop(guard);
        let transition = (before.state != after.state).then_some(Transition {
            from: before.state,
            to: after.state,
            failures: after.tripped_at_failures,
        });
        if let Some(t) = transition {
            log_transition(t);
        }
        (out, transition)
    }

    /// Ask to send a call. `None` means the call must fail fast without touching the network.
    pub fn admit(&self) -> Option<Admission> {
        self.admit_traced().0
    }

    pub(crate) fn admit_traced(&self) -> (Option<Admission>, Option<Transition>) {
        let config = &self.config;
        self.update(|state, now| state.admit(now, config))
    }

    /// Whether a call would currently be admitted; never changes state.
    pub fn is_call_permitted(&self) -> bool {
        let now = self.clock.now_millis();
        self.snapshot().would_admit(now, &self.config)
    }

    pub fn record_success(&self, admission: Admission) -> Option<Transition> {
        self.record(admission, Verdict::Success)
    }

    pub fn record_failure(&self, admission: Admission) -> Option<Transition> {
        self.record(admission, Verdict::Failure)
    }

    pub fn record(&self, admission: Admission, verdict: Verdict) -> Option<Transition> {
        let config = &self.config;
        self.update(|state, now| (state.record(admission, verdict, now, config), ())).1
    }

    /// Give back an admission whose call finished without a verdict.
    pub fn release(&self, admission: Admission) {
        self.update(|state, _| (state.release(admission), ()));
    }

    /// Administrative override: force Closed with zeroed counters.
    pub fn reset(&self) {
        self.update(|state, now| (state.reclosed(now), ()));
    }

    pub fn state(&self) -> CircuitState {
        self.snapshot().state
    }

    pub fn snapshot(&self) -> BreakerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let now = self.clock.now_millis();
        let s = self.snapshot();
        CircuitMetrics {
            state: s.state,
            failure_count: s.failure_count,
            success_count: s.success_count,
            half_open_probes_in_flight: s.half_open_probes_in_flight,
            last_failure_time: s.last_failure_time.map(Duration::from_millis),
            retry_in: s.retry_in(now, &self.config),
        }
    }
}

fn log_transition(t: Transition) {
    match t.to {
        CircuitState::Open if t.from == CircuitState::HalfOpen => {
            tracing::warn!(from = %t.from, "circuit breaker: probe failed → open");
        }
        CircuitState::Open => {
            tracing::error!(failures = t.failures, "circuit breaker → open");
        }
        CircuitState::HalfOpen => tracing::info!("circuit breaker → half-open"),
        CircuitState::Closed => tracing::info!(from = %t.from, "circuit breaker → closed"),
    }
}
