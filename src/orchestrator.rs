//! Composition of rate limiting, circuit breaking, and retry around one logical call.
//!
//! Per attempt:
//! 1. wait for the route's rate-limit bucket (and the global bucket);
//! 2. ask the route's breaker for admission, failing fast with
//!    [`ResilienceError::CircuitOpen`] when refused (no attempt is consumed);
//! 3. send through the caller's operation;
//! 4. record the verdict on the breaker and correct the limiter from response headers;
//! 5. on failure, ask the [`RetryPolicy`] whether and when to try again.
//!
//! Every suspension (limiter wait, transport call, retry sleep) is raced against the call's
//! cancellation token and overall deadline.
//!
//! ```rust,no_run
//! use backstop::{CallOptions, Orchestrator, ResilienceConfig, TransportError};
//! use http::Response;
//!
//! # async fn demo() -> Result<(), backstop::ResilienceError> {
//! let orchestrator = Orchestrator::new(ResilienceConfig::default()).unwrap();
//! let response = orchestrator
//!     .execute("GET /users", CallOptions::idempotent(), || async {
//!         Ok::<_, TransportError>(Response::new("[]"))
//!     })
//!     .await?;
//! assert_eq!(response.into_body(), "[]");
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState, Transition, Verdict};
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::clock::{duration_to_millis, Clock, MonotonicClock, SystemWallClock, WallClock};
use crate::error::{ConfigError, RegistryError, ResilienceError};
use crate::outcome::{Outcome, TransportError};
use crate::rate_limit::{RateLimitFeedback, RateLimiter, RateLimiterConfig};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{
    emit_best_effort, CircuitBreakerEvent, NullSink, PolicyEvent, RateLimitEvent, RequestOutcome,
    RetryEvent, TelemetrySink,
};
use crate::transport::{clone_request, Idempotency, RouteKey, Transport};
use http::{Request, Response};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

/// All policy configuration for one orchestrator.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limiter: RateLimiterConfig,
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Only idempotent calls are retried.
    pub idempotent: bool,
    /// Budget across all attempts and waits.
    pub deadline: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::idempotent()
    }
}

impl CallOptions {
    pub fn idempotent() -> Self {
        Self { idempotent: true, deadline: None, cancellation: None }
    }

    pub fn non_idempotent() -> Self {
        Self { idempotent: false, ..Self::idempotent() }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Options for an HTTP request: a `CallOptions` extension supplies the deadline and
    /// cancellation, and idempotency follows the method unless an [`Idempotency`] extension
    /// overrides it.
    pub fn for_request<B>(request: &Request<B>) -> Self {
        let mut options = request.extensions().get::<CallOptions>().cloned().unwrap_or_default();
        options.idempotent = Idempotency::of(request).is_idempotent();
        options
    }
}

enum Interrupt {
    Cancelled,
    Deadline,
}

/// Per-call bookkeeping.
struct CallState {
    started: u64,
    attempts: u32,
    deadline: Option<Duration>,
    cancellation: Option<CancellationToken>,
}

impl CallState {
    fn remaining(&self, clock: &dyn Clock) -> Option<Duration> {
        let deadline = self.deadline?;
        let elapsed = Duration::from_millis(clock.now_millis().saturating_sub(self.started));
        Some(deadline.saturating_sub(elapsed))
    }

    fn interrupted(&self, interrupt: Interrupt) -> ResilienceError {
        match interrupt {
            Interrupt::Cancelled => ResilienceError::Cancelled { attempts: self.attempts },
            Interrupt::Deadline => ResilienceError::DeadlineExceeded {
                deadline: self.deadline.unwrap_or_default(),
                attempts: self.attempts,
            },
        }
    }
}

/// Shared resilience state for a set of routes.
///
/// Each instance owns its breaker and bucket registries; two orchestrators never share state.
pub struct Orchestrator<S = NullSink> {
    retry: RetryPolicy,
    breakers: CircuitBreakerRegistry,
    limiter: RateLimiter,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    sink: S,
}

impl<S> std::fmt::Debug for Orchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("retry", &self.retry)
            .field("breakers", &self.breakers)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl Orchestrator<NullSink> {
    /// Orchestrator on the tokio clock with telemetry disabled.
    pub fn new(config: ResilienceConfig) -> Result<Self, ConfigError> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> OrchestratorBuilder<NullSink> {
        OrchestratorBuilder::default()
    }
}

impl<S> Orchestrator<S>
where
    S: TelemetrySink,
    <S as tower::Service<PolicyEvent>>::Future: Send + 'static,
{
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn telemetry(&self) -> &S {
        &self.sink
    }

    /// Forget breaker and bucket state for one route.
    pub fn reset_route(&self, route: &str) -> Result<(), RegistryError> {
        let breaker = self.breakers.remove(route);
        let bucket = self.limiter.reset(route);
        if breaker || bucket {
            Ok(())
        } else {
            Err(RegistryError::NotFound { route: route.to_string() })
        }
    }

    /// Drop all per-route state.
    pub fn shutdown(&self) {
        self.breakers.clear();
        self.limiter.clear();
        debug!("orchestrator state cleared");
    }

    async fn emit(&self, event: PolicyEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    async fn emit_transition(&self, route: &str, transition: Option<Transition>) {
        let Some(t) = transition else { return };
        let route = route.to_string();
        let event = match t.to {
            CircuitState::Open => CircuitBreakerEvent::Opened { route, failure_count: t.failures },
            CircuitState::HalfOpen => CircuitBreakerEvent::HalfOpen { route },
            CircuitState::Closed => CircuitBreakerEvent::Closed { route },
        };
        self.emit(PolicyEvent::CircuitBreaker(event)).await;
    }

    async fn guarded<F: Future>(&self, call: &CallState, fut: F) -> Result<F::Output, Interrupt> {
        let cancelled = async {
            match &call.cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let expired = async {
            match call.remaining(self.clock.as_ref()) {
                Some(left) => tokio::time::sleep(left).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancelled => Err(Interrupt::Cancelled),
            _ = expired => Err(Interrupt::Deadline),
            out = fut => Ok(out),
        }
    }

    fn observe<T>(&self, route: &str, response: &Response<T>) -> RateLimitFeedback {
        self.limiter.update_from_response(route, response.status(), response.headers())
    }

    async fn report_throttle(&self, route: &str, feedback: &RateLimitFeedback) {
        if let Some(wait) = feedback.throttled_for {
            let event = RateLimitEvent::Throttled { route: route.to_string(), wait, global: feedback.global };
            self.emit(PolicyEvent::RateLimit(event)).await;
        }
    }

    /// Run `operation` for `route` under the configured policies.
    ///
    /// Responses with a status below 400 are returned untouched. Every other outcome is retried
    /// while the call is idempotent, the outcome is retryable, and the retry ceiling allows it;
    /// the last failure is then surfaced with the number of attempts made.
    pub async fn execute<T, Op, Fut>(
        &self,
        route: &str,
        options: CallOptions,
        operation: Op,
    ) -> Result<Response<T>, ResilienceError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<Response<T>, TransportError>>,
    {
        if route.trim().is_empty() {
            return Err(ResilienceError::Validation("route key must not be empty".into()));
        }
        let started = self.clock.now_millis();
        let result = self
            .run(route, options, operation)
            .instrument(tracing::debug_span!("resilient_call", route))
            .await;

        let duration = Duration::from_millis(self.clock.now_millis().saturating_sub(started));
        let route = route.to_string();
        let outcome = match &result {
            Ok((_, attempts)) => RequestOutcome::Success { route, attempts: *attempts, duration },
            Err(err) => RequestOutcome::Failure { route, attempts: err.attempts(), duration },
        };
        self.emit(PolicyEvent::Request(outcome)).await;
        result.map(|(response, _)| response)
    }

    async fn run<T, Op, Fut>(
        &self,
        route: &str,
        options: CallOptions,
        mut operation: Op,
    ) -> Result<(Response<T>, u32), ResilienceError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<Response<T>, TransportError>>,
    {
        let mut call = CallState {
            started: self.clock.now_millis(),
            attempts: 0,
            deadline: options.deadline,
            cancellation: options.cancellation,
        };

        loop {
            let waited = self
                .guarded(&call, self.limiter.acquire(route))
                .await
                .map_err(|i| call.interrupted(i))?;
            if !waited.is_zero() {
                let event = RateLimitEvent::Waited { route: route.to_string(), waited };
                self.emit(PolicyEvent::RateLimit(event)).await;
            }

            let breaker = self.breakers.breaker(route);
            let (admission, transition) = breaker.admit_traced();
            self.emit_transition(route, transition).await;
            let Some(admission) = admission else {
                let retry_in = breaker.metrics().retry_in;
                let failure_count = breaker.snapshot().tripped_at_failures;
                debug!(retry_in_ms = duration_to_millis(retry_in), "circuit open, failing fast");
                let event = CircuitBreakerEvent::Rejected { route: route.to_string(), retry_in };
                self.emit(PolicyEvent::CircuitBreaker(event)).await;
                return Err(ResilienceError::CircuitOpen {
                    route: route.to_string(),
                    failure_count,
                    retry_in,
                });
            };

            call.attempts += 1;
            debug!(attempt = call.attempts, "sending");
            let result = match self.guarded(&call, operation()).await {
                Ok(result) => result,
                Err(interrupt) => {
                    breaker.release(admission);
                    return Err(call.interrupted(interrupt));
                }
            };

            let (outcome, message, global) = match result {
                Ok(response) if response.status().as_u16() < 400 => {
                    let transition = breaker.record(admission, Verdict::Success);
                    let feedback = self.observe(route, &response);
                    self.emit_transition(route, transition).await;
                    self.report_throttle(route, &feedback).await;
                    return Ok((response, call.attempts));
                }
                Ok(response) => {
                    let status = response.status();
                    let verdict = verdict_for(&Outcome::HttpError { status, retry_after: None });
                    let transition = breaker.record(admission, verdict);
                    let feedback = self.observe(route, &response);
                    drop(response);
                    self.emit_transition(route, transition).await;
                    self.report_throttle(route, &feedback).await;
                    let outcome = Outcome::HttpError { status, retry_after: feedback.update.retry_after };
                    (outcome, None, feedback.global)
                }
                Err(err) => {
                    let outcome = Outcome::ConnectionError(err.kind);
                    let transition = breaker.record(admission, verdict_for(&outcome));
                    self.emit_transition(route, transition).await;
                    (outcome, Some(err.message), false)
                }
            };

            if !options.idempotent {
                debug!(attempt = call.attempts, "non-idempotent call failed, not retrying");
                return Err(ResilienceError::from_outcome(outcome, message, global, call.attempts));
            }

            let decision = self.retry.decide(call.attempts - 1, &outcome);
            if !decision.retry {
                if self.retry.is_retryable(&outcome) {
                    let elapsed = self.clock.now_millis().saturating_sub(call.started);
                    warn!(attempts = call.attempts, ?outcome, "retries exhausted");
                    let event = RetryEvent::Exhausted {
                        route: route.to_string(),
                        total_attempts: call.attempts,
                        total_duration: Duration::from_millis(elapsed),
                    };
                    self.emit(PolicyEvent::Retry(event)).await;
                }
                return Err(ResilienceError::from_outcome(outcome, message, global, call.attempts));
            }

            if let Some(left) = call.remaining(self.clock.as_ref()) {
                if decision.delay >= left {
                    debug!(
                        delay_ms = duration_to_millis(decision.delay),
                        left_ms = duration_to_millis(left),
                        "retry would cross the deadline"
                    );
                    return Err(call.interrupted(Interrupt::Deadline));
                }
            }

            debug!(
                attempt = call.attempts,
                delay_ms = duration_to_millis(decision.delay),
                ?outcome,
                "retrying"
            );
            let event = RetryEvent::Attempt {
                route: route.to_string(),
                attempt: call.attempts,
                delay: decision.delay,
            };
            self.emit(PolicyEvent::Retry(event)).await;
            self.guarded(&call, self.sleeper.sleep(decision.delay))
                .await
                .map_err(|i| call.interrupted(i))?;
        }
    }

    /// Send an HTTP request through `transport`.
    ///
    /// The route key comes from a [`RouteKey`] extension or `"{METHOD} {path}"`; the request is
    /// cloned for every attempt.
    pub async fn send<B, T>(
        &self,
        transport: &T,
        request: Request<B>,
    ) -> Result<Response<T::Body>, ResilienceError>
    where
        B: Clone + Send + 'static,
        T: Transport<B> + ?Sized,
    {
        let route = RouteKey::of(&request);
        let options = CallOptions::for_request(&request);
        self.execute(route.as_str(), options, || transport.send(clone_request(&request))).await
    }
}

fn verdict_for(outcome: &Outcome) -> Verdict {
    if outcome.is_dependency_failure() {
        Verdict::Failure
    } else {
        Verdict::Success
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder<S = NullSink> {
    config: ResilienceConfig,
    classifier: Option<Arc<dyn Fn(&Outcome) -> bool + Send + Sync>>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    wall: Arc<dyn WallClock>,
    sink: S,
}

impl Default for OrchestratorBuilder<NullSink> {
    fn default() -> Self {
        Self {
            config: ResilienceConfig::default(),
            classifier: None,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
            wall: Arc::new(SystemWallClock),
            sink: NullSink,
        }
    }
}

impl<S> OrchestratorBuilder<S> {
    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = breaker;
        self
    }

    pub fn rate_limiter(mut self, limiter: RateLimiterConfig) -> Self {
        self.config.rate_limiter = limiter;
        self
    }

    /// Replace the default retryability classification.
    pub fn retry_classifier<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Outcome) -> bool + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(predicate));
        self
    }

    pub fn sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn wall_clock(mut self, wall: impl WallClock + 'static) -> Self {
        self.wall = Arc::new(wall);
        self
    }

    pub fn telemetry<S2>(self, sink: S2) -> OrchestratorBuilder<S2>
    where
        S2: TelemetrySink,
    {
        OrchestratorBuilder {
            config: self.config,
            classifier: self.classifier,
            sleeper: self.sleeper,
            clock: self.clock,
            wall: self.wall,
            sink,
        }
    }

    pub fn build(self) -> Result<Orchestrator<S>, ConfigError> {
        let mut retry = RetryPolicy::new(self.config.retry)?;
        if let Some(classifier) = self.classifier {
            retry = retry.with_classifier(move |outcome| classifier(outcome));
        }
        let breakers = CircuitBreakerRegistry::new(self.config.circuit_breaker, self.clock.clone())?;
        let limiter = RateLimiter::with_time(
            self.config.rate_limiter,
            self.clock.clone(),
            self.wall,
            self.sleeper.clone(),
        )?;
        Ok(Orchestrator {
            retry,
            breakers,
            limiter,
            sleeper: self.sleeper,
            clock: self.clock,
            sink: self.sink,
        })
    }
}
