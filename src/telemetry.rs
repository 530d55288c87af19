//! Structured events emitted by the orchestrator.
//!
//! Every event names the route it concerns. Events flow into a [`TelemetrySink`], which is any
//! cloneable `tower::Service<PolicyEvent>`; delivery is best-effort and never fails a call.
//!
//! - **Retry**: `Attempt`, `Exhausted`
//! - **Circuit breaker**: `Opened`, `HalfOpen`, `Closed`, `Rejected`
//! - **Rate limit**: `Waited`, `Throttled`
//! - **Request**: `Success`, `Failure`
//!
//! ```rust
//! use backstop::telemetry::{PolicyEvent, RetryEvent};
//! use std::time::Duration;
//!
//! let event = PolicyEvent::Retry(RetryEvent::Attempt {
//!     route: "GET /users".into(),
//!     attempt: 1,
//!     delay: Duration::from_millis(100),
//! });
//! assert_eq!(event.route(), "GET /users");
//! ```

use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// A cloneable `tower::Service` consuming [`PolicyEvent`]s.
pub trait TelemetrySink:
    tower::Service<PolicyEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver `event` if the sink becomes ready; errors are dropped.
pub async fn emit_best_effort<S>(sink: S, event: PolicyEvent)
where
    S: tower::Service<PolicyEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready) = sink.ready_oneshot().await {
        let _ = ready.call(event).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    Retry(RetryEvent),
    CircuitBreaker(CircuitBreakerEvent),
    RateLimit(RateLimitEvent),
    Request(RequestOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// Emitted before sleeping ahead of retry number `attempt` (1-indexed).
    Attempt { route: String, attempt: u32, delay: Duration },
    /// The ceiling was reached and the call still failed.
    Exhausted { route: String, total_attempts: u32, total_duration: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    Opened { route: String, failure_count: u32 },
    HalfOpen { route: String },
    Closed { route: String },
    /// A call was refused without a network attempt.
    Rejected { route: String, retry_in: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// The caller was suspended before sending.
    Waited { route: String, waited: Duration },
    /// A 429 closed a bucket.
    Throttled { route: String, wait: Duration, global: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { route: String, attempts: u32, duration: Duration },
    Failure { route: String, attempts: u32, duration: Duration },
}

impl PolicyEvent {
    pub fn route(&self) -> &str {
        match self {
            PolicyEvent::Retry(RetryEvent::Attempt { route, .. })
            | PolicyEvent::Retry(RetryEvent::Exhausted { route, .. })
            | PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened { route, .. })
            | PolicyEvent::CircuitBreaker(CircuitBreakerEvent::HalfOpen { route })
            | PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Closed { route })
            | PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Rejected { route, .. })
            | PolicyEvent::RateLimit(RateLimitEvent::Waited { route, .. })
            | PolicyEvent::RateLimit(RateLimitEvent::Throttled { route, .. })
            | PolicyEvent::Request(RequestOutcome::Success { route, .. })
            | PolicyEvent::Request(RequestOutcome::Failure { route, .. }) => route,
        }
    }
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Retry(event) => write!(f, "Retry::{}", event),
            PolicyEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            PolicyEvent::RateLimit(event) => write!(f, "RateLimit::{}", event),
            PolicyEvent::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { route, attempt, delay } => {
                write!(f, "Attempt({}, #{}, delay={:?})", route, attempt, delay)
            }
            RetryEvent::Exhausted { route, total_attempts, total_duration } => write!(
                f,
                "Exhausted({}, attempts={}, duration={:?})",
                route, total_attempts, total_duration
            ),
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { route, failure_count } => {
                write!(f, "Opened({}, failures={})", route, failure_count)
            }
            CircuitBreakerEvent::HalfOpen { route } => write!(f, "HalfOpen({})", route),
            CircuitBreakerEvent::Closed { route } => write!(f, "Closed({})", route),
            CircuitBreakerEvent::Rejected { route, retry_in } => {
                write!(f, "Rejected({}, retry_in={:?})", route, retry_in)
            }
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Waited { route, waited } => write!(f, "Waited({}, {:?})", route, waited),
            RateLimitEvent::Throttled { route, wait, global } => {
                let scope = if *global { "global" } else { "route" };
                write!(f, "Throttled({}, {:?}, {})", route, wait, scope)
            }
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { route, attempts, duration } => {
                write!(f, "Success({}, attempts={}, duration={:?})", route, attempts, duration)
            }
            RequestOutcome::Failure { route, attempts, duration } => {
                write!(f, "Failure({}, attempts={}, duration={:?})", route, attempts, duration)
            }
        }
    }
}

type SinkFuture<E> = Pin<Box<dyn std::future::Future<Output = Result<(), E>> + Send>>;

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<PolicyEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: PolicyEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs each event through `tracing` at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<PolicyEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        tracing::info!(route = event.route(), event = %event, "policy_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Bounded in-memory sink; the oldest events are evicted once full.
///
/// ```rust
/// use backstop::telemetry::{MemorySink, PolicyEvent, CircuitBreakerEvent};
/// use tower::Service;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut sink = MemorySink::with_capacity(1);
/// sink.call(PolicyEvent::CircuitBreaker(CircuitBreakerEvent::HalfOpen { route: "a".into() }))
///     .await
///     .unwrap();
/// sink.call(PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Closed { route: "a".into() }))
///     .await
///     .unwrap();
/// assert_eq!(sink.len(), 1);
/// assert_eq!(sink.evicted(), 1);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<PolicyEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Sink holding up to 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Vec<PolicyEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<PolicyEvent> {
        self.guard().clone()
    }

    /// Events concerning `route`, in arrival order.
    pub fn events_for(&self, route: &str) -> Vec<PolicyEvent> {
        self.guard().iter().filter(|e| e.route() == route).cloned().collect()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<PolicyEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        let mut guard = self.guard();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Error from one of the sinks behind a [`MulticastSink`].
#[derive(Debug, thiserror::Error)]
#[error("telemetry sink failed: {0}")]
pub struct ComposedSinkError(Box<dyn std::error::Error + Send + Sync>);

/// Sends every event to both sinks concurrently.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<PolicyEvent> for MulticastSink<A, B>
where
    A: tower::Service<PolicyEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<PolicyEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<ComposedSinkError>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        let mut sink_a = self.sink_a.clone();
        let mut sink_b = self.sink_b.clone();
        let copy = event.clone();
        Box::pin(async move {
            let (a, b) = tokio::join!(sink_a.call(event), sink_b.call(copy));
            a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            b.map_err(|e| ComposedSinkError(Box::new(e)))?;
            Ok(())
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: tower::Service<PolicyEvent, Response = ()> + Clone + Send + Sync + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<PolicyEvent, Response = ()> + Clone + Send + Sync + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}
