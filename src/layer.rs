//! Tower middleware routing every request through an [`Orchestrator`].

use crate::error::ResilienceError;
use crate::orchestrator::Orchestrator;
use crate::outcome::TransportError;
use crate::telemetry::{NullSink, PolicyEvent, TelemetrySink};
use crate::transport::ServiceTransport;
use futures::future::BoxFuture;
use http::{Request, Response};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Wraps a transport service with retry, circuit breaking, and rate limiting.
///
/// ```rust
/// use backstop::{Orchestrator, ResilienceConfig, ResilienceLayer, TransportError};
/// use http::{Request, Response};
/// use tower::{ServiceBuilder, ServiceExt};
///
/// # #[tokio::main]
/// # async fn main() {
/// let orchestrator = Orchestrator::new(ResilienceConfig::default()).unwrap();
/// let client = ServiceBuilder::new()
///     .layer(ResilienceLayer::new(orchestrator))
///     .service_fn(|_req: Request<()>| async { Ok::<_, TransportError>(Response::new("ok")) });
///
/// let response = client.oneshot(Request::get("/health").body(()).unwrap()).await.unwrap();
/// assert_eq!(*response.body(), "ok");
/// # }
/// ```
#[derive(Debug)]
pub struct ResilienceLayer<Sink = NullSink> {
    orchestrator: Arc<Orchestrator<Sink>>,
}

impl<Sink> Clone for ResilienceLayer<Sink> {
    fn clone(&self) -> Self {
        Self { orchestrator: self.orchestrator.clone() }
    }
}

impl<Sink> ResilienceLayer<Sink> {
    pub fn new(orchestrator: Orchestrator<Sink>) -> Self {
        Self::shared(Arc::new(orchestrator))
    }

    /// Layer over an orchestrator that is also used elsewhere.
    pub fn shared(orchestrator: Arc<Orchestrator<Sink>>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator<Sink>> {
        &self.orchestrator
    }
}

impl<S, Sink> Layer<S> for ResilienceLayer<Sink> {
    type Service = ResilienceService<S, Sink>;

    fn layer(&self, inner: S) -> Self::Service {
        ResilienceService { inner, orchestrator: self.orchestrator.clone() }
    }
}

/// Service produced by [`ResilienceLayer`].
#[derive(Debug)]
pub struct ResilienceService<S, Sink = NullSink> {
    inner: S,
    orchestrator: Arc<Orchestrator<Sink>>,
}

impl<S: Clone, Sink> Clone for ResilienceService<S, Sink> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), orchestrator: self.orchestrator.clone() }
    }
}

impl<S, Sink, B, R> Service<Request<B>> for ResilienceService<S, Sink>
where
    S: Service<Request<B>, Response = Response<R>, Error = TransportError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
    B: Clone + Send + Sync + 'static,
    R: Send + 'static,
    Sink: TelemetrySink,
    <Sink as Service<PolicyEvent>>::Future: Send + 'static,
{
    type Response = Response<R>;
    type Error = ResilienceError;
    type Future = BoxFuture<'static, Result<Response<R>, ResilienceError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(|err| ResilienceError::Transport {
            kind: err.kind,
            message: err.message,
            attempts: 0,
        })
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let transport = ServiceTransport::new(self.inner.clone());
        let orchestrator = self.orchestrator.clone();
        Box::pin(async move { orchestrator.send(&transport, request).await })
    }
}
