//! The network seam.
//!
//! A [`Transport`] performs one HTTP exchange and reports either a response (any status) or a
//! [`TransportError`] when nothing came back. It carries its own per-request timeout; the
//! orchestrator only adds an overall deadline across attempts.

use crate::outcome::TransportError;
use async_trait::async_trait;
use http::{Method, Request, Response};
use tower::ServiceExt;

/// Performs a single HTTP exchange.
#[async_trait]
pub trait Transport<B: Send + 'static>: Send + Sync {
    type Body: Send;

    async fn send(&self, request: Request<B>) -> Result<Response<Self::Body>, TransportError>;
}

/// Adapts any cloneable `tower::Service` into a [`Transport`].
///
/// Each exchange drives a fresh clone of the service to readiness, so one adapter can serve many
/// concurrent calls.
#[derive(Debug, Clone)]
pub struct ServiceTransport<S> {
    inner: S,
}

impl<S> ServiceTransport<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S, B, R> Transport<B> for ServiceTransport<S>
where
    S: tower::Service<Request<B>, Response = Response<R>, Error = TransportError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
    B: Send + 'static,
    R: Send,
{
    type Body = R;

    async fn send(&self, request: Request<B>) -> Result<Response<R>, TransportError> {
        self.inner.clone().oneshot(request).await
    }
}

/// Route key scoping breaker and bucket state.
///
/// Attach one to a request's extensions to name the route by its path template
/// (`"GET /channels/{id}/messages"`) instead of the concrete path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The request's `RouteKey` extension, or `"{METHOD} {path}"`.
    pub fn of<B>(request: &Request<B>) -> Self {
        if let Some(key) = request.extensions().get::<RouteKey>() {
            return key.clone();
        }
        Self(format!("{} {}", request.method(), request.uri().path()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a request may be sent more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    Idempotent,
    NonIdempotent,
}

impl Idempotency {
    /// Request extension if present, else the method's semantics (GET, HEAD, OPTIONS, TRACE, PUT
    /// and DELETE are idempotent).
    pub fn of<B>(request: &Request<B>) -> Self {
        if let Some(explicit) = request.extensions().get::<Idempotency>() {
            return *explicit;
        }
        Self::of_method(request.method())
    }

    pub fn of_method(method: &Method) -> Self {
        match *method {
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE => {
                Idempotency::Idempotent
            }
            _ => Idempotency::NonIdempotent,
        }
    }

    pub fn is_idempotent(self) -> bool {
        self == Idempotency::Idempotent
    }
}

/// Copy of `request` for one more attempt.
pub(crate) fn clone_request<B: Clone>(request: &Request<B>) -> Request<B> {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    *copy.extensions_mut() = request.extensions().clone();
    copy
}
