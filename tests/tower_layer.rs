use backstop::telemetry::{RequestOutcome, RetryEvent};
use backstop::{
    CircuitBreakerConfig, MemorySink, Orchestrator, PolicyEvent, ResilienceError, ResilienceLayer,
    RetryConfig, RouteKey, TransportError,
};
use http::{Request, Response, StatusCode};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{ServiceBuilder, ServiceExt};

fn retries(max_retries: u32) -> RetryConfig {
    RetryConfig { max_retries, jitter: false, ..RetryConfig::default() }
}

/// Answers 503 for the first `failures` requests, then 200.
fn flaky(
    failures: u32,
    hits: Arc<AtomicU32>,
) -> impl Fn(Request<&'static str>) -> futures::future::Ready<Result<Response<String>, TransportError>>
       + Clone {
    move |request: Request<&'static str>| {
        let n = hits.fetch_add(1, Ordering::SeqCst);
        let status = if n < failures { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
        let response = Response::builder()
            .status(status)
            .body(format!("{} {}", request.method(), request.body()))
            .unwrap();
        futures::future::ready(Ok(response))
    }
}

#[tokio::test(start_paused = true)]
async fn idempotent_requests_are_retried_through_the_layer() {
    let hits = Arc::new(AtomicU32::new(0));
    let orchestrator = Orchestrator::builder().retry(retries(3)).build().unwrap();
    let client = ServiceBuilder::new()
        .layer(ResilienceLayer::new(orchestrator))
        .service_fn(flaky(1, hits.clone()));

    let request = Request::get("/users/7").body("payload").unwrap();
    let response = client.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body(), "GET payload");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn post_is_sent_once() {
    let hits = Arc::new(AtomicU32::new(0));
    let orchestrator = Orchestrator::builder().retry(retries(3)).build().unwrap();
    let client = ServiceBuilder::new()
        .layer(ResilienceLayer::new(orchestrator))
        .service_fn(flaky(1, hits.clone()));

    let request = Request::post("/messages").body("hello").unwrap();
    let err = client.oneshot(request).await.unwrap_err();

    assert_eq!(err, ResilienceError::Server { status: StatusCode::SERVICE_UNAVAILABLE, attempts: 1 });
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn route_key_extension_scopes_breaker_state() {
    let orchestrator = Arc::new(
        Orchestrator::builder()
            .retry(RetryConfig::disabled())
            .circuit_breaker(CircuitBreakerConfig::new(2, Duration::from_secs(30)).unwrap())
            .build()
            .unwrap(),
    );
    let hits = Arc::new(AtomicU32::new(0));
    let client = ServiceBuilder::new()
        .layer(ResilienceLayer::shared(orchestrator.clone()))
        .service_fn(flaky(u32::MAX, hits.clone()));

    for id in [1, 2] {
        let mut request = Request::get(format!("/channels/{id}/messages")).body("").unwrap();
        request.extensions_mut().insert(RouteKey::new("GET /channels/{id}/messages"));
        client.clone().oneshot(request).await.unwrap_err();
    }

    assert_eq!(orchestrator.breakers().len(), 1);
    assert_eq!(
        orchestrator.breakers().state("GET /channels/{id}/messages"),
        Some(backstop::CircuitState::Open)
    );

    let mut request = Request::get("/channels/3/messages").body("").unwrap();
    request.extensions_mut().insert(RouteKey::new("GET /channels/{id}/messages"));
    let err = client.clone().oneshot(request).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // The concrete path without a key is a separate route.
    let request = Request::get("/channels/3/messages").body("").unwrap();
    let err = client.oneshot(request).await.unwrap_err();
    assert!(matches!(err, ResilienceError::Server { .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn layer_emits_telemetry() {
    let sink = MemorySink::new();
    let orchestrator =
        Orchestrator::builder().retry(retries(2)).telemetry(sink.clone()).build().unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    let client = ServiceBuilder::new()
        .layer(ResilienceLayer::new(orchestrator))
        .service_fn(flaky(2, hits));

    client.oneshot(Request::get("/health").body("").unwrap()).await.unwrap();

    let events = sink.events_for("GET /health");
    let retries: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            PolicyEvent::Retry(RetryEvent::Attempt { attempt, .. }) => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2]);
    assert!(matches!(
        events.last(),
        Some(PolicyEvent::Request(RequestOutcome::Success { attempts: 3, .. }))
    ));
}
