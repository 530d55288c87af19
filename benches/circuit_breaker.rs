use backstop::{
    CallOptions, CircuitBreaker, CircuitBreakerConfig, Orchestrator, RateLimiterConfig,
    ResilienceConfig, RetryConfig, TransportError, Verdict,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use http::{Response, StatusCode};
use std::time::Duration;

fn config() -> ResilienceConfig {
    ResilienceConfig {
        retry: RetryConfig::disabled(),
        circuit_breaker: CircuitBreakerConfig::new(10, Duration::from_secs(30)).unwrap(),
        // Large enough that the limiter never waits during a run.
        rate_limiter: RateLimiterConfig::new(u32::MAX, Duration::from_secs(3600)),
    }
}

fn breaker_admit_record(c: &mut Criterion) {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig::default()).unwrap();
    c.bench_function("breaker_admit_record_success", |b| {
        b.iter(|| {
            if let Some(admission) = breaker.admit() {
                black_box(breaker.record(admission, Verdict::Success));
            }
        });
    });

    let open = CircuitBreaker::new(CircuitBreakerConfig::new(1, Duration::from_secs(3600)).unwrap())
        .unwrap();
    if let Some(admission) = open.admit() {
        open.record(admission, Verdict::Failure);
    }
    c.bench_function("breaker_reject_while_open", |b| {
        b.iter(|| black_box(open.admit()));
    });
}

fn orchestrated_calls(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let orchestrator = rt.block_on(async { Orchestrator::new(config()).unwrap() });

    c.bench_function("execute_success", |b| {
        b.to_async(&rt).iter(|| async {
            let response = orchestrator
                .execute("GET /bench", CallOptions::idempotent(), || async {
                    Ok::<_, TransportError>(Response::new(()))
                })
                .await;
            let _ = black_box(response);
        });
    });

    c.bench_function("execute_fail_fast_open_circuit", |b| {
        b.to_async(&rt).iter(|| async {
            let result = orchestrator
                .execute("GET /down", CallOptions::idempotent(), || async {
                    let mut response = Response::new(());
                    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                    Ok::<_, TransportError>(response)
                })
                .await;
            let _ = black_box(result);
        });
    });
}

criterion_group!(benches, breaker_admit_record, orchestrated_calls);
criterion_main!(benches);
