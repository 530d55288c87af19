#![cfg(feature = "serde")]

use backstop::{presets, FailureThreshold, ResilienceConfig};
use std::time::Duration;

#[test]
fn config_round_trips_through_json() {
    let config = presets::batch_job();
    let json = serde_json::to_string(&config).unwrap();
    let back: ResilienceConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);
}

#[test]
fn partial_config_falls_back_to_defaults() {
    let json = r#"{
        "retry": { "max_retries": 7 },
        "rate_limiter": { "global_capacity": 20, "headers": { "bucket": "x-bucket-id" } }
    }"#;
    let config: ResilienceConfig = serde_json::from_str(json).unwrap();

    assert_eq!(config.retry.max_retries, 7);
    assert_eq!(config.retry.initial_delay, Duration::from_millis(100));
    assert_eq!(config.circuit_breaker.failure_threshold, FailureThreshold::Consecutive(5));
    assert_eq!(config.rate_limiter.global_capacity, Some(20));
    assert_eq!(config.rate_limiter.default_capacity, 50);
    assert_eq!(config.rate_limiter.headers.bucket, "x-bucket-id");
    assert_eq!(config.rate_limiter.headers.remaining, "x-ratelimit-remaining");
}
