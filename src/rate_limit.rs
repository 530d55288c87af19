//! Per-route admission control corrected by server rate-limit headers.
//!
//! - [`Bucket`]: fixed-window token bucket (pure state, guarded by a per-route mutex).
//! - [`RateLimitHeaders`]: names of the headers servers use to report quota.
//! - [`RateLimiter`]: route buckets, server-assigned shared buckets, and an optional global bucket.
//!
//! A route starts with its own bucket sized by [`RateLimiterConfig::default_capacity`]. When a
//! response carries a bucket id, the route is remapped onto the shared bucket for that id, so
//! several routes the server counts together also wait together.

use crate::clock::{duration_to_millis, Clock, MonotonicClock, SystemWallClock, WallClock};
use crate::error::ConfigError;
use crate::registry::Registry;
use crate::sleeper::{Sleeper, TokioSleeper};
use http::{HeaderMap, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

pub mod bucket;
pub mod headers;

pub use bucket::{Bucket, BucketSnapshot};
pub use headers::{RateLimitHeaders, RateLimitUpdate};

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct RateLimiterConfig {
    /// Tokens per window for a route the server has not described yet.
    pub default_capacity: u32,
    /// Window length used until the server reports its own reset time.
    pub refill_interval: Duration,
    /// Account-wide ceiling checked in addition to the route bucket.
    pub global_capacity: Option<u32>,
    pub headers: RateLimitHeaders,
    /// Wait applied on a 429 that carries no usable retry hint.
    pub default_rate_limited_wait: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_capacity: 50,
            refill_interval: Duration::from_secs(1),
            global_capacity: None,
            headers: RateLimitHeaders::default(),
            default_rate_limited_wait: Duration::from_secs(1),
        }
    }
}

impl RateLimiterConfig {
    pub fn new(default_capacity: u32, refill_interval: Duration) -> Self {
        Self { default_capacity, refill_interval, ..Self::default() }
    }

    pub fn with_global_capacity(mut self, capacity: u32) -> Self {
        self.global_capacity = Some(capacity);
        self
    }

    pub fn with_headers(mut self, headers: RateLimitHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_capacity == 0 || self.global_capacity == Some(0) {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.refill_interval.is_zero() {
            return Err(ConfigError::ZeroRefillInterval);
        }
        Ok(())
    }
}

/// What the limiter learned from one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitFeedback {
    pub update: RateLimitUpdate,
    /// Set when a 429 emptied a bucket; the bucket stays closed for this long.
    pub throttled_for: Option<Duration>,
    /// Whether the throttle applied to the global bucket.
    pub global: bool,
    /// Server bucket id the route was newly remapped onto.
    pub remapped_to: Option<String>,
}

type Shared = Mutex<Bucket>;

fn lock(bucket: &Shared) -> std::sync::MutexGuard<'_, Bucket> {
    bucket.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Route-scoped, server-corrected rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    routes: Registry<Shared>,
    server_buckets: Registry<Shared>,
    bucket_ids: RwLock<HashMap<String, String>>,
    global: Shared,
    clock: Arc<dyn Clock>,
    wall: Arc<dyn WallClock>,
    sleeper: Arc<dyn Sleeper>,
}

impl RateLimiter {
    /// Limiter on the tokio clock.
    pub fn new(config: RateLimiterConfig) -> Result<Self, ConfigError> {
        Self::with_time(
            config,
            Arc::new(MonotonicClock::default()),
            Arc::new(SystemWallClock),
            Arc::new(TokioSleeper),
        )
    }

    pub fn with_time(
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
        wall: Arc<dyn WallClock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let global = Bucket::new(config.global_capacity.unwrap_or(u32::MAX), config.refill_interval);
        Ok(Self {
            config,
            routes: Registry::new(),
            server_buckets: Registry::new(),
            bucket_ids: RwLock::new(HashMap::new()),
            global: Mutex::new(global),
            clock,
            wall,
            sleeper,
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn fresh_bucket(&self) -> Shared {
        Mutex::new(Bucket::new(self.config.default_capacity, self.config.refill_interval))
    }

    /// Server bucket id the route is mapped onto, if any.
    pub fn bucket_id(&self, route: &str) -> Option<String> {
        self.bucket_ids.read().unwrap_or_else(PoisonError::into_inner).get(route).cloned()
    }

    fn bucket(&self, route: &str) -> Arc<Shared> {
        match self.bucket_id(route) {
            Some(id) => self.server_buckets.get_or_insert_with(&id, || self.fresh_bucket()),
            None => self.routes.get_or_insert_with(route, || self.fresh_bucket()),
        }
    }

    /// Take one token from the global and the route bucket, or report the longer wait.
    fn take(&self, bucket: &Shared) -> Result<(), Duration> {
        let now = self.clock.now_millis();
        let mut global = lock(&self.global);
        let mut local = lock(bucket);
        let wait = match (global.check(now), local.check(now)) {
            (None, None) => None,
            (a, b) => a.max(b),
        };
        match wait {
            None => {
                global.consume(now);
                local.consume(now);
                Ok(())
            }
            Some(wait) => Err(wait),
        }
    }

    /// Take a token for `route` without waiting.
    pub fn try_acquire(&self, route: &str) -> Result<(), Duration> {
        self.take(&self.bucket(route))
    }

    /// Wait until `route` may send, then take its token. Returns the total time spent waiting.
    ///
    /// A sleeper that returns without moving the limiter's clock (such as
    /// [`InstantSleeper`](crate::sleeper::InstantSleeper)) is backed by the tokio timer, so the
    /// wait always suspends.
    pub async fn acquire(&self, route: &str) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            // Re-resolve each pass: a response may have remapped the route while we slept.
            let bucket = self.bucket(route);
            match self.take(&bucket) {
                Ok(()) => return waited,
                Err(wait) => {
                    tracing::debug!(route, wait_ms = duration_to_millis(wait), "rate limit wait");
                    let before = self.clock.now_millis();
                    self.sleeper.sleep(wait).await;
                    if self.clock.now_millis() == before {
                        tokio::time::sleep(wait).await;
                    }
                    waited = waited.saturating_add(wait);
                }
            }
        }
    }

    /// Correct bucket state from a response and react to 429.
    pub fn update_from_response(
        &self,
        route: &str,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> RateLimitFeedback {
        let update = self.config.headers.parse(headers, self.wall.now());
        let mut feedback = RateLimitFeedback::default();

        if let Some(id) = update.bucket.as_deref() {
            let mut ids = self.bucket_ids.write().unwrap_or_else(PoisonError::into_inner);
            if ids.get(route).map(String::as_str) != Some(id) {
                ids.insert(route.to_string(), id.to_string());
                tracing::debug!(route, bucket = id, "route remapped to server bucket");
                feedback.remapped_to = Some(id.to_string());
            }
        }

        let now = self.clock.now_millis();
        let bucket = self.bucket(route);
        lock(&bucket).apply(&update, now);

        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = update
                .retry_after
                .or(update.reset_after)
                .unwrap_or(self.config.default_rate_limited_wait);
            if update.global {
                lock(&self.global).throttle(wait, true, now);
                tracing::warn!(route, wait_ms = duration_to_millis(wait), "global rate limit hit");
            } else {
                lock(&bucket).throttle(wait, false, now);
                tracing::warn!(route, wait_ms = duration_to_millis(wait), "route rate limit hit");
            }
            feedback.throttled_for = Some(wait);
            feedback.global = update.global;
        }
        feedback.update = update;
        feedback
    }

    /// Current view of the bucket serving `route`; `None` if the route was never used.
    pub fn snapshot(&self, route: &str) -> Option<BucketSnapshot> {
        let now = self.clock.now_millis();
        let bucket = match self.bucket_id(route) {
            Some(id) => self.server_buckets.get(&id)?,
            None => self.routes.get(route)?,
        };
        let snapshot = lock(&bucket).snapshot(now);
        Some(snapshot)
    }

    pub fn global_snapshot(&self) -> Option<BucketSnapshot> {
        if self.config.global_capacity.is_none() {
            return None;
        }
        Some(lock(&self.global).snapshot(self.clock.now_millis()))
    }

    /// Routes with bucket state, sorted.
    pub fn routes(&self) -> Vec<String> {
        let mut routes = self.routes.keys();
        let ids = self.bucket_ids.read().unwrap_or_else(PoisonError::into_inner);
        routes.extend(ids.keys().filter(|r| !self.routes.contains(r)).cloned());
        routes.sort();
        routes
    }

    /// Forget the route's bucket and its server mapping. Shared server buckets survive for other
    /// routes. Returns whether anything was known about the route.
    pub fn reset(&self, route: &str) -> bool {
        let mapped = self
            .bucket_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(route)
            .is_some();
        self.routes.remove(route).is_some() || mapped
    }

    /// Drop every bucket, mapping, and global throttle.
    pub fn clear(&self) {
        self.routes.clear();
        self.server_buckets.clear();
        self.bucket_ids.write().unwrap_or_else(PoisonError::into_inner).clear();
        *lock(&self.global) =
            Bucket::new(self.config.global_capacity.unwrap_or(u32::MAX), self.config.refill_interval);
    }
}
