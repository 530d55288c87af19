//! Rate-limit headers reported by servers.

use chrono::{DateTime, Utc};
use http::HeaderMap;
use std::time::Duration;

/// Names of the headers read after each response.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct RateLimitHeaders {
    /// Bucket capacity.
    pub limit: String,
    /// Tokens left in the current window.
    pub remaining: String,
    /// Seconds (decimal) until the window resets.
    pub reset_after: String,
    /// Unix epoch seconds (decimal) at which the window resets.
    pub reset: String,
    /// Server-assigned bucket id shared by several routes.
    pub bucket: String,
    /// Set to `true` when a 429 applies to the whole account.
    pub global: String,
    pub retry_after: String,
}

impl Default for RateLimitHeaders {
    fn default() -> Self {
        Self {
            limit: "x-ratelimit-limit".into(),
            remaining: "x-ratelimit-remaining".into(),
            reset_after: "x-ratelimit-reset-after".into(),
            reset: "x-ratelimit-reset".into(),
            bucket: "x-ratelimit-bucket".into(),
            global: "x-ratelimit-global".into(),
            retry_after: "retry-after".into(),
        }
    }
}

/// Values parsed from one response. Absent or unparsable headers stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitUpdate {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Window end relative to now, from either reset header.
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub global: bool,
    pub retry_after: Option<Duration>,
}

impl RateLimitUpdate {
    pub fn is_empty(&self) -> bool {
        self == &RateLimitUpdate::default()
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    if name.is_empty() {
        return None;
    }
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.parse().ok()?;
    if !secs.is_finite() {
        return None;
    }
    Duration::try_from_secs_f64(secs.max(0.0)).ok()
}

impl RateLimitHeaders {
    /// Parse rate-limit information; `now` resolves absolute reset times and HTTP-dates.
    pub fn parse(&self, headers: &HeaderMap, now: DateTime<Utc>) -> RateLimitUpdate {
        let reset_after = header(headers, &self.reset_after).and_then(seconds).or_else(|| {
            let epoch: f64 = header(headers, &self.reset)?.parse().ok()?;
            let now_secs = now.timestamp_millis() as f64 / 1000.0;
            seconds(&(epoch - now_secs).to_string())
        });
        RateLimitUpdate {
            limit: header(headers, &self.limit).and_then(|v| v.parse().ok()),
            remaining: header(headers, &self.remaining).and_then(|v| v.parse().ok()),
            reset_after,
            bucket: header(headers, &self.bucket).filter(|v| !v.is_empty()).map(str::to_string),
            global: header(headers, &self.global).is_some_and(|v| v.eq_ignore_ascii_case("true")),
            retry_after: header(headers, &self.retry_after)
                .and_then(|v| crate::outcome::parse_retry_after(v, now)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_470_173_000, 0).single().unwrap()
    }

    fn map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(*k, v.parse().unwrap());
        }
        headers
    }

    #[test]
    fn parses_full_header_set() {
        let headers = map(&[
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "1"),
            ("x-ratelimit-reset-after", "1.25"),
            ("x-ratelimit-bucket", "abcd1234"),
        ]);
        let update = RateLimitHeaders::default().parse(&headers, now());
        assert_eq!(update.limit, Some(5));
        assert_eq!(update.remaining, Some(1));
        assert_eq!(update.reset_after, Some(Duration::from_millis(1250)));
        assert_eq!(update.bucket.as_deref(), Some("abcd1234"));
        assert!(!update.global);
    }

    #[test]
    fn falls_back_to_epoch_reset() {
        let headers = map(&[("x-ratelimit-reset", "1470173023")]);
        let update = RateLimitHeaders::default().parse(&headers, now());
        assert_eq!(update.reset_after, Some(Duration::from_secs(23)));

        let past = map(&[("x-ratelimit-reset", "1470172000")]);
        assert_eq!(RateLimitHeaders::default().parse(&past, now()).reset_after, Some(Duration::ZERO));
    }

    #[test]
    fn reads_global_and_retry_after() {
        let headers = map(&[("x-ratelimit-global", "true"), ("retry-after", "5")]);
        let update = RateLimitHeaders::default().parse(&headers, now());
        assert!(update.global);
        assert_eq!(update.retry_after, Some(Duration::from_secs(5)));
    }

    #[test]
    fn garbage_is_ignored() {
        let headers = map(&[("x-ratelimit-limit", "lots"), ("x-ratelimit-remaining", "-1")]);
        let update = RateLimitHeaders::default().parse(&headers, now());
        assert!(update.is_empty());
    }

    #[test]
    fn custom_names_and_disabled_headers() {
        let names = RateLimitHeaders {
            remaining: "ratelimit-remaining".into(),
            bucket: String::new(),
            ..RateLimitHeaders::default()
        };
        let headers = map(&[("ratelimit-remaining", "7"), ("x-ratelimit-bucket", "ignored")]);
        let update = names.parse(&headers, now());
        assert_eq!(update.remaining, Some(7));
        assert_eq!(update.bucket, None);
    }
}
