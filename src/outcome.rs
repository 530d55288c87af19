//! Classified results of a single transport attempt.
//!
//! Transports report either a response (any status) or a [`TransportError`] when nothing came
//! back. Each attempt is folded into an [`Outcome`], whose retryability is a pure function of its
//! tag.

use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode};
use std::fmt;
use std::time::Duration;

/// Why a transport could not produce a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionErrorKind {
    /// The transport's own deadline elapsed.
    Timeout,
    /// The peer reset or closed the connection mid-exchange.
    ConnectionReset,
    /// Nothing was listening at the resolved address.
    ConnectionRefused,
    /// Name resolution failed.
    Dns,
    /// The exchange was aborted below the HTTP layer (TLS failure, broken pipe, ...).
    Aborted,
    /// The request could not be built or encoded; sending it again cannot help.
    InvalidRequest,
    /// Anything the transport could not classify.
    Other,
}

impl ConnectionErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionReset | Self::ConnectionRefused | Self::Dns | Self::Aborted
        )
    }
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::ConnectionReset => "connection reset",
            Self::ConnectionRefused => "connection refused",
            Self::Dns => "dns failure",
            Self::Aborted => "aborted",
            Self::InvalidRequest => "invalid request",
            Self::Other => "transport error",
        };
        f.write_str(s)
    }
}

/// Connection-level failure reported by a transport (no response received).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: ConnectionErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::Timeout, message)
    }

    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::ConnectionReset, message)
    }

    pub fn dns(message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::Dns, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::InvalidRequest, message)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::TimedOut => ConnectionErrorKind::Timeout,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::UnexpectedEof => {
                ConnectionErrorKind::ConnectionReset
            }
            ErrorKind::ConnectionRefused => ConnectionErrorKind::ConnectionRefused,
            ErrorKind::BrokenPipe | ErrorKind::NotConnected => ConnectionErrorKind::Aborted,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => ConnectionErrorKind::InvalidRequest,
            _ => ConnectionErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

/// Result of one attempt, discriminated by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    ConnectionError(ConnectionErrorKind),
    HttpError {
        status: StatusCode,
        /// Server-supplied wait, already resolved against the current wall clock.
        retry_after: Option<Duration>,
    },
    Cancelled,
}

impl Outcome {
    /// Default classification: connection failures other than malformed requests, 5xx, 429, and
    /// 408 are retryable; everything else is fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Outcome::Success | Outcome::Cancelled => false,
            Outcome::ConnectionError(kind) => kind.is_retryable(),
            Outcome::HttpError { status, .. } => is_retryable_status(*status),
        }
    }

    /// Whether the outcome says the dependency is unhealthy (counts against the breaker).
    pub fn is_dependency_failure(&self) -> bool {
        match self {
            Outcome::ConnectionError(kind) => *kind != ConnectionErrorKind::InvalidRequest,
            Outcome::HttpError { status, .. } => is_retryable_status(*status),
            Outcome::Success | Outcome::Cancelled => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Outcome::HttpError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Outcome::HttpError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Parse a `Retry-After` value: delta-seconds (integer or decimal) or an HTTP-date.
///
/// Dates in the past and negative deltas resolve to zero.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<f64>() {
        if !secs.is_finite() {
            return None;
        }
        return Some(Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Read and parse the named retry-after header from a response.
pub fn retry_after_from_headers(
    headers: &HeaderMap,
    name: &str,
    now: DateTime<Utc>,
) -> Option<Duration> {
    headers.get(name).and_then(|v| v.to_str().ok()).and_then(|v| parse_retry_after(v, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 10, 21, h, m, s).single().unwrap()
    }

    #[test]
    fn classifies_http_statuses() {
        let retryable = [500, 502, 503, 504, 429, 408];
        for code in retryable {
            let outcome = Outcome::HttpError {
                status: StatusCode::from_u16(code).unwrap(),
                retry_after: None,
            };
            assert!(outcome.is_retryable(), "{code} should be retryable");
        }
        for code in [400, 401, 403, 404, 409, 422] {
            let outcome = Outcome::HttpError {
                status: StatusCode::from_u16(code).unwrap(),
                retry_after: None,
            };
            assert!(!outcome.is_retryable(), "{code} should be fatal");
            assert!(!outcome.is_dependency_failure());
        }
    }

    #[test]
    fn classifies_connection_errors() {
        assert!(Outcome::ConnectionError(ConnectionErrorKind::Timeout).is_retryable());
        assert!(Outcome::ConnectionError(ConnectionErrorKind::Dns).is_retryable());
        assert!(Outcome::ConnectionError(ConnectionErrorKind::Aborted).is_retryable());
        assert!(!Outcome::ConnectionError(ConnectionErrorKind::InvalidRequest).is_retryable());
        assert!(!Outcome::ConnectionError(ConnectionErrorKind::Other).is_retryable());
        assert!(!Outcome::Cancelled.is_retryable());
        assert!(!Outcome::Success.is_retryable());
    }

    #[test]
    fn io_errors_map_to_kinds() {
        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset").into();
        assert_eq!(err.kind, ConnectionErrorKind::ConnectionReset);
        assert!(err.to_string().contains("peer reset"));

        let err: TransportError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(err.kind, ConnectionErrorKind::Timeout);
    }

    #[test]
    fn parses_delta_seconds() {
        let now = at(7, 28, 0);
        assert_eq!(parse_retry_after("5", now), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 1.5 ", now), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("-3", now), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("", now), None);
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn parses_http_dates() {
        let now = at(7, 28, 0);
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now), Some(Duration::ZERO));
    }

    #[test]
    fn reads_header_by_name() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "2".parse().unwrap());
        assert_eq!(
            retry_after_from_headers(&headers, "retry-after", at(0, 0, 0)),
            Some(Duration::from_secs(2))
        );
        assert_eq!(retry_after_from_headers(&headers, "x-missing", at(0, 0, 0)), None);
    }
}
