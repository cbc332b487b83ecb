use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Infrastructure errors raised by collaborators and configuration.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP client could not be built or used.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Document could not be parsed into a structural element list.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Fingerprint store read or write failed.
    #[error("Store error: {0}")]
    StoreError(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Filesystem I/O failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Low-level network failure category reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Timeout,
    Connect,
    Reset,
    Dns,
    Body,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Connect => "connect",
            NetworkErrorKind::Reset => "reset",
            NetworkErrorKind::Dns => "dns",
            NetworkErrorKind::Body => "body",
        };
        f.write_str(s)
    }
}

/// Error surfaced by a [`Transport`](crate::traits::Transport) before any
/// HTTP status was received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection-level failure; always a candidate for retry.
    #[error("{kind} error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// The request itself could not be built (bad URL, unsupported scheme).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        TransportError::Network {
            kind,
            message: message.into(),
        }
    }
}

/// Failure reasons for a single URL fetch.
///
/// Retryable variants are resolved inside the orchestrator's retry loop;
/// only terminal ones end up in a [`FetchResult`](crate::models::FetchResult).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Timeout, reset, refused connection, DNS failure.
    #[error("network error ({kind}): {message}")]
    TransientNetwork {
        kind: NetworkErrorKind,
        message: String,
    },

    /// 429 or retryable 5xx response.
    #[error("server error: HTTP {status}")]
    TransientServer {
        status: u16,
        retry_after: Option<Duration>,
    },

    /// Any non-retryable HTTP error status.
    #[error("client error: HTTP {status}")]
    PermanentClient { status: u16 },

    /// The target's circuit is open; no transport call was made.
    #[error("circuit open for {target}, retry after {} seconds", .retry_after.as_secs())]
    CircuitOpen {
        target: String,
        retry_after: Duration,
    },

    /// No rate-limit token became available in time.
    #[error("rate limit permit for {target} not acquired within {}ms", .timeout.as_millis())]
    RateLimitTimeout { target: String, timeout: Duration },

    /// The per-request wall-clock budget ran out.
    #[error("deadline of {}ms exceeded after {attempts} attempts", .deadline.as_millis())]
    DeadlineExceeded { deadline: Duration, attempts: u32 },

    /// Every allowed attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<FetchError>,
    },

    /// An attempt beyond the configured maximum was classified.
    #[error("attempt {attempts} exceeds the limit of {max_attempts}")]
    AttemptLimitExceeded { attempts: u32, max_attempts: u32 },

    /// The batch was cancelled while this URL was in flight.
    #[error("fetch cancelled")]
    Cancelled,

    /// The URL or request could not be used at all.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::TransientNetwork { .. } | FetchError::TransientServer { .. }
        )
    }

    /// Returns true if this error counts against the target's circuit.
    ///
    /// Local conditions (admission control, cancellation, invalid input, an
    /// already open circuit) say nothing about the target's health.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            FetchError::TransientNetwork { .. }
            | FetchError::TransientServer { .. }
            | FetchError::PermanentClient { .. }
            | FetchError::DeadlineExceeded { .. } => true,
            FetchError::RetriesExhausted { last, .. } => last.should_trip_circuit(),
            FetchError::CircuitOpen { .. }
            | FetchError::RateLimitTimeout { .. }
            | FetchError::AttemptLimitExceeded { .. }
            | FetchError::Cancelled
            | FetchError::InvalidRequest(_) => false,
        }
    }

    /// True for HTTP 429 anywhere in the error chain.
    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }

    /// HTTP status associated with this failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::TransientServer { status, .. } | FetchError::PermanentClient { status } => {
                Some(*status)
            }
            FetchError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Server-mandated minimum delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::TransientServer { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Stable machine-readable code used in dead-letter records.
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::TransientNetwork { .. } => "TRANSIENT_NETWORK",
            FetchError::TransientServer { .. } => "TRANSIENT_SERVER",
            FetchError::PermanentClient { .. } => "PERMANENT_CLIENT",
            FetchError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            FetchError::RateLimitTimeout { .. } => "RATE_LIMIT_TIMEOUT",
            FetchError::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            FetchError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            FetchError::AttemptLimitExceeded { .. } => "ATTEMPT_LIMIT_EXCEEDED",
            FetchError::Cancelled => "CANCELLED",
            FetchError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }
}

impl From<TransportError> for FetchError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network { kind, message } => {
                FetchError::TransientNetwork { kind, message }
            }
            TransportError::InvalidRequest(msg) => FetchError::InvalidRequest(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(
            FetchError::TransientNetwork {
                kind: NetworkErrorKind::Reset,
                message: "reset".into(),
            }
            .is_retryable()
        );
        assert!(
            FetchError::TransientServer {
                status: 503,
                retry_after: None,
            }
            .is_retryable()
        );
        assert!(!FetchError::PermanentClient { status: 404 }.is_retryable());
        assert!(
            !FetchError::CircuitOpen {
                target: "x".into(),
                retry_after: Duration::from_secs(1),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_circuit_tripping() {
        assert!(
            FetchError::TransientServer {
                status: 500,
                retry_after: None,
            }
            .should_trip_circuit()
        );
        assert!(!FetchError::Cancelled.should_trip_circuit());
        assert!(
            !FetchError::RateLimitTimeout {
                target: "x".into(),
                timeout: Duration::ZERO,
            }
            .should_trip_circuit()
        );
    }

    #[test]
    fn test_status_walks_retries_exhausted() {
        let err = FetchError::RetriesExhausted {
            attempts: 3,
            last: Box::new(FetchError::TransientServer {
                status: 429,
                retry_after: None,
            }),
        };
        assert_eq!(err.status(), Some(429));
        assert!(err.is_rate_limited());
        assert_eq!(err.code(), "RETRIES_EXHAUSTED");
    }

    #[test]
    fn test_transport_error_conversion() {
        let err: FetchError = TransportError::network(NetworkErrorKind::Dns, "no such host").into();
        assert!(matches!(
            err,
            FetchError::TransientNetwork {
                kind: NetworkErrorKind::Dns,
                ..
            }
        ));

        let err: FetchError = TransportError::InvalidRequest("bad scheme".into()).into();
        assert!(!err.is_retryable());
    }
}
