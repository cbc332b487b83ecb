//! Retry classification.
//!
//! This module is the only place that decides whether a failure is worth
//! another attempt. Responses and transport errors are first mapped to a
//! [`FetchOutcome`], then [`classify`] turns the outcome into a [`Decision`].

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{FetchError, TransportError};
use crate::models::{FetchOutcome, FetchResponse, RawResponse};

/// Statuses retried by default: rate limiting and transient server errors.
pub const DEFAULT_RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Retry budget for one URL.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,

    /// Wall-clock budget for all attempts and waits together.
    pub deadline: Duration,

    /// HTTP statuses treated as transient. Every other status >= 400 is fatal.
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            deadline: Duration::from_secs(60),
            retry_statuses: DEFAULT_RETRY_STATUSES.to_vec(),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, deadline: Duration) -> Self {
        Self {
            max_attempts,
            deadline,
            ..Self::default()
        }
    }
}

/// What to do after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The response is final and good.
    Succeed,
    /// Try again, waiting at least `not_before` if the server asked for it.
    Retry { not_before: Option<Duration> },
    /// Stop; the error is the terminal reason for this URL.
    GiveUp(FetchError),
}

/// Map an HTTP response to an outcome.
pub fn outcome_from_response(
    raw: RawResponse,
    latency: Duration,
    config: &RetryConfig,
) -> FetchOutcome {
    let status = raw.status;
    if status < 400 {
        return FetchOutcome::Success(FetchResponse::from_raw(raw, latency));
    }

    if config.retry_statuses.contains(&status) {
        let retry_after = raw.header("retry-after").and_then(parse_retry_after);
        FetchOutcome::TransientFailure(FetchError::TransientServer {
            status,
            retry_after,
        })
    } else {
        FetchOutcome::PermanentFailure(FetchError::PermanentClient { status })
    }
}

/// Map a transport error to an outcome. Network errors are transient;
/// malformed requests are not.
pub fn outcome_from_transport_error(err: TransportError) -> FetchOutcome {
    let err = FetchError::from(err);
    if err.is_retryable() {
        FetchOutcome::TransientFailure(err)
    } else {
        FetchOutcome::PermanentFailure(err)
    }
}

/// Decide what follows attempt number `attempt` (1-indexed), `elapsed`
/// into the request's lifetime.
///
/// An attempt number beyond the budget gives up whatever its outcome.
/// Within budget a success is kept, permanent failures give up at once and
/// transient failures give up once the deadline has passed or the last
/// allowed attempt has failed.
pub fn classify(
    outcome: &FetchOutcome,
    attempt: u32,
    elapsed: Duration,
    config: &RetryConfig,
) -> Decision {
    if attempt > config.max_attempts {
        return Decision::GiveUp(match outcome {
            FetchOutcome::TransientFailure(err) => FetchError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(err.clone()),
            },
            FetchOutcome::Success(_) | FetchOutcome::PermanentFailure(_) => {
                FetchError::AttemptLimitExceeded {
                    attempts: attempt,
                    max_attempts: config.max_attempts,
                }
            }
        });
    }

    match outcome {
        FetchOutcome::Success(_) => Decision::Succeed,
        FetchOutcome::PermanentFailure(err) => Decision::GiveUp(err.clone()),
        FetchOutcome::TransientFailure(err) => {
            if elapsed >= config.deadline {
                Decision::GiveUp(FetchError::DeadlineExceeded {
                    deadline: config.deadline,
                    attempts: attempt,
                })
            } else if attempt >= config.max_attempts {
                Decision::GiveUp(FetchError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err.clone()),
                })
            } else {
                Decision::Retry {
                    not_before: err.retry_after(),
                }
            }
        }
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some(
        (at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}
