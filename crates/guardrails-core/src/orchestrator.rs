use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::EngineConfig;
use crate::diffwatch::DiffWatcher;
use crate::error::{FetchError, NetworkErrorKind};
use crate::models::{FetchOutcome, FetchRequest, FetchResult};
use crate::rate_limiter::RateLimiter;
use crate::retry::{self, Decision, RetryConfig};
use crate::traits::{DeadLetterSink, DocumentParser, FingerprintStore, ResultSink, Transport};

/// Events emitted while driving a URL, for monitoring/logging.
#[derive(Debug, Clone)]
pub enum FetchEvent<'a> {
    AttemptStarted {
        url: &'a str,
        attempt: u32,
    },
    Retrying {
        url: &'a str,
        attempt: u32,
        delay: Duration,
        error: &'a FetchError,
    },
    Rejected {
        url: &'a str,
        error: &'a FetchError,
    },
    Completed {
        result: &'a FetchResult,
    },
    SinkFailed {
        url: &'a str,
        sink: &'static str,
        error: &'a str,
    },
}

/// Trait for receiving fetch events (decoupled logging).
pub trait FetchReporter: Send + Sync {
    fn report(&self, event: FetchEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFetchReporter;

impl FetchReporter for TracingFetchReporter {
    fn report(&self, event: FetchEvent<'_>) {
        match event {
            FetchEvent::AttemptStarted { url, attempt } => {
                tracing::debug!(%url, %attempt, "Sending request");
            }
            FetchEvent::Retrying {
                url,
                attempt,
                delay,
                error,
            } => {
                tracing::info!(
                    %url,
                    %attempt,
                    delay_ms = %delay.as_millis(),
                    %error,
                    "Attempt failed, backing off"
                );
            }
            FetchEvent::Rejected { url, error } => {
                tracing::warn!(%url, %error, "Request rejected before sending");
            }
            FetchEvent::Completed { result } => match &result.outcome {
                FetchOutcome::Success(resp) => {
                    tracing::info!(
                        url = %result.url,
                        status = resp.status,
                        attempts = result.attempts,
                        elapsed_ms = %result.elapsed.as_millis(),
                        struct_changed = result.struct_changed(),
                        "Fetched"
                    );
                }
                FetchOutcome::TransientFailure(error) | FetchOutcome::PermanentFailure(error) => {
                    tracing::warn!(
                        url = %result.url,
                        code = error.code(),
                        attempts = result.attempts,
                        elapsed_ms = %result.elapsed.as_millis(),
                        %error,
                        "Fetch failed"
                    );
                }
            },
            FetchEvent::SinkFailed { url, sink, error } => {
                tracing::error!(%url, %sink, %error, "Failed to record result");
            }
        }
    }
}

/// Drives URLs through circuit breaker, rate limiter, transport, retry
/// classification and drift detection, producing one [`FetchResult`] each.
pub struct FetchOrchestrator<T, P, S, D, R>
where
    T: Transport,
    P: DocumentParser,
    S: FingerprintStore,
    D: DeadLetterSink,
    R: ResultSink,
{
    transport: T,
    rate_limiter: Arc<RateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    backoff: BackoffPolicy,
    diff_watcher: Option<DiffWatcher<P, S>>,
    dead_letters: D,
    results: R,
    max_concurrency: usize,
}

impl<T, P, S, D, R> FetchOrchestrator<T, P, S, D, R>
where
    T: Transport,
    P: DocumentParser,
    S: FingerprintStore,
    D: DeadLetterSink,
    R: ResultSink,
{
    pub fn new(transport: T, config: &EngineConfig, dead_letters: D, results: R) -> Self {
        Self {
            transport,
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            circuit_breaker: Arc::new(CircuitBreaker::new(config.circuit.clone())),
            retry: config.retry.clone(),
            backoff: config.backoff,
            diff_watcher: None,
            dead_letters,
            results,
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    /// Fingerprint successful bodies with `watcher`.
    pub fn with_diff_watcher(mut self, watcher: DiffWatcher<P, S>) -> Self {
        self.diff_watcher = Some(watcher);
        self
    }

    /// Share a rate limiter with other orchestrators.
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    /// Share a circuit breaker with other orchestrators.
    pub fn with_circuit_breaker(mut self, circuit_breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Fetch one URL, logging through `tracing`.
    pub async fn fetch(&self, url: &str, cancel: &CancellationToken) -> FetchResult {
        self.fetch_with(url, cancel, &TracingFetchReporter).await
    }

    /// Fetch every URL with at most `max_concurrency` in flight. Results
    /// come back in input order.
    pub async fn fetch_all<I>(&self, urls: I, cancel: &CancellationToken) -> Vec<FetchResult>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.fetch_all_with(urls, cancel, &TracingFetchReporter)
            .await
    }

    pub async fn fetch_all_with<I, FR>(
        &self,
        urls: I,
        cancel: &CancellationToken,
        reporter: &FR,
    ) -> Vec<FetchResult>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        FR: FetchReporter,
    {
        futures::stream::iter(urls)
            .map(|url| async move { self.fetch_with(url.as_ref(), cancel, reporter).await })
            .buffered(self.max_concurrency)
            .collect()
            .await
    }

    /// Fetch one URL until it succeeds or fails for good.
    ///
    /// Never panics and never returns early without a result: a successful
    /// result has been offered to the diff watcher, a failed one (other than
    /// cancellation) to the dead-letter sink, and every result to the result
    /// sink. Sink errors are reported, not propagated.
    pub async fn fetch_with<FR: FetchReporter>(
        &self,
        url: &str,
        cancel: &CancellationToken,
        reporter: &FR,
    ) -> FetchResult {
        let mut result = match FetchRequest::new(url, self.retry.deadline) {
            Ok(mut request) => {
                let outcome = self.drive(&mut request, cancel, reporter).await;
                FetchResult {
                    url: request.url().to_string(),
                    target_key: request.target_key().to_string(),
                    outcome,
                    attempts: request.attempt(),
                    elapsed: request.elapsed(),
                    fingerprint: None,
                    diff: None,
                }
            }
            Err(error) => {
                reporter.report(FetchEvent::Rejected { url, error: &error });
                FetchResult {
                    url: url.to_string(),
                    target_key: String::new(),
                    outcome: FetchOutcome::PermanentFailure(error),
                    attempts: 0,
                    elapsed: Duration::ZERO,
                    fingerprint: None,
                    diff: None,
                }
            }
        };

        if let (Some(watcher), Some(resp)) = (&self.diff_watcher, result.outcome.response()) {
            let key = watcher.key_for(&result.url, &result.target_key);
            match watcher.observe(key, &resp.body).await {
                Ok(record) => {
                    result.fingerprint = Some(record.current.clone());
                    result.diff = Some(record);
                }
                Err(e) => reporter.report(FetchEvent::SinkFailed {
                    url,
                    sink: "diff_watcher",
                    error: &e.to_string(),
                }),
            }
        }

        if let FetchOutcome::PermanentFailure(error) = &result.outcome
            && *error != FetchError::Cancelled
            && let Err(e) = self
                .dead_letters
                .record(&result.url, &result.outcome, result.attempts)
                .await
        {
            reporter.report(FetchEvent::SinkFailed {
                url,
                sink: "dead_letter",
                error: &e.to_string(),
            });
        }

        if let Err(e) = self.results.record(&result).await {
            reporter.report(FetchEvent::SinkFailed {
                url,
                sink: "results",
                error: &e.to_string(),
            });
        }

        reporter.report(FetchEvent::Completed { result: &result });
        result
    }

    /// The attempt loop. Returns the terminal outcome; `request` carries the
    /// attempt count and elapsed time.
    async fn drive<FR: FetchReporter>(
        &self,
        request: &mut FetchRequest,
        cancel: &CancellationToken,
        reporter: &FR,
    ) -> FetchOutcome {
        let mut rng = fastrand::Rng::new();

        loop {
            if cancel.is_cancelled() {
                return FetchOutcome::PermanentFailure(FetchError::Cancelled);
            }
            let Some(remaining) = request.remaining() else {
                return FetchOutcome::PermanentFailure(self.deadline_exceeded(request));
            };

            let permit = match self.circuit_breaker.check(request.target_key()) {
                Ok(permit) => permit,
                Err(error) => {
                    reporter.report(FetchEvent::Rejected {
                        url: request.url(),
                        error: &error,
                    });
                    return FetchOutcome::PermanentFailure(error);
                }
            };

            // The deadline bounds the token wait as well; whichever limit is
            // tighter decides how the failure is reported.
            let configured = self.rate_limiter.config().acquire_timeout;
            let budget = configured.map_or(remaining, |t| t.min(remaining));
            let acquired = tokio::select! {
                () = cancel.cancelled() => {
                    return FetchOutcome::PermanentFailure(FetchError::Cancelled);
                }
                acquired = self.rate_limiter.acquire_timeout(request.target_key(), budget) => acquired,
            };
            if let Err(error) = acquired {
                let error = match configured {
                    Some(t) if t <= remaining => error,
                    _ => self.deadline_exceeded(request),
                };
                reporter.report(FetchEvent::Rejected {
                    url: request.url(),
                    error: &error,
                });
                return FetchOutcome::PermanentFailure(error);
            }

            let attempt = request.begin_attempt();
            let Some(remaining) = request.remaining() else {
                return FetchOutcome::PermanentFailure(self.deadline_exceeded(request));
            };
            reporter.report(FetchEvent::AttemptStarted {
                url: request.url(),
                attempt,
            });

            let sent_at = Instant::now();
            let sent = tokio::select! {
                () = cancel.cancelled() => {
                    return FetchOutcome::PermanentFailure(FetchError::Cancelled);
                }
                sent = tokio::time::timeout(remaining, self.transport.send(request.url())) => sent,
            };
            let outcome = match sent {
                Ok(Ok(raw)) => retry::outcome_from_response(raw, sent_at.elapsed(), &self.retry),
                Ok(Err(e)) => retry::outcome_from_transport_error(e),
                Err(_) => FetchOutcome::TransientFailure(FetchError::TransientNetwork {
                    kind: NetworkErrorKind::Timeout,
                    message: "deadline reached while waiting for response".into(),
                }),
            };

            match &outcome {
                FetchOutcome::Success(_) => self.circuit_breaker.record_success(permit),
                FetchOutcome::TransientFailure(error) | FetchOutcome::PermanentFailure(error)
                    if error.should_trip_circuit() =>
                {
                    self.circuit_breaker.record_failure(permit, error);
                }
                _ => drop(permit),
            }

            match retry::classify(&outcome, attempt, request.elapsed(), &self.retry) {
                Decision::Succeed => return outcome,
                Decision::GiveUp(error) => return FetchOutcome::PermanentFailure(error),
                Decision::Retry { not_before } => {
                    let delay = self.backoff.delay_with(attempt, not_before, &mut rng);
                    if request.remaining().is_none_or(|left| delay >= left) {
                        return FetchOutcome::PermanentFailure(self.deadline_exceeded(request));
                    }
                    if let Some(error) = outcome.error() {
                        reporter.report(FetchEvent::Retrying {
                            url: request.url(),
                            attempt,
                            delay,
                            error,
                        });
                    }
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return FetchOutcome::PermanentFailure(FetchError::Cancelled);
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn deadline_exceeded(&self, request: &FetchRequest) -> FetchError {
        FetchError::DeadlineExceeded {
            deadline: request.deadline(),
            attempts: request.attempt(),
        }
    }
}
