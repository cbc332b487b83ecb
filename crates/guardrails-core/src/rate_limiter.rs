//! Token-bucket admission control for outbound requests.
//!
//! Each target key owns a bucket that refills continuously from elapsed
//! time, so idle periods accumulate burst credit up to the capacity.
//! Waiting happens outside the bucket's lock; only the token arithmetic
//! is serialised.
//!
//! # Example
//!
//! ```rust,no_run
//! use guardrails_core::rate_limiter::{RateLimitConfig, RateLimiter};
//!
//! # async fn run() {
//! // 2 requests/second per host, bursts of up to 4
//! let limiter = RateLimiter::new(RateLimitConfig::new(2.0, 4));
//! let permit = limiter.acquire("https://example.com:443").await;
//! assert_eq!(permit.target_key, "https://example.com:443");
//! # }
//! ```

use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::FetchError;
use crate::keyed::{KeyedState, lock};

const GLOBAL_KEY: &str = "*";

/// Whether buckets are per target key or shared by every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitScope {
    #[default]
    PerTarget,
    Global,
}

impl FromStr for RateLimitScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "target" | "per-target" => Ok(RateLimitScope::PerTarget),
            "global" => Ok(RateLimitScope::Global),
            _ => Err(format!("Unknown rate limit scope: {}", s)),
        }
    }
}

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub refill_per_sec: f64,

    /// Bucket capacity; also the number of requests allowed back to back
    /// after an idle period.
    pub burst: u32,

    pub scope: RateLimitScope,

    /// Upper bound on how long a request may wait for a token.
    /// `None` waits as long as the request deadline allows.
    pub acquire_timeout: Option<Duration>,
}

impl RateLimitConfig {
    pub fn new(refill_per_sec: f64, burst: u32) -> Self {
        Self {
            refill_per_sec,
            burst,
            ..Default::default()
        }
    }

    pub fn with_scope(mut self, scope: RateLimitScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

impl Default for RateLimitConfig {
    /// 1.5 requests/second with a burst of 3.
    fn default() -> Self {
        Self {
            refill_per_sec: 1.5,
            burst: 3,
            scope: RateLimitScope::PerTarget,
            acquire_timeout: None,
        }
    }
}

/// Proof that one token was deducted for `target_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePermit {
    pub target_key: String,
    /// Time spent waiting for the token.
    pub waited: Duration,
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(config: &RateLimitConfig) -> Self {
        let capacity = f64::from(config.burst.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: config.refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Deduct one token, or return how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        if self.refill_per_sec <= 0.0 {
            return Err(Duration::MAX);
        }
        let secs = (1.0 - self.tokens) / self.refill_per_sec;
        Err(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }
}

/// Keyed token-bucket rate limiter. Buckets are created on first use and
/// live as long as the limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: KeyedState<TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: KeyedState::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn bucket_key<'a>(&self, target_key: &'a str) -> &'a str {
        match self.config.scope {
            RateLimitScope::PerTarget => target_key,
            RateLimitScope::Global => GLOBAL_KEY,
        }
    }

    fn take(&self, target_key: &str) -> Result<(), Duration> {
        let bucket = self
            .buckets
            .entry(self.bucket_key(target_key), || TokenBucket::full(&self.config));
        let mut bucket = lock(&bucket);
        bucket.try_take(Instant::now())
    }

    /// Wait until a token is available for `target_key`, then take it.
    pub async fn acquire(&self, target_key: &str) -> RatePermit {
        let start = Instant::now();
        loop {
            match self.take(target_key) {
                Ok(()) => {
                    return RatePermit {
                        target_key: target_key.to_string(),
                        waited: start.elapsed(),
                    };
                }
                Err(wait) => {
                    tracing::debug!(
                        host = %target_key,
                        sleep_ms = %wait.as_millis(),
                        "Rate limited, waiting for token"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up with
    /// [`FetchError::RateLimitTimeout`] as soon as it is clear no token will
    /// arrive within `timeout`.
    pub async fn acquire_timeout(
        &self,
        target_key: &str,
        timeout: Duration,
    ) -> Result<RatePermit, FetchError> {
        let start = Instant::now();
        loop {
            match self.take(target_key) {
                Ok(()) => {
                    return Ok(RatePermit {
                        target_key: target_key.to_string(),
                        waited: start.elapsed(),
                    });
                }
                Err(wait) => {
                    if start.elapsed().saturating_add(wait) > timeout {
                        tracing::debug!(
                            host = %target_key,
                            timeout_ms = %timeout.as_millis(),
                            "Rate limit token not available in time"
                        );
                        return Err(FetchError::RateLimitTimeout {
                            target: target_key.to_string(),
                            timeout,
                        });
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Tokens currently available for `target_key` (a full bucket if it
    /// has never been used).
    pub fn available(&self, target_key: &str) -> f64 {
        match self.buckets.get(self.bucket_key(target_key)) {
            Some(bucket) => {
                let mut bucket = lock(&bucket);
                bucket.refill(Instant::now());
                bucket.tokens
            }
            None => f64::from(self.config.burst.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn bucket_refills_from_elapsed_time() {
        let config = RateLimitConfig::new(10.0, 2);
        let mut bucket = TokenBucket::full(&config);
        let t0 = bucket.last_refill;

        assert!(bucket.try_take(t0).is_ok());
        assert!(bucket.try_take(t0).is_ok());
        let wait = bucket.try_take(t0).unwrap_err();
        assert!(wait.abs_diff(Duration::from_millis(100)) < Duration::from_micros(1));

        // 150ms later one and a half tokens have been added.
        assert!(bucket.try_take(t0 + Duration::from_millis(150)).is_ok());
        assert!(bucket.tokens > 0.4 && bucket.tokens < 0.6);
    }

    #[test]
    fn bucket_never_exceeds_capacity() {
        let config = RateLimitConfig::new(100.0, 3);
        let mut bucket = TokenBucket::full(&config);
        let later = bucket.last_refill + Duration::from_secs(60);
        bucket.refill(later);
        assert_eq!(bucket.tokens, 3.0);
    }

    #[test]
    fn zero_rate_never_refills() {
        let config = RateLimitConfig::new(0.0, 1);
        let mut bucket = TokenBucket::full(&config);
        let now = bucket.last_refill;
        assert!(bucket.try_take(now).is_ok());
        assert_eq!(bucket.try_take(now).unwrap_err(), Duration::MAX);
    }

    #[tokio::test]
    async fn burst_does_not_block() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1.0, 5));

        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire("http://example.com:80").await;
        }
        assert!(
            start.elapsed() < Duration::from_millis(50),
            "Burst acquisitions should not wait, elapsed: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn acquisition_beyond_burst_waits_for_refill() {
        let limiter = RateLimiter::new(RateLimitConfig::new(10.0, 3));

        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire("http://example.com:80").await;
        }
        let permit = limiter.acquire("http://example.com:80").await;
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(100),
            "Fourth request should wait at least 1/rate, elapsed: {elapsed:?}"
        );
        assert!(permit.waited > Duration::ZERO);
    }

    #[tokio::test]
    async fn different_targets_do_not_block_each_other() {
        let limiter = RateLimiter::new(RateLimitConfig::new(0.5, 1));

        let start = Instant::now();
        limiter.acquire("http://example.com:80").await;
        limiter.acquire("http://other.com:80").await;

        assert!(
            start.elapsed() < Duration::from_millis(50),
            "Different targets should not share a bucket, elapsed: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn global_scope_shares_one_bucket() {
        let limiter =
            RateLimiter::new(RateLimitConfig::new(0.1, 1).with_scope(RateLimitScope::Global));

        limiter.acquire("http://example.com:80").await;
        let err = limiter
            .acquire_timeout("http://other.com:80", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RateLimitTimeout { .. }));
    }

    #[tokio::test]
    async fn acquire_timeout_fails_fast() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1.0, 1));
        limiter.acquire("http://example.com:80").await;

        let start = Instant::now();
        let err = limiter
            .acquire_timeout("http://example.com:80", Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FetchError::RateLimitTimeout { ref target, .. } if target == "http://example.com:80"
        ));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn acquire_timeout_succeeds_when_refill_fits() {
        let limiter = RateLimiter::new(RateLimitConfig::new(20.0, 1));
        limiter.acquire("http://example.com:80").await;

        let permit = limiter
            .acquire_timeout("http://example.com:80", Duration::from_millis(500))
            .await
            .unwrap();
        assert!(permit.waited >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn cancelled_wait_does_not_consume_a_token() {
        let limiter = RateLimiter::new(RateLimitConfig::new(2.0, 1));
        limiter.acquire("http://example.com:80").await;

        // Dropped while sleeping for the refill.
        let _ = tokio::time::timeout(
            Duration::from_millis(10),
            limiter.acquire("http://example.com:80"),
        )
        .await;

        assert!(limiter.available("http://example.com:80") < 1.0);
        assert!(limiter.available("http://example.com:80") >= 0.0);
    }

    #[tokio::test]
    async fn concurrent_acquisitions_take_exactly_one_token_each() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::new(0.01, 8)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire("http://example.com:80").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(limiter.available("http://example.com:80") < 1.0);
    }

    #[test]
    fn scope_from_str() {
        assert_eq!("global".parse(), Ok(RateLimitScope::Global));
        assert_eq!("Target".parse(), Ok(RateLimitScope::PerTarget));
        assert!("host".parse::<RateLimitScope>().is_err());
    }

    #[test]
    fn default_config_is_sensible() {
        let config = RateLimitConfig::default();
        assert_eq!(config.refill_per_sec, 1.5);
        assert_eq!(config.burst, 3);
        assert_eq!(config.scope, RateLimitScope::PerTarget);
    }
}
