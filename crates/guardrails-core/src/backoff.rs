//! Exponential backoff with full jitter.

use std::time::Duration;

/// Computes the wait before retry attempt `n` (1-indexed).
///
/// The ceiling is `min(max_delay, base_delay * 2^(n-1))`; the actual delay is
/// sampled uniformly from `[0, ceiling]` so concurrent retries spread out.
/// A server-supplied `Retry-After` is a floor the sample never undercuts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    /// 400ms base, 8s cap.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Upper bound of the jittered delay for `attempt`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .map(|factor| self.base_delay.saturating_mul(factor))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Sample the delay before `attempt` using a fresh RNG.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let mut rng = fastrand::Rng::new();
        self.delay_with(attempt, retry_after, &mut rng)
    }

    /// Sample the delay before `attempt` from `rng`.
    pub fn delay_with(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        rng: &mut fastrand::Rng,
    ) -> Duration {
        let ceiling = u64::try_from(self.ceiling(attempt).as_nanos()).unwrap_or(u64::MAX);
        let jittered = Duration::from_nanos(rng.u64(0..=ceiling));
        match retry_after {
            Some(floor) => jittered.max(floor),
            None => jittered,
        }
    }
}
