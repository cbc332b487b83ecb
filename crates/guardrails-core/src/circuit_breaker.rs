//! Per-target circuit breaker.
//!
//! Stops sending requests to a target that keeps failing, then lets a
//! single probe through once the cool-down has elapsed.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures in window]--> OPEN (rejecting) --[cool-down]--> HALF_OPEN (one probe)
//!                                                                                    |
//!                                          <--[probe failure]--                      |
//!                                                                                    |
//! CLOSED <--------------------------------[probe success]----------------------------+
//! ```
//!
//! The breaker is a pure gate: it never retries or sleeps. Callers ask for a
//! [`CircuitPermit`] with [`CircuitBreaker::check`] and hand it back with the
//! outcome. A permit dropped without an outcome (cancelled attempt) changes
//! no counters; a dropped probe permit frees the half-open probe slot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::FetchError;
use crate::keyed::{KeyedState, lock};

/// Current state of one target's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - a single probe request is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window` that open the circuit.
    pub failure_threshold: u32,

    /// Rolling window for counting failures. Only failures younger than the
    /// window count toward the threshold.
    pub failure_window: Duration,

    /// Time to wait before transitioning from Open to Half-Open.
    pub recovery_timeout: Duration,

    /// When the opening failure is a 429, multiply the cool-down by this factor.
    pub rate_limit_backoff_multiplier: f32,

    /// Maximum cool-down after rate limit extensions.
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 8,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(15),
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct CircuitEntry {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_error_message: Option<String>,
    current_recovery_timeout: Duration,
}

impl CircuitEntry {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probe_in_flight: false,
            last_error_message: None,
            current_recovery_timeout: config.recovery_timeout,
        }
    }

    fn failure_count(&self) -> u32 {
        u32::try_from(self.failures.len()).unwrap_or(u32::MAX)
    }

    /// Forget failures that fell out of the window ending at `now`.
    fn prune_failures(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) <= window {
                break;
            }
            self.failures.pop_front();
        }
    }

    fn time_until_half_open(&self) -> Duration {
        self.opened_at
            .map(|t| self.current_recovery_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(self.current_recovery_timeout)
    }
}

/// Statistics about one target's circuit for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub target: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

/// Permission to make one request to a target.
///
/// Hand it back through [`CircuitBreaker::record_success`] or
/// [`CircuitBreaker::record_failure`]; dropping it records nothing.
#[derive(Debug)]
pub struct CircuitPermit {
    target: String,
    entry: Arc<Mutex<CircuitEntry>>,
    probe: bool,
    settled: bool,
}

impl CircuitPermit {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// True if this permit is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            let mut inner = lock(&self.entry);
            if inner.state == CircuitState::HalfOpen {
                inner.probe_in_flight = false;
            }
            tracing::debug!(circuit = %self.target, "Probe abandoned without outcome");
        }
    }
}

/// Thread-safe circuit breaker keyed by target.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: KeyedState<CircuitEntry>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: KeyedState::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn entry(&self, target: &str) -> Arc<Mutex<CircuitEntry>> {
        self.circuits
            .entry(target, || CircuitEntry::new(&self.config))
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self, target: &str) -> CircuitState {
        let entry = self.entry(target);
        let mut inner = lock(&entry);
        self.maybe_transition_to_half_open(target, &mut inner);
        inner.state
    }

    pub fn stats(&self, target: &str) -> CircuitBreakerStats {
        let entry = self.entry(target);
        let mut inner = lock(&entry);
        self.maybe_transition_to_half_open(target, &mut inner);

        let time_until_half_open = if inner.state == CircuitState::Open {
            Some(inner.time_until_half_open())
        } else {
            None
        };

        CircuitBreakerStats {
            target: target.to_string(),
            state: inner.state,
            failure_count: inner.failure_count(),
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
        }
    }

    /// Ask whether a request to `target` may proceed.
    ///
    /// - Closed: always granted
    /// - Open: rejected with [`FetchError::CircuitOpen`]
    /// - HalfOpen: granted to the first caller (the probe), rejected for the rest
    pub fn check(&self, target: &str) -> Result<CircuitPermit, FetchError> {
        let entry = self.entry(target);
        let probe = {
            let mut inner = lock(&entry);
            self.maybe_transition_to_half_open(target, &mut inner);

            match inner.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    return Err(FetchError::CircuitOpen {
                        target: target.to_string(),
                        retry_after: inner.time_until_half_open(),
                    });
                }
                CircuitState::HalfOpen => {
                    if inner.probe_in_flight {
                        return Err(FetchError::CircuitOpen {
                            target: target.to_string(),
                            retry_after: Duration::ZERO,
                        });
                    }
                    inner.probe_in_flight = true;
                    tracing::debug!(circuit = %target, "Admitting half-open probe");
                    true
                }
            }
        };

        Ok(CircuitPermit {
            target: target.to_string(),
            entry,
            probe,
            settled: false,
        })
    }

    pub fn record_success(&self, mut permit: CircuitPermit) {
        permit.settled = true;
        let entry = Arc::clone(&permit.entry);
        let mut inner = lock(&entry);

        match inner.state {
            CircuitState::HalfOpen if permit.probe => {
                tracing::info!(circuit = %permit.target, "Circuit breaker closing after successful probe");
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.probe_in_flight = false;
                inner.last_error_message = None;
                inner.current_recovery_timeout = self.config.recovery_timeout;
            }
            CircuitState::Closed => inner.failures.clear(),
            // Permit issued before the circuit opened; the circuit's view wins.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, mut permit: CircuitPermit, error: &FetchError) {
        permit.settled = true;
        let entry = Arc::clone(&permit.entry);
        let mut inner = lock(&entry);
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => {
                inner.prune_failures(now, self.config.failure_window);
                inner.failures.push_back(now);
                let cap = usize::try_from(self.config.failure_threshold).unwrap_or(usize::MAX);
                while inner.failures.len() > cap {
                    inner.failures.pop_front();
                }
                inner.last_error_message = Some(error.to_string());

                let failures = inner.failure_count();
                if failures >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %permit.target,
                        failures,
                        error = %error,
                        "Circuit breaker opening after {} failures",
                        failures
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    if error.is_rate_limited() {
                        self.extend_recovery(&permit.target, &mut inner);
                    }
                }
            }
            CircuitState::HalfOpen if permit.probe => {
                tracing::warn!(
                    circuit = %permit.target,
                    error = %error,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
                inner.last_error_message = Some(error.to_string());
                if error.is_rate_limited() {
                    self.extend_recovery(&permit.target, &mut inner);
                }
            }
            CircuitState::HalfOpen => {}
            CircuitState::Open => {
                inner.last_error_message = Some(error.to_string());
            }
        }
    }

    pub fn reset(&self, target: &str) {
        let entry = self.entry(target);
        let mut inner = lock(&entry);
        tracing::info!(circuit = %target, "Circuit breaker manually reset");
        *inner = CircuitEntry::new(&self.config);
    }

    fn extend_recovery(&self, target: &str, inner: &mut CircuitEntry) {
        let extended = Duration::try_from_secs_f32(
            inner.current_recovery_timeout.as_secs_f32() * self.config.rate_limit_backoff_multiplier,
        )
        .unwrap_or(self.config.max_recovery_timeout);
        inner.current_recovery_timeout = std::cmp::min(extended, self.config.max_recovery_timeout);
        tracing::info!(
            circuit = %target,
            recovery_timeout_secs = inner.current_recovery_timeout.as_secs(),
            "Extended recovery timeout due to rate limit"
        );
    }

    fn maybe_transition_to_half_open(&self, target: &str, inner: &mut CircuitEntry) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= inner.current_recovery_timeout
        {
            tracing::info!(
                circuit = %target,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "https://example.com:443";

    fn server_error() -> FetchError {
        FetchError::TransientServer {
            status: 503,
            retry_after: None,
        }
    }

    fn fail(cb: &CircuitBreaker, target: &str) {
        let permit = cb.check(target).unwrap();
        cb.record_failure(permit, &server_error());
    }

    fn succeed(cb: &CircuitBreaker, target: &str) {
        let permit = cb.check(target).unwrap();
        cb.record_success(permit);
    }

    fn quick_recovery(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(cb.state(HOST), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });

        for _ in 0..3 {
            fail(&cb, HOST);
        }

        assert_eq!(cb.state(HOST), CircuitState::Open);
        assert!(matches!(
            cb.check(HOST).unwrap_err(),
            FetchError::CircuitOpen { .. }
        ));
    }

    #[test]
    fn test_circuit_stays_closed_below_threshold() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5,
            ..Default::default()
        });

        for _ in 0..4 {
            fail(&cb, HOST);
        }

        assert_eq!(cb.state(HOST), CircuitState::Closed);
        assert_eq!(cb.stats(HOST).failure_count, 4);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5,
            ..Default::default()
        });

        for _ in 0..4 {
            fail(&cb, HOST);
        }
        succeed(&cb, HOST);
        assert_eq!(cb.stats(HOST).failure_count, 0);

        for _ in 0..4 {
            fail(&cb, HOST);
        }
        assert_eq!(cb.state(HOST), CircuitState::Closed);
    }

    #[test]
    fn test_failures_outside_window_do_not_accumulate() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            failure_window: Duration::from_millis(10),
            ..Default::default()
        });

        fail(&cb, HOST);
        std::thread::sleep(Duration::from_millis(20));
        fail(&cb, HOST);

        assert_eq!(cb.state(HOST), CircuitState::Closed);
        assert_eq!(cb.stats(HOST).failure_count, 1);
    }

    #[test]
    fn test_window_slides_with_recent_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_millis(300),
            ..Default::default()
        });

        fail(&cb, HOST);
        std::thread::sleep(Duration::from_millis(200));
        fail(&cb, HOST);
        std::thread::sleep(Duration::from_millis(120));
        // First failure is now older than the window; the last three are not.
        fail(&cb, HOST);
        assert_eq!(cb.stats(HOST).failure_count, 2);
        fail(&cb, HOST);

        assert_eq!(cb.state(HOST), CircuitState::Open);
    }

    #[test]
    fn test_invalid_rate_limit_multiplier_falls_back_to_max() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            rate_limit_backoff_multiplier: f32::NAN,
            max_recovery_timeout: Duration::from_secs(120),
            ..Default::default()
        });

        let permit = cb.check(HOST).unwrap();
        cb.record_failure(
            permit,
            &FetchError::TransientServer {
                status: 429,
                retry_after: None,
            },
        );

        let stats = cb.stats(HOST);
        assert_eq!(stats.state, CircuitState::Open);
        assert!(stats.time_until_half_open.unwrap() > Duration::from_secs(100));
    }

    #[test]
    fn test_targets_are_independent() {
        let cb = CircuitBreaker::new(quick_recovery(1));
        fail(&cb, HOST);

        assert_eq!(cb.state(HOST), CircuitState::Open);
        assert_eq!(cb.state("https://other.com:443"), CircuitState::Closed);
        assert!(cb.check("https://other.com:443").is_ok());
    }

    #[test]
    fn test_circuit_transitions_to_half_open() {
        let cb = CircuitBreaker::new(quick_recovery(1));

        fail(&cb, HOST);
        assert_eq!(cb.state(HOST), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cb.state(HOST), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_exactly_one_probe() {
        let cb = CircuitBreaker::new(quick_recovery(1));
        fail(&cb, HOST);
        std::thread::sleep(Duration::from_millis(20));

        let probe = cb.check(HOST).unwrap();
        assert!(probe.is_probe());
        assert!(matches!(
            cb.check(HOST).unwrap_err(),
            FetchError::CircuitOpen { .. }
        ));
        drop(probe);
    }

    #[test]
    fn test_half_open_closes_on_success() {
        let cb = CircuitBreaker::new(quick_recovery(1));
        fail(&cb, HOST);
        std::thread::sleep(Duration::from_millis(20));

        let probe = cb.check(HOST).unwrap();
        cb.record_success(probe);

        assert_eq!(cb.state(HOST), CircuitState::Closed);
        assert_eq!(cb.stats(HOST).failure_count, 0);
        assert!(cb.check(HOST).is_ok());
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(30),
            ..Default::default()
        });
        fail(&cb, HOST);
        std::thread::sleep(Duration::from_millis(40));

        let probe = cb.check(HOST).unwrap();
        cb.record_failure(probe, &server_error());

        // Cool-down restarted from the probe failure.
        assert_eq!(cb.state(HOST), CircuitState::Open);
        let stats = cb.stats(HOST);
        assert!(stats.time_until_half_open.unwrap() > Duration::from_millis(15));
    }

    #[test]
    fn test_abandoned_probe_frees_slot() {
        let cb = CircuitBreaker::new(quick_recovery(1));
        fail(&cb, HOST);
        std::thread::sleep(Duration::from_millis(20));

        let probe = cb.check(HOST).unwrap();
        drop(probe);

        assert_eq!(cb.state(HOST), CircuitState::HalfOpen);
        let next = cb.check(HOST).unwrap();
        assert!(next.is_probe());
    }

    #[test]
    fn test_dropped_closed_permit_records_nothing() {
        let cb = CircuitBreaker::new(quick_recovery(3));
        fail(&cb, HOST);

        let permit = cb.check(HOST).unwrap();
        drop(permit);

        assert_eq!(cb.stats(HOST).failure_count, 1);
    }

    #[test]
    fn test_rate_limit_extends_recovery_timeout() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
            ..Default::default()
        });

        let permit = cb.check(HOST).unwrap();
        cb.record_failure(
            permit,
            &FetchError::TransientServer {
                status: 429,
                retry_after: None,
            },
        );

        let stats = cb.stats(HOST);
        assert_eq!(stats.state, CircuitState::Open);
        assert!(stats.time_until_half_open.unwrap() > Duration::from_secs(55));
    }

    #[test]
    fn test_rate_limit_backoff_capped_at_max() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(200),
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
            ..Default::default()
        });

        let permit = cb.check(HOST).unwrap();
        cb.record_failure(
            permit,
            &FetchError::TransientServer {
                status: 429,
                retry_after: None,
            },
        );

        let stats = cb.stats(HOST);
        assert!(stats.time_until_half_open.unwrap() <= Duration::from_secs(300));
    }

    #[test]
    fn test_manual_reset() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(300),
            ..Default::default()
        });

        fail(&cb, HOST);
        assert_eq!(cb.state(HOST), CircuitState::Open);

        cb.reset(HOST);
        assert_eq!(cb.state(HOST), CircuitState::Closed);
        assert!(cb.stats(HOST).last_error.is_none());
    }
}
