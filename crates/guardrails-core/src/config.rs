use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::diffwatch::DiffScope;
use crate::error::AppError;
use crate::rate_limiter::{RateLimitConfig, RateLimitScope};
use crate::retry::RetryConfig;

/// Everything needed to build a [`FetchOrchestrator`](crate::orchestrator::FetchOrchestrator).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub backoff: BackoffPolicy,
    pub rate_limit: RateLimitConfig,
    pub circuit: CircuitBreakerConfig,
    pub diff_scope: DiffScope,
    /// Maximum number of URLs in flight at once in `fetch_all`.
    pub max_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            backoff: BackoffPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            circuit: CircuitBreakerConfig::default(),
            diff_scope: DiffScope::default(),
            max_concurrency: 16,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `GUARDRAILS_*` environment variables.
    ///
    /// Every variable is optional; unset ones keep their default.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `GUARDRAILS_MAX_ATTEMPTS` | attempts per URL, including the first |
    /// | `GUARDRAILS_DEADLINE_SECS` | wall-clock budget per URL |
    /// | `GUARDRAILS_BACKOFF_BASE_MS` | backoff base delay |
    /// | `GUARDRAILS_BACKOFF_MAX_MS` | backoff cap |
    /// | `GUARDRAILS_RATE_PER_SEC` | token refill rate |
    /// | `GUARDRAILS_BURST` | bucket capacity |
    /// | `GUARDRAILS_RATE_SCOPE` | `target` or `global` |
    /// | `GUARDRAILS_RATE_TIMEOUT_MS` | longest wait for a token |
    /// | `GUARDRAILS_FAILURE_THRESHOLD` | failures before the circuit opens |
    /// | `GUARDRAILS_FAILURE_WINDOW_SECS` | window the failures must fall in |
    /// | `GUARDRAILS_COOLDOWN_SECS` | open time before a probe is allowed |
    /// | `GUARDRAILS_DIFF_SCOPE` | `target` or `url` |
    /// | `GUARDRAILS_CONCURRENCY` | URLs in flight at once |
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let mut config = Self::default();

        if let Some(n) = vars.parse::<u32>("GUARDRAILS_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(secs) = vars.parse::<f64>("GUARDRAILS_DEADLINE_SECS")? {
            config.retry.deadline = vars.secs("GUARDRAILS_DEADLINE_SECS", secs)?;
        }
        if let Some(ms) = vars.parse::<u64>("GUARDRAILS_BACKOFF_BASE_MS")? {
            config.backoff.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = vars.parse::<u64>("GUARDRAILS_BACKOFF_MAX_MS")? {
            config.backoff.max_delay = Duration::from_millis(ms);
        }
        if let Some(rate) = vars.parse::<f64>("GUARDRAILS_RATE_PER_SEC")? {
            config.rate_limit.refill_per_sec = rate;
        }
        if let Some(burst) = vars.parse::<u32>("GUARDRAILS_BURST")? {
            config.rate_limit.burst = burst;
        }
        if let Some(scope) = vars.parse::<RateLimitScope>("GUARDRAILS_RATE_SCOPE")? {
            config.rate_limit.scope = scope;
        }
        if let Some(ms) = vars.parse::<u64>("GUARDRAILS_RATE_TIMEOUT_MS")? {
            config.rate_limit.acquire_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(n) = vars.parse::<u32>("GUARDRAILS_FAILURE_THRESHOLD")? {
            config.circuit.failure_threshold = n;
        }
        if let Some(secs) = vars.parse::<f64>("GUARDRAILS_FAILURE_WINDOW_SECS")? {
            config.circuit.failure_window = vars.secs("GUARDRAILS_FAILURE_WINDOW_SECS", secs)?;
        }
        if let Some(secs) = vars.parse::<f64>("GUARDRAILS_COOLDOWN_SECS")? {
            config.circuit.recovery_timeout = vars.secs("GUARDRAILS_COOLDOWN_SECS", secs)?;
        }
        if let Some(scope) = vars.parse::<DiffScope>("GUARDRAILS_DIFF_SCOPE")? {
            config.diff_scope = scope;
        }
        if let Some(n) = vars.parse::<usize>("GUARDRAILS_CONCURRENCY")? {
            config.max_concurrency = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.retry.max_attempts == 0 {
            return Err(AppError::ConfigError(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.deadline.is_zero() {
            return Err(AppError::ConfigError("deadline must be positive".into()));
        }
        if self.backoff.base_delay > self.backoff.max_delay {
            return Err(AppError::ConfigError(format!(
                "backoff base delay ({}ms) exceeds max delay ({}ms)",
                self.backoff.base_delay.as_millis(),
                self.backoff.max_delay.as_millis()
            )));
        }
        if !(self.rate_limit.refill_per_sec.is_finite() && self.rate_limit.refill_per_sec > 0.0) {
            return Err(AppError::ConfigError(
                "rate limit refill rate must be a positive number".into(),
            ));
        }
        if self.rate_limit.burst == 0 {
            return Err(AppError::ConfigError("burst must be at least 1".into()));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(AppError::ConfigError(
                "failure threshold must be at least 1".into(),
            ));
        }
        let multiplier = self.circuit.rate_limit_backoff_multiplier;
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return Err(AppError::ConfigError(format!(
                "rate limit backoff multiplier must be a finite number >= 1, got {multiplier}"
            )));
        }
        if self.circuit.max_recovery_timeout < self.circuit.recovery_timeout {
            return Err(AppError::ConfigError(
                "max recovery timeout must not be shorter than the cool-down".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(AppError::ConfigError(
                "concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, name: &str) -> Result<Option<T>, AppError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(name) {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| AppError::ConfigError(format!("{name}={raw}: {e}"))),
        }
    }

    fn secs(&self, name: &str, secs: f64) -> Result<Duration, AppError> {
        Duration::try_from_secs_f64(secs)
            .map_err(|e| AppError::ConfigError(format!("{name}={secs}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<EngineConfig, AppError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_attempts, 6);
        assert_eq!(config.retry.deadline, Duration::from_secs(60));
        assert_eq!(config.backoff.base_delay, Duration::from_millis(400));
        assert_eq!(config.backoff.max_delay, Duration::from_secs(8));
        assert_eq!(config.rate_limit.refill_per_sec, 1.5);
        assert_eq!(config.rate_limit.burst, 3);
        assert_eq!(config.circuit.failure_threshold, 8);
        assert_eq!(config.circuit.recovery_timeout, Duration::from_secs(15));
        assert_eq!(config.diff_scope, DiffScope::Target);
        assert_eq!(config.max_concurrency, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.retry.max_attempts, 6);
        assert_eq!(config.max_concurrency, 16);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("GUARDRAILS_MAX_ATTEMPTS", "3"),
            ("GUARDRAILS_DEADLINE_SECS", "2.5"),
            ("GUARDRAILS_BACKOFF_BASE_MS", "50"),
            ("GUARDRAILS_BACKOFF_MAX_MS", "1000"),
            ("GUARDRAILS_RATE_PER_SEC", "10"),
            ("GUARDRAILS_BURST", "5"),
            ("GUARDRAILS_RATE_SCOPE", "global"),
            ("GUARDRAILS_RATE_TIMEOUT_MS", "750"),
            ("GUARDRAILS_FAILURE_THRESHOLD", "4"),
            ("GUARDRAILS_FAILURE_WINDOW_SECS", "30"),
            ("GUARDRAILS_COOLDOWN_SECS", "5"),
            ("GUARDRAILS_DIFF_SCOPE", "url"),
            ("GUARDRAILS_CONCURRENCY", "4"),
        ])
        .unwrap();

        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.deadline, Duration::from_millis(2500));
        assert_eq!(config.backoff.base_delay, Duration::from_millis(50));
        assert_eq!(config.backoff.max_delay, Duration::from_secs(1));
        assert_eq!(config.rate_limit.refill_per_sec, 10.0);
        assert_eq!(config.rate_limit.burst, 5);
        assert_eq!(config.rate_limit.scope, RateLimitScope::Global);
        assert_eq!(
            config.rate_limit.acquire_timeout,
            Some(Duration::from_millis(750))
        );
        assert_eq!(config.circuit.failure_threshold, 4);
        assert_eq!(config.circuit.failure_window, Duration::from_secs(30));
        assert_eq!(config.circuit.recovery_timeout, Duration::from_secs(5));
        assert_eq!(config.diff_scope, DiffScope::Url);
        assert_eq!(config.max_concurrency, 4);
    }

    #[test]
    fn test_blank_value_is_ignored() {
        let config = load(&[("GUARDRAILS_MAX_ATTEMPTS", "  ")]).unwrap();
        assert_eq!(config.retry.max_attempts, 6);
    }

    #[test]
    fn test_unparseable_value_names_the_variable() {
        let err = load(&[("GUARDRAILS_BURST", "lots")]).unwrap_err();
        match err {
            AppError::ConfigError(msg) => assert!(msg.contains("GUARDRAILS_BURST")),
            other => panic!("Expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_scope_rejected() {
        assert!(load(&[("GUARDRAILS_DIFF_SCOPE", "page")]).is_err());
        assert!(load(&[("GUARDRAILS_RATE_SCOPE", "host")]).is_err());
    }

    #[test]
    fn test_negative_duration_rejected() {
        assert!(load(&[("GUARDRAILS_DEADLINE_SECS", "-1")]).is_err());
    }

    #[test]
    fn test_validation() {
        for pairs in [
            [("GUARDRAILS_MAX_ATTEMPTS", "0")],
            [("GUARDRAILS_DEADLINE_SECS", "0")],
            [("GUARDRAILS_RATE_PER_SEC", "0")],
            [("GUARDRAILS_RATE_PER_SEC", "NaN")],
            [("GUARDRAILS_BURST", "0")],
            [("GUARDRAILS_FAILURE_THRESHOLD", "0")],
            [("GUARDRAILS_CONCURRENCY", "0")],
            [("GUARDRAILS_BACKOFF_BASE_MS", "9000")],
            [("GUARDRAILS_COOLDOWN_SECS", "600")],
        ] {
            let result = load(&pairs);
            assert!(
                matches!(result, Err(AppError::ConfigError(_))),
                "{pairs:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_rate_limit_multiplier_validated() {
        for multiplier in [f32::NAN, f32::INFINITY, -2.0, 0.5] {
            let mut config = EngineConfig::default();
            config.circuit.rate_limit_backoff_multiplier = multiplier;
            assert!(
                matches!(config.validate(), Err(AppError::ConfigError(_))),
                "{multiplier} should be rejected"
            );
        }
    }
}
