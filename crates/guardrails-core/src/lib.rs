pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod diffwatch;
pub mod error;
mod keyed;
pub mod models;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use config::EngineConfig;
pub use diffwatch::{DiffScope, DiffWatcher, fingerprint};
pub use error::{AppError, FetchError, NetworkErrorKind, TransportError};
pub use models::{
    DiffRecord, FetchOutcome, FetchResponse, FetchResult, Fingerprint, RawResponse,
    StructuralElement, target_key,
};
pub use orchestrator::{FetchEvent, FetchOrchestrator, FetchReporter, TracingFetchReporter};
pub use rate_limiter::{RateLimitConfig, RateLimitScope, RateLimiter};
pub use retry::{Decision, RetryConfig};
pub use traits::{
    DeadLetterSink, DocumentParser, FingerprintStore, MemoryFingerprintStore, NullSink,
    ResultSink, Transport,
};
