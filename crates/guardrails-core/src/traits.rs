use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::error::{AppError, TransportError};
use crate::models::{FetchOutcome, FetchResult, Fingerprint, RawResponse, StructuralElement};

/// Performs a single HTTP GET. Timeouts must surface as
/// [`NetworkErrorKind::Timeout`](crate::error::NetworkErrorKind::Timeout).
///
/// Non-2xx statuses are returned as `Ok` responses; classifying them is the
/// engine's job, not the transport's.
pub trait Transport: Send + Sync + Clone {
    fn send(&self, url: &str) -> impl Future<Output = Result<RawResponse, TransportError>> + Send;
}

/// Turns a response body into the ordered element list used for fingerprinting.
pub trait DocumentParser: Send + Sync + Clone {
    fn parse(&self, body: &str) -> Result<Vec<StructuralElement>, AppError>;
}

/// Keyed persistence for the latest fingerprint per key.
pub trait FingerprintStore: Send + Sync + Clone {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Fingerprint>, AppError>> + Send;

    fn put(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Receives every URL that failed permanently, exactly once.
pub trait DeadLetterSink: Send + Sync + Clone {
    fn record(
        &self,
        url: &str,
        outcome: &FetchOutcome,
        attempts: u32,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Receives every terminal result, exactly once, whatever the outcome.
pub trait ResultSink: Send + Sync + Clone {
    fn record(&self, result: &FetchResult) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A no-op sink for use when results or dead letters are not needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DeadLetterSink for NullSink {
    async fn record(
        &self,
        _url: &str,
        _outcome: &FetchOutcome,
        _attempts: u32,
    ) -> Result<(), AppError> {
        Ok(())
    }
}

impl ResultSink for NullSink {
    async fn record(&self, _result: &FetchResult) -> Result<(), AppError> {
        Ok(())
    }
}

/// Process-local fingerprint store; contents are lost on exit.
#[derive(Debug, Clone, Default)]
pub struct MemoryFingerprintStore {
    entries: Arc<Mutex<HashMap<String, Fingerprint>>>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Fingerprint>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FingerprintStore for MemoryFingerprintStore {
    async fn get(&self, key: &str) -> Result<Option<Fingerprint>, AppError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, fingerprint: &Fingerprint) -> Result<(), AppError> {
        self.lock().insert(key.to_string(), fingerprint.clone());
        Ok(())
    }
}
