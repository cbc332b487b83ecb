//! Test utilities: mock implementations of the collaborator traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{AppError, TransportError};
use crate::models::{FetchOutcome, FetchResult, RawResponse, StructuralElement};
use crate::traits::{DeadLetterSink, DocumentParser, ResultSink, Transport};

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// Mock transport that replays a scripted sequence of responses.
#[derive(Clone)]
pub struct MockTransport {
    /// Queue of responses. Each call pops the first element.
    /// If empty, returns a default 200 page.
    responses: Arc<Mutex<Vec<Result<RawResponse, TransportError>>>>,
    delay: Duration,
    /// URLs passed to `send`, in call order.
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockTransport {
    pub fn new(status: u16, body: &str) -> Self {
        Self::with_responses(vec![Ok(RawResponse::new(status, body))])
    }

    pub fn with_error(error: TransportError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_statuses(statuses: &[u16]) -> Self {
        Self::with_responses(
            statuses
                .iter()
                .map(|&status| Ok(RawResponse::new(status, "html\n  body\n")))
                .collect(),
        )
    }

    pub fn with_responses(responses: Vec<Result<RawResponse, TransportError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Transport for MockTransport {
    async fn send(&self, url: &str) -> Result<RawResponse, TransportError> {
        self.calls.lock().unwrap().push(url.to_string());
        let next = {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(RawResponse::new(200, "html\n  body\n"))
            } else {
                responses.remove(0)
            }
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        next
    }
}

// ---------------------------------------------------------------------------
// MockParser
// ---------------------------------------------------------------------------

/// Parser for an indentation outline instead of HTML.
///
/// Each non-blank line is one element: two spaces of indent per depth level,
/// the tag, then `name=value` attributes. Anything after `|` is text.
///
/// ```text
/// html
///   body
///     div class=score | Lakers 102
/// ```
#[derive(Clone, Default)]
pub struct MockParser {
    error: Arc<Mutex<Option<AppError>>>,
}

impl MockParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a parser that fails on its first call.
    pub fn with_error(error: AppError) -> Self {
        Self {
            error: Arc::new(Mutex::new(Some(error))),
        }
    }
}

impl DocumentParser for MockParser {
    fn parse(&self, body: &str) -> Result<Vec<StructuralElement>, AppError> {
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }

        let elements = body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let indent = line.len() - line.trim_start().len();
                let markup = line.split('|').next().unwrap_or_default();
                let mut tokens = markup.split_whitespace();
                let tag = tokens.next()?;
                let attributes = tokens.map(|t| t.split('=').next().unwrap_or(t));
                Some(StructuralElement::new(tag, indent / 2, attributes))
            })
            .collect();
        Ok(elements)
    }
}

// ---------------------------------------------------------------------------
// Recording sinks
// ---------------------------------------------------------------------------

/// Recorded dead letter: (url, outcome, attempts).
pub type DeadLetterRecord = (String, FetchOutcome, u32);

/// Dead-letter sink that keeps every record in memory.
#[derive(Clone, Default)]
pub struct RecordingDeadLetterSink {
    pub records: Arc<Mutex<Vec<DeadLetterRecord>>>,
}

impl RecordingDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for RecordingDeadLetterSink {
    async fn record(
        &self,
        url: &str,
        outcome: &FetchOutcome,
        attempts: u32,
    ) -> Result<(), AppError> {
        self.records
            .lock()
            .unwrap()
            .push((url.to_string(), outcome.clone(), attempts));
        Ok(())
    }
}

/// Result sink that keeps every result in memory, optionally failing each write.
#[derive(Clone, Default)]
pub struct RecordingResultSink {
    pub results: Arc<Mutex<Vec<FetchResult>>>,
    fail_writes: bool,
}

impl RecordingResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records results but reports an error for each one.
    pub fn failing() -> Self {
        Self {
            results: Arc::new(Mutex::new(Vec::new())),
            fail_writes: true,
        }
    }

    pub fn len(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultSink for RecordingResultSink {
    async fn record(&self, result: &FetchResult) -> Result<(), AppError> {
        self.results.lock().unwrap().push(result.clone());
        if self.fail_writes {
            return Err(AppError::IoError(std::io::Error::other("disk full")));
        }
        Ok(())
    }
}
