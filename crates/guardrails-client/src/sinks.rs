//! JSON Lines sinks for results and dead letters.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use guardrails_core::error::AppError;
use guardrails_core::models::{FetchOutcome, FetchResult};
use guardrails_core::traits::{DeadLetterSink, ResultSink};
use scraper::Html;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::selectors::{Candidate, SelectorStrategy, try_select};

/// Append-only JSONL file shared by clones of a sink.
#[derive(Clone)]
struct JsonlWriter {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl JsonlWriter {
    async fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    async fn append<T: Serialize>(&self, record: &T) -> Result<(), AppError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

/// One line of the dead-letter file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub url: String,
    pub error: String,
    pub error_code: String,
    pub attempts: u32,
    /// Unix seconds.
    pub ts: i64,
}

/// Appends permanently failed URLs to a JSONL file.
#[derive(Clone)]
pub struct JsonlDeadLetterSink {
    writer: JsonlWriter,
}

impl JsonlDeadLetterSink {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, AppError> {
        Ok(Self {
            writer: JsonlWriter::open(path.as_ref()).await?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.writer.path
    }
}

impl DeadLetterSink for JsonlDeadLetterSink {
    async fn record(
        &self,
        url: &str,
        outcome: &FetchOutcome,
        attempts: u32,
    ) -> Result<(), AppError> {
        let (error, error_code) = match outcome.error() {
            Some(e) => (e.to_string(), e.code().to_string()),
            None => ("unknown".to_string(), "UNKNOWN".to_string()),
        };
        let record = DeadLetterRecord {
            url: url.to_string(),
            error,
            error_code,
            attempts,
            ts: Utc::now().timestamp(),
        };
        self.writer.append(&record).await
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One line of the data file, written for each successful fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRecord {
    pub url: String,
    pub target_key: String,
    pub status: u16,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub fingerprint: Option<String>,
    pub struct_changed: bool,
    pub title: Option<String>,
    pub selector_strategy: String,
    pub selector_idx: Option<usize>,
}

/// Counts for the health report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTally {
    pub ok: u64,
    pub failed: u64,
    pub total: u64,
    pub struct_changes: u64,
}

#[derive(Default)]
struct Counters {
    ok: AtomicU64,
    failed: AtomicU64,
    struct_changes: AtomicU64,
}

/// Writes successful results to a JSONL file and tallies every result.
///
/// Failed results are counted but not written; they are the dead-letter
/// sink's business.
#[derive(Clone)]
pub struct JsonlResultSink {
    writer: JsonlWriter,
    title_candidates: Arc<Vec<Candidate>>,
    counters: Arc<Counters>,
}

impl JsonlResultSink {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, AppError> {
        Ok(Self {
            writer: JsonlWriter::open(path.as_ref()).await?,
            title_candidates: Arc::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Extract a title from each successful body with these candidates.
    pub fn with_title_candidates(mut self, candidates: Vec<Candidate>) -> Self {
        self.title_candidates = Arc::new(candidates);
        self
    }

    pub fn path(&self) -> &Path {
        &self.writer.path
    }

    pub fn tally(&self) -> RunTally {
        let ok = self.counters.ok.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        RunTally {
            ok,
            failed,
            total: ok + failed,
            struct_changes: self.counters.struct_changes.load(Ordering::Relaxed),
        }
    }

    fn data_record(&self, result: &FetchResult) -> Option<DataRecord> {
        let response = result.outcome.response()?;

        let (title, strategy, idx) = if self.title_candidates.is_empty() {
            (None, SelectorStrategy::None, None)
        } else {
            let document = Html::parse_document(&response.body);
            let found = try_select(&document, &self.title_candidates);
            (found.value, found.strategy, found.idx)
        };

        Some(DataRecord {
            url: result.url.clone(),
            target_key: result.target_key.clone(),
            status: response.status,
            attempts: result.attempts,
            elapsed_ms: u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX),
            fingerprint: result.fingerprint.as_ref().map(|f| f.as_str().to_string()),
            struct_changed: result.struct_changed(),
            title,
            selector_strategy: strategy.to_string(),
            selector_idx: idx,
        })
    }
}

impl ResultSink for JsonlResultSink {
    async fn record(&self, result: &FetchResult) -> Result<(), AppError> {
        if result.struct_changed() {
            self.counters.struct_changes.fetch_add(1, Ordering::Relaxed);
        }

        match self.data_record(result) {
            Some(record) => {
                self.counters.ok.fetch_add(1, Ordering::Relaxed);
                self.writer.append(&record).await
            }
            None => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }
}
