use std::path::Path;

use chrono::Utc;
use guardrails_core::error::AppError;
use serde::{Deserialize, Serialize};

use crate::sinks::RunTally;

/// Summary of one run, written once the batch is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Unix seconds at which the report was produced.
    pub ts: i64,
    pub run_id: String,
    pub pipeline: String,
    pub ok: u64,
    pub failed: u64,
    pub total: u64,
    pub struct_changes: u64,
}

impl HealthReport {
    pub fn new(run_id: impl Into<String>, pipeline: impl Into<String>, tally: RunTally) -> Self {
        Self {
            ts: Utc::now().timestamp(),
            run_id: run_id.into(),
            pipeline: pipeline.into(),
            ok: tally.ok,
            failed: tally.failed,
            total: tally.total,
            struct_changes: tally.struct_changes,
        }
    }
}

/// Write `report` as indented JSON, creating parent directories and
/// replacing any previous report.
pub async fn write_health(path: &Path, report: &HealthReport) -> Result<(), AppError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(report)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}
