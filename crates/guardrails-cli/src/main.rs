use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use guardrails_client::{
    Candidate, FileFingerprintStore, HealthReport, HtmlStructureParser, JsonlDeadLetterSink,
    JsonlResultSink, ReqwestTransport, default_title_candidates, write_health,
};
use guardrails_core::{DiffScope, DiffWatcher, EngineConfig, FetchOrchestrator};

#[derive(Parser)]
#[command(
    name = "guardrails",
    version,
    about = "Fault-tolerant fetching with retry, circuit breaking, rate limiting and drift detection"
)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every URL in a file through the guardrails
    Run {
        /// File with one URL per line
        #[arg(long)]
        urls_file: PathBuf,

        /// Successful results (JSONL)
        #[arg(long, default_value = "out/data.jsonl")]
        out: PathBuf,

        /// Permanently failed URLs (JSONL)
        #[arg(long, default_value = "out/dead_letter.jsonl")]
        dead_letter: PathBuf,

        /// Run summary (JSON)
        #[arg(long, default_value = "out/health.json")]
        health: PathBuf,

        /// Structural fingerprint store
        #[arg(long, default_value = ".cache/fingerprints.json")]
        cache: PathBuf,

        /// Pipeline name recorded in logs and the health report
        #[arg(long, default_value = "default")]
        pipeline: String,

        /// Key fingerprints by target or by full URL (overrides GUARDRAILS_DIFF_SCOPE)
        #[arg(long)]
        diff_scope: Option<DiffScope>,

        /// Title selector candidate, tried in order: `css:SELECTOR` or
        /// `attr:SELECTOR::ATTRIBUTE`. Repeatable.
        #[arg(long = "title-selector")]
        title_selectors: Vec<Candidate>,
    },

    /// Summarize dead-letter failures by error
    Triage {
        #[arg(long, default_value = "out/dead_letter.jsonl")]
        dead_letter: PathBuf,
    },

    /// List stored structural fingerprints
    Diffs {
        #[arg(long, default_value = ".cache/fingerprints.json")]
        cache: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command {
        Commands::Run {
            urls_file,
            out,
            dead_letter,
            health,
            cache,
            pipeline,
            diff_scope,
            title_selectors,
        } => {
            let paths = RunPaths {
                out,
                dead_letter,
                health,
                cache,
            };
            cmd_run(&urls_file, &paths, &pipeline, diff_scope, title_selectors).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Triage { dead_letter } => Ok(ExitCode::from(cmd_triage(&dead_letter)?)),
        Commands::Diffs { cache } => {
            cmd_diffs(&cache).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("guardrails=info".parse()?);
    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
    }
    Ok(())
}

struct RunPaths {
    out: PathBuf,
    dead_letter: PathBuf,
    health: PathBuf,
    cache: PathBuf,
}

async fn cmd_run(
    urls_file: &Path,
    paths: &RunPaths,
    pipeline: &str,
    diff_scope: Option<DiffScope>,
    title_selectors: Vec<Candidate>,
) -> Result<()> {
    let urls = read_urls(urls_file)?;

    let mut config = EngineConfig::from_env().context("Invalid GUARDRAILS_* configuration")?;
    if let Some(scope) = diff_scope {
        config.diff_scope = scope;
    }

    let run_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("run", %run_id, %pipeline);

    async {
        tracing::info!(urls = urls.len(), "Starting run");

        let transport = ReqwestTransport::new().context("Failed to create HTTP client")?;
        let store = FileFingerprintStore::open(&paths.cache)
            .await
            .with_context(|| {
                format!("Failed to open fingerprint store: {}", paths.cache.display())
            })?;
        let dead_letters = JsonlDeadLetterSink::create(&paths.dead_letter)
            .await
            .with_context(|| format!("Failed to open {}", paths.dead_letter.display()))?;
        let candidates = if title_selectors.is_empty() {
            default_title_candidates()
        } else {
            title_selectors
        };
        let results = JsonlResultSink::create(&paths.out)
            .await
            .with_context(|| format!("Failed to open {}", paths.out.display()))?
            .with_title_candidates(candidates);

        let watcher =
            DiffWatcher::new(HtmlStructureParser::new(), store).with_scope(config.diff_scope);
        let orchestrator =
            FetchOrchestrator::new(transport, &config, dead_letters, results.clone())
                .with_diff_watcher(watcher);

        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, cancelling remaining fetches");
                    cancel.cancel();
                }
            }
        });

        orchestrator.fetch_all(&urls, &cancel).await;

        let tally = results.tally();
        let report = HealthReport::new(&run_id, pipeline, tally);
        write_health(&paths.health, &report)
            .await
            .with_context(|| format!("Failed to write {}", paths.health.display()))?;

        tracing::info!(
            ok = tally.ok,
            failed = tally.failed,
            total = tally.total,
            struct_changes = tally.struct_changes,
            "Run complete"
        );
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok::<(), anyhow::Error>(())
    }
    .instrument(span)
    .await
}

/// Non-blank, trimmed lines of `path`.
fn read_urls(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("URL file not found: {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Returns the process exit status.
fn cmd_triage(path: &Path) -> Result<u8> {
    if !path.exists() {
        println!("No dead-letter file found at {}", path.display());
        return Ok(2);
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    println!("Dead-letter summary:");
    for (error, count) in summarize_dead_letters(&raw) {
        let error: String = error.chars().take(160).collect();
        println!("  - ({count}) {error}");
    }
    Ok(0)
}

/// Count dead letters per error message, most frequent first.
fn summarize_dead_letters(raw: &str) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let error = match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => value
                .get("error")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("UNKNOWN")
                .to_string(),
            Err(_) => "PARSE_ERROR".to_string(),
        };
        *counts.entry(error).or_default() += 1;
    }

    let mut summary: Vec<(String, usize)> = counts.into_iter().collect();
    summary.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    summary
}

async fn cmd_diffs(cache: &Path) -> Result<()> {
    if !cache.exists() {
        println!(
            "No fingerprint store found at {}. Run a pipeline first.",
            cache.display()
        );
        return Ok(());
    }

    let entries = FileFingerprintStore::load(cache)
        .await
        .with_context(|| format!("Failed to read {}", cache.display()))?;

    let mut entries: Vec<_> = entries.into_iter().collect();
    entries.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));

    println!("Stored fingerprints: {}", entries.len());
    for (key, stored) in entries.iter().take(25) {
        println!(
            "  - {} {} (updated {})",
            stored.fingerprint.short(),
            key,
            stored.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    Ok(())
}
