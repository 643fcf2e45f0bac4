//! Datforge - DAT catalog ingestion tool

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use datforge_common::logging::{init_logging, LogConfig, LogLevel};
use datforge_ingest::config::{FingerprintMode, IngestConfig, IngestStrategy, LoadMode};
use datforge_ingest::pipeline::{Pipeline, RunSummary};
use datforge_ingest::progress::format_bytes;
use datforge_ingest::source;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit status when the run finished but some source files failed
const EXIT_PARTIAL: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "datforge")]
#[command(author, version, about = "Load DAT catalogs into a deduplicated ROM database")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding checkpoint.db, catalog.db and staging/
    #[arg(long, global = true, env = "DATFORGE_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Print summaries as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a directory of DAT files and load it
    Scan(ScanArgs),

    /// Merge staged artifacts left by an earlier run
    Merge,

    /// Show checkpoint and destination state
    Status,

    /// Drop superseded checkpoint entries and orphaned artifacts
    Compact,

    /// Forget all progress; destination rows are kept
    Reset,

    /// Write the destination table to a Parquet file
    Export {
        /// Output file
        output: PathBuf,
    },

    /// Insert rows from a Parquet file in the artifact schema
    Import {
        /// Input file
        input: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Directory (or single file) of DAT catalogs
    input: PathBuf,

    /// Stage through Parquet artifacts (default)
    #[arg(long, conflicts_with = "direct")]
    staged: bool,

    /// Stream straight into the destination, no checkpoints
    #[arg(long)]
    direct: bool,

    /// Parallel workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Rows per destination transaction
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Fingerprint by content digest; catches edits that keep size and mtime
    #[arg(long)]
    content_fingerprint: bool,

    /// Merge on this interval while workers are still staging
    #[arg(long, value_name = "MS")]
    load_interval_ms: Option<u64>,

    /// Keep artifacts after they are merged
    #[arg(long)]
    retain_artifacts: bool,

    /// Catalog release of the input; detected from the path when omitted
    #[arg(long)]
    catalog_version: Option<String>,

    /// Wipe checkpoints, artifacts and destination before scanning
    #[arg(long)]
    fresh: bool,

    /// Show a progress bar
    #[arg(long)]
    progress: bool,
}

impl ScanArgs {
    fn apply(&self, mut config: IngestConfig) -> IngestConfig {
        if self.direct {
            config.strategy = IngestStrategy::Direct;
        } else if self.staged {
            config.strategy = IngestStrategy::Staged;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if self.content_fingerprint {
            config.fingerprint_mode = FingerprintMode::Content;
        }
        if let Some(interval_ms) = self.load_interval_ms {
            config.load_mode = LoadMode::Concurrent { interval_ms };
        }
        config.retain_artifacts |= self.retain_artifacts;
        config.show_progress |= self.progress;
        config
    }
}

#[tokio::main]
async fn main() {
    let cli = parse_cli(None, std::env::args_os()).unwrap_or_else(|e| e.exit());

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("datforge")
        .build();
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            1
        },
    };

    // flush file logs before exiting
    drop(guard);
    process::exit(code);
}

/// Load `.env` (or `env_file`) first so clap's `env = ...` fallbacks see it
fn parse_cli<I, T>(env_file: Option<&Path>, args: I) -> std::result::Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let _ = match env_file {
        Some(path) => dotenvy::from_path(path),
        None => dotenvy::dotenv().map(|_| ()),
    };
    Cli::try_parse_from(args)
}

fn resolve_config(cli: &Cli) -> Result<IngestConfig> {
    let mut config = IngestConfig::from_env().context("Invalid DATFORGE_* environment")?;
    if let Some(dir) = &cli.state_dir {
        let placed = IngestConfig::in_dir(dir);
        config.staging_dir = placed.staging_dir;
        config.checkpoint_path = placed.checkpoint_path;
        config.destination_path = placed.destination_path;
    }
    if let Command::Scan(args) = &cli.command {
        config = args.apply(config);
    }
    Ok(config)
}

async fn execute(cli: Cli) -> Result<i32> {
    let config = resolve_config(&cli)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight work");
            on_signal.cancel();
        }
    });

    let pipeline = Pipeline::open(config)
        .await
        .context("Failed to open pipeline state")?
        .with_cancellation(cancel);

    let code = match &cli.command {
        Command::Scan(args) => scan(&pipeline, args, cli.json).await?,
        Command::Merge => {
            let summary = pipeline.merge().await.context("Merge failed")?;
            report(&summary, cli.json, |s| {
                println!(
                    "Merged {} artifacts in {} batches: {} rows inserted, {} ignored",
                    s.artifacts_loaded, s.batches, s.rows_inserted, s.rows_ignored
                );
            })?;
            0
        },
        Command::Status => {
            let status = pipeline.status().await?;
            report(&status, cli.json, |s| {
                let c = &s.checkpoints;
                println!("Checkpoints: {} total", c.total());
                println!("  pending: {}", c.pending);
                println!("  staged:  {} ({})", c.staged, format_bytes(s.staged_bytes));
                println!("  loaded:  {}", c.loaded);
                println!("  failed:  {}", c.failed);
                println!("Destination rows: {}", s.destination_rows);
                if let Some(version) = &s.catalog_version {
                    println!("Catalog release: {}", version);
                }
                for entry in &s.permanent_failures {
                    println!(
                        "  gave up on {} after {} attempts: {}",
                        entry.source_path.display(),
                        entry.attempt_count,
                        entry.last_error.as_deref().unwrap_or("unknown error")
                    );
                }
            })?;
            0
        },
        Command::Compact => {
            let compaction = pipeline.compact().await?;
            report(&compaction, cli.json, |r| {
                println!(
                    "Removed {} superseded entries and {} orphaned artifacts",
                    r.checkpoints.superseded_removed, r.orphaned_artifacts_removed
                );
            })?;
            0
        },
        Command::Reset => {
            let summary = pipeline.reset().await?;
            report(&summary, cli.json, |s| {
                println!(
                    "Removed {} checkpoint entries and {} artifacts",
                    s.checkpoints_removed, s.artifacts_removed
                );
            })?;
            0
        },
        Command::Export { output } => {
            let rows = pipeline
                .export(output)
                .await
                .with_context(|| format!("Failed to export to {}", output.display()))?;
            println!("Exported {} rows to {}", rows, output.display());
            0
        },
        Command::Import { input } => {
            let summary = pipeline
                .import(input)
                .await
                .with_context(|| format!("Failed to import {}", input.display()))?;
            report(&summary, cli.json, |s| {
                println!(
                    "Read {} rows: {} inserted, {} ignored",
                    s.rows_read, s.rows_inserted, s.rows_ignored
                );
            })?;
            0
        },
    };

    pipeline.close().await;
    Ok(code)
}

async fn scan(pipeline: &Pipeline, args: &ScanArgs, json: bool) -> Result<i32> {
    let version = args
        .catalog_version
        .clone()
        .or_else(|| source::detect_catalog_version(&args.input));
    pipeline
        .ensure_catalog_version(version.as_deref(), args.fresh)
        .await?;

    let files = source::discover(&args.input)
        .with_context(|| format!("Failed to list {}", args.input.display()))?;
    info!(input = %args.input.display(), files = files.len(), "Discovered source files");

    let summary = pipeline
        .run(files)
        .await
        .context("Scan failed")?;

    report(&summary, json, print_run_summary)?;

    if summary.cancelled() {
        return Ok(130);
    }
    Ok(if summary.failure_total() > 0 {
        EXIT_PARTIAL
    } else {
        0
    })
}

fn print_run_summary(summary: &RunSummary) {
    match summary {
        RunSummary::Staged(s) => {
            let st = &s.staging;
            println!("Run {}", st.run_id);
            println!(
                "  files: {} seen, {} staged, {} from cache, {} adopted, {} failed",
                st.files_seen,
                st.newly_staged,
                st.loaded_from_cache + st.already_staged,
                st.adopted,
                st.failed
            );
            if st.skipped_permanent > 0 {
                println!("  skipped (gave up earlier): {}", st.skipped_permanent);
            }
            println!(
                "  merge: {} artifacts, {} rows inserted, {} ignored",
                s.load.artifacts_loaded, s.load.rows_inserted, s.load.rows_ignored
            );
            print_failures(&st.failures, st.failure_total);
        },
        RunSummary::Direct(d) => {
            println!(
                "  files: {} seen, {} parsed, {} failed",
                d.files_seen, d.files_parsed, d.files_failed
            );
            println!(
                "  rows: {} inserted, {} ignored in {} batches",
                d.rows_inserted, d.rows_ignored, d.batches
            );
            print_failures(&d.failures, d.failure_total);
        },
    }
}

fn print_failures(sample: &[datforge_ingest::scheduler::FileFailure], total: u64) {
    for failure in sample {
        println!("  ! {}: {}", failure.path.display(), failure.reason);
    }
    let hidden = total.saturating_sub(sample.len() as u64);
    if hidden > 0 {
        println!("  ... and {} more failures", hidden);
    }
}

fn report<T: Serialize>(value: &T, json: bool, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}
