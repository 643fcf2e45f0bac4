//! Worker pool: fingerprint, claim, parse, stage, checkpoint
//!
//! A fixed number of async workers pull source files from one shared queue.
//! Ownership of a fingerprint is decided by [`CheckpointStore::claim`], so
//! two workers never process the same file in a run. Parsing and Parquet
//! writing run on the blocking pool; a panic there fails only the file in
//! flight. A checkpoint error is fatal: it cancels the remaining workers and
//! aborts the run.

use crate::checkpoint::{CheckpointEntry, CheckpointStatus, CheckpointStore, ClaimOutcome};
use crate::config::{FingerprintMode, IngestConfig};
use crate::error::{IngestError, Result, StagingError};
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::parser::{DatParser, FileParser, ParseOutcome};
use crate::progress::create_progress_bar;
use crate::source::SourceFile;
use crate::staging::{ArtifactRef, StagingWriter};
use indicatif::ProgressBar;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A per-file failure kept for the end-of-run report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StagingSummary {
    pub run_id: String,
    /// Distinct source files after duplicate paths were collapsed
    pub files_seen: u64,
    pub duplicates_collapsed: u64,
    /// Already merged by an earlier run
    pub loaded_from_cache: u64,
    /// Staged earlier and still waiting for the loader
    pub already_staged: u64,
    pub newly_staged: u64,
    /// Committed artifacts found on disk and recorded without re-parsing
    pub adopted: u64,
    /// Files that failed this run and will be retried next run
    pub failed: u64,
    /// Files that failed this run and reached the attempt bound
    pub permanently_failed: u64,
    /// Files skipped because an earlier run exhausted their attempts
    pub skipped_permanent: u64,
    /// Staging I/O failures; released back to pending
    pub stage_errors: u64,
    pub claim_conflicts: u64,
    pub files_parsed: u64,
    pub rows_staged: u64,
    pub rejected_entries: u64,
    pub failures: Vec<FileFailure>,
    pub failure_total: u64,
    pub cancelled: bool,
}

impl StagingSummary {
    fn record_failure(&mut self, path: PathBuf, reason: String, limit: usize) {
        self.failure_total += 1;
        if self.failures.len() < limit {
            self.failures.push(FileFailure { path, reason });
        }
    }

    fn absorb(&mut self, other: StagingSummary, limit: usize) {
        self.loaded_from_cache += other.loaded_from_cache;
        self.already_staged += other.already_staged;
        self.newly_staged += other.newly_staged;
        self.adopted += other.adopted;
        self.failed += other.failed;
        self.permanently_failed += other.permanently_failed;
        self.skipped_permanent += other.skipped_permanent;
        self.stage_errors += other.stage_errors;
        self.claim_conflicts += other.claim_conflicts;
        self.files_parsed += other.files_parsed;
        self.rows_staged += other.rows_staged;
        self.rejected_entries += other.rejected_entries;
        self.failure_total += other.failure_total;
        for failure in other.failures {
            if self.failures.len() >= limit {
                break;
            }
            self.failures.push(failure);
        }
    }

    /// Files that now have rows ready for or already in the destination
    pub fn succeeded(&self) -> u64 {
        self.loaded_from_cache + self.already_staged + self.newly_staged + self.adopted
    }
}

/// What happened to one file inside a worker
enum FileResult {
    LoadedFromCache,
    AlreadyStaged,
    SkippedPermanent,
    ClaimConflict,
    Adopted,
    Staged { rows: u64, rejected: u64 },
    Failed { reason: String, permanent: bool, parsed: bool },
    StageError { reason: String, parsed: bool },
    Unreadable { reason: String },
}

/// Result of the blocking parse-and-stage step
enum Work {
    Staged { artifact: ArtifactRef, rejected: u64 },
    ParseFailed(String),
    StageFailed(StagingError),
}

struct Shared {
    fingerprinter: Fingerprinter,
    parser: Arc<dyn FileParser>,
    checkpoints: CheckpointStore,
    staging: StagingWriter,
    run_id: String,
    max_attempts: u32,
    failure_sample_limit: usize,
    queue: Mutex<VecDeque<SourceFile>>,
    cancel: CancellationToken,
    progress: ProgressBar,
}

pub struct WorkerPool {
    workers: usize,
    fingerprinter: Fingerprinter,
    parser: Arc<dyn FileParser>,
    checkpoints: CheckpointStore,
    staging: StagingWriter,
    run_id: String,
    max_attempts: u32,
    failure_sample_limit: usize,
    show_progress: bool,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(config: &IngestConfig, checkpoints: CheckpointStore, staging: StagingWriter) -> Self {
        Self {
            workers: config.workers.max(1),
            fingerprinter: Fingerprinter::new(config.fingerprint_mode),
            parser: Arc::new(DatParser::new()),
            checkpoints,
            staging,
            run_id: Uuid::new_v4().to_string(),
            max_attempts: config.max_attempts,
            failure_sample_limit: config.failure_sample_limit,
            show_progress: config.show_progress,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn FileParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Stage every workable file in `files`; returns once all workers stop
    pub async fn run(&self, files: Vec<PathBuf>) -> Result<StagingSummary> {
        let limit = self.failure_sample_limit;
        let mut summary = StagingSummary {
            run_id: self.run_id.clone(),
            ..Default::default()
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        for path in files {
            match SourceFile::observe(&path) {
                Ok(source) => {
                    if seen.insert(source.path.clone()) {
                        queue.push_back(source);
                    } else {
                        summary.duplicates_collapsed += 1;
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot observe source file");
                    summary.failed += 1;
                    summary.record_failure(path, e.to_string(), limit);
                },
            }
        }
        summary.files_seen = queue.len() as u64;

        info!(
            run_id = %self.run_id,
            files = queue.len(),
            duplicates = summary.duplicates_collapsed,
            workers = self.workers,
            "Starting staging run"
        );

        let shared = Arc::new(Shared {
            fingerprinter: self.fingerprinter,
            parser: Arc::clone(&self.parser),
            checkpoints: self.checkpoints.clone(),
            staging: self.staging.clone(),
            run_id: self.run_id.clone(),
            max_attempts: self.max_attempts,
            failure_sample_limit: limit,
            progress: create_progress_bar(queue.len() as u64, "Staging catalogs", self.show_progress),
            queue: Mutex::new(queue),
            cancel: self.cancel.clone(),
        });

        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers {
            let shared = Arc::clone(&shared);
            workers.spawn(async move { worker_loop(worker_id, shared).await });
        }

        let mut fatal: Option<IngestError> = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined.map_err(IngestError::from).and_then(|r| r);
            match outcome {
                Ok(partial) => summary.absorb(partial, limit),
                Err(e) => {
                    error!(run_id = %self.run_id, error = %e, "Worker aborted the run");
                    shared.cancel.cancel();
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                },
            }
        }

        shared.progress.finish_and_clear();
        if let Some(e) = fatal {
            return Err(e);
        }

        summary.cancelled = self.cancel.is_cancelled();
        info!(
            run_id = %self.run_id,
            newly_staged = summary.newly_staged,
            adopted = summary.adopted,
            already_staged = summary.already_staged,
            loaded_from_cache = summary.loaded_from_cache,
            failed = summary.failed,
            permanently_failed = summary.permanently_failed,
            stage_errors = summary.stage_errors,
            rows_staged = summary.rows_staged,
            cancelled = summary.cancelled,
            "Staging run finished"
        );
        Ok(summary)
    }
}

async fn worker_loop(worker_id: usize, shared: Arc<Shared>) -> Result<StagingSummary> {
    let mut local = StagingSummary::default();
    let limit = shared.failure_sample_limit;

    loop {
        if shared.cancel.is_cancelled() {
            debug!(worker_id, "Worker stopping on cancellation");
            break;
        }
        let Some(source) = shared.queue.lock().await.pop_front() else {
            break;
        };

        let path = source.path.clone();
        let result = process_file(&shared, source).await?;
        shared.progress.inc(1);

        match result {
            FileResult::LoadedFromCache => local.loaded_from_cache += 1,
            FileResult::AlreadyStaged => local.already_staged += 1,
            FileResult::SkippedPermanent => local.skipped_permanent += 1,
            FileResult::ClaimConflict => local.claim_conflicts += 1,
            FileResult::Adopted => local.adopted += 1,
            FileResult::Staged { rows, rejected } => {
                local.newly_staged += 1;
                local.files_parsed += 1;
                local.rows_staged += rows;
                local.rejected_entries += rejected;
            },
            FileResult::Failed {
                reason,
                permanent,
                parsed,
            } => {
                if permanent {
                    local.permanently_failed += 1;
                } else {
                    local.failed += 1;
                }
                if parsed {
                    local.files_parsed += 1;
                }
                local.record_failure(path, reason, limit);
            },
            FileResult::StageError { reason, parsed } => {
                local.stage_errors += 1;
                if parsed {
                    local.files_parsed += 1;
                }
                local.record_failure(path, reason, limit);
            },
            FileResult::Unreadable { reason } => {
                local.failed += 1;
                local.record_failure(path, reason, limit);
            },
        }
    }

    Ok(local)
}

async fn fingerprint_of(shared: &Shared, source: &SourceFile) -> std::result::Result<Fingerprint, String> {
    let fingerprinter = shared.fingerprinter;
    match fingerprinter.mode() {
        FingerprintMode::Metadata => fingerprinter.fingerprint(source).map_err(|e| e.to_string()),
        FingerprintMode::Content => {
            let source = source.clone();
            run_blocking(move || fingerprinter.fingerprint(&source))
                .await?
                .map_err(|e| e.to_string())
        },
    }
}

/// Run `f` on the blocking pool. A panic or abort comes back as the failure
/// reason of the file in flight instead of tearing down the worker.
pub(crate) async fn run_blocking<T, F>(f: F) -> std::result::Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|join_error| {
        if join_error.is_panic() {
            format!("worker panicked: {}", panic_message(join_error.into_panic()))
        } else {
            format!("worker aborted: {}", join_error)
        }
    })
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|msg| msg.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}

fn classify_lost(entry: Option<CheckpointEntry>, max_attempts: u32) -> FileResult {
    match entry {
        Some(entry) if entry.status == CheckpointStatus::Loaded => FileResult::LoadedFromCache,
        Some(entry) if entry.status == CheckpointStatus::Staged => FileResult::AlreadyStaged,
        Some(entry) if entry.is_permanent_failure(max_attempts) => FileResult::SkippedPermanent,
        _ => FileResult::ClaimConflict,
    }
}

/// Runs one file through the pipeline. `Err` only for fatal errors.
async fn process_file(shared: &Shared, source: SourceFile) -> Result<FileResult> {
    let fingerprint = match fingerprint_of(shared, &source).await {
        Ok(fp) => fp,
        Err(reason) => {
            warn!(path = %source.path.display(), error = %reason, "Fingerprinting failed");
            return Ok(FileResult::Unreadable { reason });
        },
    };
    let checkpoints = &shared.checkpoints;

    checkpoints.register(&fingerprint, &source.path).await?;
    match checkpoints
        .claim(&fingerprint, &shared.run_id, shared.max_attempts)
        .await?
    {
        ClaimOutcome::Claimed { attempt_count } => {
            debug!(
                fingerprint = %fingerprint.short(),
                path = %source.path.display(),
                attempt_count,
                "Claimed source file"
            );
        },
        ClaimOutcome::Lost(entry) => return Ok(classify_lost(entry, shared.max_attempts)),
    }

    // an artifact renamed into place by a run that died before recording it
    let staging = shared.staging.clone();
    let wanted = fingerprint.clone();
    let found = match run_blocking(move || staging.find_committed(&wanted)).await {
        Ok(found) => found,
        Err(reason) => return fail(shared, &fingerprint, &source, reason, false).await,
    };
    match found {
        Ok(Some(artifact)) => {
            checkpoints
                .mark_staged(&fingerprint, &source.path, &artifact)
                .await?;
            info!(
                fingerprint = %fingerprint.short(),
                path = %source.path.display(),
                rows = artifact.rows,
                "Adopted committed artifact"
            );
            return Ok(FileResult::Adopted);
        },
        Ok(None) => {},
        Err(e) => {
            let reason = e.to_string();
            warn!(fingerprint = %fingerprint.short(), error = %reason, "Staging directory unreadable");
            checkpoints.release(&fingerprint, &reason).await?;
            return Ok(FileResult::StageError { reason, parsed: false });
        },
    }

    let parser = Arc::clone(&shared.parser);
    let staging = shared.staging.clone();
    let path = source.path.clone();
    let fp = fingerprint.clone();
    let work = tokio::task::spawn_blocking(move || match parser.parse(&path) {
        ParseOutcome::Failed(failure) => Work::ParseFailed(failure.to_string()),
        ParseOutcome::Parsed(parsed) => match staging.stage(&fp, &parsed.rows) {
            Ok(artifact) => Work::Staged {
                artifact,
                rejected: parsed.rejected_entries as u64,
            },
            Err(e) => Work::StageFailed(e),
        },
    })
    .await;

    let work = match work {
        Ok(work) => work,
        Err(join_error) if join_error.is_panic() => {
            let reason = format!("worker panicked while processing {}", source.path.display());
            return fail(shared, &fingerprint, &source, reason, false).await;
        },
        Err(join_error) => {
            checkpoints
                .release(&fingerprint, "cancelled before completion")
                .await?;
            return Ok(FileResult::StageError {
                reason: join_error.to_string(),
                parsed: false,
            });
        },
    };

    match work {
        Work::Staged { artifact, rejected } => {
            checkpoints
                .mark_staged(&fingerprint, &source.path, &artifact)
                .await?;
            debug!(
                fingerprint = %fingerprint.short(),
                path = %source.path.display(),
                rows = artifact.rows,
                rejected,
                "Source staged"
            );
            Ok(FileResult::Staged {
                rows: artifact.rows,
                rejected,
            })
        },
        Work::ParseFailed(reason) => fail(shared, &fingerprint, &source, reason, true).await,
        Work::StageFailed(e) => {
            let reason = e.to_string();
            warn!(
                fingerprint = %fingerprint.short(),
                path = %source.path.display(),
                error = %reason,
                "Staging failed, releasing to pending"
            );
            checkpoints.release(&fingerprint, &reason).await?;
            Ok(FileResult::StageError { reason, parsed: true })
        },
    }
}

async fn fail(
    shared: &Shared,
    fingerprint: &Fingerprint,
    source: &SourceFile,
    reason: String,
    parsed: bool,
) -> Result<FileResult> {
    let attempts = shared.checkpoints.mark_failed(fingerprint, &reason).await?;
    let permanent = attempts >= shared.max_attempts;
    warn!(
        fingerprint = %fingerprint.short(),
        path = %source.path.display(),
        attempts,
        permanent,
        error = %reason,
        "Source file failed"
    );
    Ok(FileResult::Failed {
        reason,
        permanent,
        parsed,
    })
}
