//! Loader: merges staged artifacts into the destination exactly once
//!
//! Artifacts are grouped into load batches bounded by row count, never
//! splitting an artifact. Each batch is one destination transaction; a
//! failing batch is retried whole with linear backoff and, once the attempt
//! limit is reached, aborts the merge. Only after a commit are the covered
//! fingerprints flipped to `loaded`. A crash between the two re-merges the
//! batch on the next run, which the destination's natural key absorbs.

use crate::checkpoint::{CheckpointEntry, CheckpointStore};
use crate::config::IngestConfig;
use crate::destination::{commit_with_retry, RetryPolicy, RowSink};
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::row::CandidateRow;
use crate::scheduler::run_blocking;
use crate::staging::StagingWriter;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub artifacts_loaded: u64,
    pub batches: u64,
    pub rows_inserted: u64,
    /// Rows the destination already held
    pub rows_ignored: u64,
    /// Staged entries whose artifact was missing or unreadable
    pub invalid_artifacts: u64,
    pub commit_retries: u64,
    pub artifacts_removed: u64,
}

impl LoadSummary {
    pub fn absorb(&mut self, other: &LoadSummary) {
        self.artifacts_loaded += other.artifacts_loaded;
        self.batches += other.batches;
        self.rows_inserted += other.rows_inserted;
        self.rows_ignored += other.rows_ignored;
        self.invalid_artifacts += other.invalid_artifacts;
        self.commit_retries += other.commit_retries;
        self.artifacts_removed += other.artifacts_removed;
    }
}

#[derive(Default)]
struct LoadBatch {
    rows: Vec<CandidateRow>,
    fingerprints: Vec<Fingerprint>,
    artifacts: Vec<PathBuf>,
}

impl LoadBatch {
    fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

/// Single-writer merger; clones share one merge lock
#[derive(Clone)]
pub struct Loader {
    checkpoints: CheckpointStore,
    staging: StagingWriter,
    sink: Arc<dyn RowSink>,
    batch_size: usize,
    retry: RetryPolicy,
    retain_artifacts: bool,
    lock: Arc<Mutex<()>>,
}

impl Loader {
    pub fn new(
        config: &IngestConfig,
        checkpoints: CheckpointStore,
        staging: StagingWriter,
        sink: Arc<dyn RowSink>,
    ) -> Self {
        Self {
            checkpoints,
            staging,
            sink,
            batch_size: config.batch_size.max(1),
            retry: RetryPolicy {
                max_attempts: config.max_commit_attempts,
                backoff: config.retry_backoff(),
            },
            retain_artifacts: config.retain_artifacts,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Merge every `staged` entry currently recorded
    pub async fn merge(&self) -> Result<LoadSummary> {
        let _writer = self.lock.lock().await;
        let mut summary = LoadSummary::default();

        let entries = self.checkpoints.staged_entries().await?;
        if entries.is_empty() {
            debug!("Nothing staged to merge");
            return Ok(summary);
        }
        info!(artifacts = entries.len(), batch_size = self.batch_size, "Merging staged artifacts");

        let mut batch = LoadBatch::default();
        for entry in entries {
            let Some(artifact) = entry.artifact() else {
                continue;
            };

            let staging = self.staging.clone();
            let path = artifact.path.clone();
            let read = run_blocking(move || {
                staging.read_artifact(&artifact.path, &artifact.fingerprint)
            })
            .await
            .and_then(|read| read.map_err(|e| e.to_string()));

            let rows = match read {
                Ok(rows) => rows,
                Err(reason) => {
                    self.discard(&entry, &path, &reason).await?;
                    summary.invalid_artifacts += 1;
                    continue;
                },
            };

            if !batch.is_empty() && batch.rows.len() + rows.len() > self.batch_size {
                self.flush(std::mem::take(&mut batch), &mut summary).await?;
            }

            batch.rows.extend(rows);
            batch.fingerprints.push(entry.fingerprint.clone());
            if let Some(path) = entry.artifact_path {
                batch.artifacts.push(path);
            }

            if batch.rows.len() >= self.batch_size {
                self.flush(std::mem::take(&mut batch), &mut summary).await?;
            }
        }

        if !batch.is_empty() {
            self.flush(batch, &mut summary).await?;
        }

        info!(
            artifacts_loaded = summary.artifacts_loaded,
            batches = summary.batches,
            rows_inserted = summary.rows_inserted,
            rows_ignored = summary.rows_ignored,
            invalid_artifacts = summary.invalid_artifacts,
            "Merge finished"
        );
        Ok(summary)
    }

    /// Give up on an artifact: fail the entry and delete the file so the
    /// next run parses the source instead of adopting it again
    async fn discard(&self, entry: &CheckpointEntry, artifact: &Path, reason: &str) -> Result<()> {
        warn!(
            fingerprint = %entry.fingerprint.short(),
            path = %entry.source_path.display(),
            error = %reason,
            "Staged artifact unusable, source will be reprocessed"
        );
        self.checkpoints
            .mark_failed(&entry.fingerprint, &format!("artifact unusable: {}", reason))
            .await?;
        if let Err(e) = self.staging.remove(artifact) {
            warn!(path = %artifact.display(), error = %e, "Could not remove unusable artifact");
        }
        Ok(())
    }

    async fn flush(&self, batch: LoadBatch, summary: &mut LoadSummary) -> Result<()> {
        let (commit, retries) = commit_with_retry(self.sink.as_ref(), &batch.rows, self.retry).await?;
        summary.commit_retries += u64::from(retries);
        self.checkpoints.mark_loaded_many(&batch.fingerprints).await?;

        summary.batches += 1;
        summary.artifacts_loaded += batch.fingerprints.len() as u64;
        summary.rows_inserted += commit.inserted;
        summary.rows_ignored += commit.ignored;
        debug!(
            artifacts = batch.fingerprints.len(),
            rows = batch.rows.len(),
            inserted = commit.inserted,
            "Load batch committed"
        );

        if !self.retain_artifacts {
            for path in &batch.artifacts {
                match self.staging.remove(path) {
                    Ok(()) => summary.artifacts_removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Could not remove merged artifact"),
                }
            }
        }
        Ok(())
    }
}
