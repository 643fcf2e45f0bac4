//! Direct streaming engine: parse straight into destination batches
//!
//! No staging and no checkpoints, so nothing here survives a crash; an
//! interrupted run starts over. Files are parsed with bounded concurrency
//! while a single consumer owns the pending batch and commits it, keeping
//! the destination single-writer.

use crate::config::IngestConfig;
use crate::destination::{commit_with_retry, RetryPolicy, RowSink};
use crate::error::Result;
use crate::fingerprint::Fingerprinter;
use crate::parser::{DatParser, FileParser, ParseOutcome};
use crate::progress::create_progress_bar;
use crate::row::CandidateRow;
use crate::scheduler::FileFailure;
use crate::source::SourceFile;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectSummary {
    pub files_seen: u64,
    pub duplicates_collapsed: u64,
    pub files_parsed: u64,
    pub files_failed: u64,
    pub rejected_entries: u64,
    pub batches: u64,
    pub rows_inserted: u64,
    pub rows_ignored: u64,
    pub commit_retries: u64,
    pub failures: Vec<FileFailure>,
    pub failure_total: u64,
    pub cancelled: bool,
}

impl DirectSummary {
    fn record_failure(&mut self, path: PathBuf, reason: String, limit: usize) {
        self.files_failed += 1;
        self.failure_total += 1;
        if self.failures.len() < limit {
            self.failures.push(FileFailure { path, reason });
        }
    }
}

pub struct DirectEngine {
    fingerprinter: Fingerprinter,
    parser: Arc<dyn FileParser>,
    sink: Arc<dyn RowSink>,
    workers: usize,
    batch_size: usize,
    retry: RetryPolicy,
    failure_sample_limit: usize,
    show_progress: bool,
    cancel: CancellationToken,
}

impl DirectEngine {
    pub fn new(config: &IngestConfig, sink: Arc<dyn RowSink>) -> Self {
        Self {
            fingerprinter: Fingerprinter::new(config.fingerprint_mode),
            parser: Arc::new(DatParser::new()),
            sink,
            workers: config.workers.max(1),
            batch_size: config.batch_size.max(1),
            retry: RetryPolicy {
                max_attempts: config.max_commit_attempts,
                backoff: config.retry_backoff(),
            },
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

    pub async fn run(&self, files: Vec<PathBuf>) -> Result<DirectSummary> {
        let limit = self.failure_sample_limit;
        let mut summary = DirectSummary::default();

        let mut seen = HashSet::new();
        let mut sources = Vec::new();
        for path in files {
            match SourceFile::observe(&path) {
                Ok(source) if seen.insert(source.path.clone()) => sources.push(source),
                Ok(_) => summary.duplicates_collapsed += 1,
                Err(e) => summary.record_failure(path, e.to_string(), limit),
            }
        }
        summary.files_seen = sources.len() as u64;
        info!(files = sources.len(), workers = self.workers, "Starting direct run");

        let progress = create_progress_bar(sources.len() as u64, "Loading catalogs", self.show_progress);

        let mut parsed = stream::iter(sources)
            .map(|source| {
                let parser = Arc::clone(&self.parser);
                let fingerprinter = self.fingerprinter;
                async move {
                    let path = source.path.clone();
                    let outcome = tokio::task::spawn_blocking(move || {
                        match fingerprinter.fingerprint(&source) {
                            Ok(fp) => debug!(fingerprint = %fp.short(), path = %source.path.display(), "Parsing"),
                            Err(e) => debug!(error = %e, "Fingerprint unavailable"),
                        }
                        parser.parse(&source.path)
                    })
                    .await;
                    (path, outcome)
                }
            })
            .buffer_unordered(self.workers);

        let mut batch: Vec<CandidateRow> = Vec::with_capacity(self.batch_size);
        while let Some((path, outcome)) = parsed.next().await {
            progress.inc(1);
            match outcome {
                Ok(ParseOutcome::Parsed(file)) => {
                    summary.files_parsed += 1;
                    summary.rejected_entries += file.rejected_entries as u64;
                    batch.extend(file.rows);
                },
                Ok(ParseOutcome::Failed(failure)) => {
                    summary.files_parsed += 1;
                    warn!(path = %path.display(), error = %failure.error, "Source file failed");
                    summary.record_failure(path, failure.to_string(), limit);
                },
                Err(join_error) => {
                    warn!(path = %path.display(), error = %join_error, "Parser task failed");
                    summary.record_failure(path, format!("worker panicked: {}", join_error), limit);
                },
            }

            while batch.len() >= self.batch_size {
                let rest = batch.split_off(self.batch_size);
                let full = std::mem::replace(&mut batch, rest);
                self.commit(&full, &mut summary).await?;
            }

            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
        }

        if !batch.is_empty() && !summary.cancelled {
            self.commit(&batch, &mut summary).await?;
        }
        progress.finish_and_clear();

        info!(
            files_parsed = summary.files_parsed,
            files_failed = summary.files_failed,
            rows_inserted = summary.rows_inserted,
            rows_ignored = summary.rows_ignored,
            batches = summary.batches,
            cancelled = summary.cancelled,
            "Direct run finished"
        );
        Ok(summary)
    }

    async fn commit(&self, rows: &[CandidateRow], summary: &mut DirectSummary) -> Result<()> {
        let (commit, retries) = commit_with_retry(self.sink.as_ref(), rows, self.retry).await?;
        summary.batches += 1;
        summary.rows_inserted += commit.inserted;
        summary.rows_ignored += commit.ignored;
        summary.commit_retries += u64::from(retries);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::destination::SqliteDestination;
    use std::fs;

    fn catalog(roms: usize) -> String {
        let mut doc = String::from("<datafile><game name=\"Game A (1990)\">");
        for i in 0..roms {
            doc.push_str(&format!("<rom name=\"{i}.bin\" size=\"1\" sha1=\"{i:040x}\"/>"));
        }
        doc.push_str("</game></datafile>");
        doc
    }

    #[tokio::test]
    async fn test_streams_rows_into_bounded_batches() {
        let dir = tempfile::tempdir().unwrap();
        let config = IngestConfig::in_dir(dir.path()).with_batch_size(4).with_workers(2);
        let dest = Arc::new(SqliteDestination::open(&config.destination_path).await.unwrap());

        let mut files = Vec::new();
        for i in 0..3 {
            let path = dir.path().join(format!("dats/f{i}.dat"));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, catalog(3)).unwrap();
            files.push(path);
        }
        let broken = dir.path().join("dats/broken.dat");
        fs::write(&broken, "<datafile><game name=\"x\"><rom name=\"a\" size=\"1\"/>").unwrap();
        files.push(broken);

        let summary = DirectEngine::new(&config, dest.clone()).run(files).await.unwrap();
        assert_eq!(summary.files_parsed, 4);
        assert_eq!(summary.files_failed, 1);
        assert_eq!(summary.rows_inserted, 9);
        assert_eq!(summary.batches, 3);
        assert_eq!(dest.row_count().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_rerun_inserts_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let config = IngestConfig::in_dir(dir.path());
        let dest = Arc::new(SqliteDestination::open(&config.destination_path).await.unwrap());
        let path = dir.path().join("a.dat");
        fs::write(&path, catalog(2)).unwrap();

        let engine = DirectEngine::new(&config, dest.clone());
        engine.run(vec![path.clone()]).await.unwrap();
        let second = engine.run(vec![path]).await.unwrap();
        assert_eq!(second.rows_inserted, 0);
        assert_eq!(second.rows_ignored, 2);
        assert_eq!(dest.row_count().await.unwrap(), 2);
    }
}
