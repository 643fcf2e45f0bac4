//! Pipeline: the single entry point the binary and tests drive
//!
//! The strategy is fixed when the pipeline is opened. The staged strategy
//! sweeps stale partials, runs the worker pool (optionally merging on an
//! interval while workers run) and finishes with a merge; the direct
//! strategy streams rows straight into the destination.

use crate::checkpoint::{CheckpointEntry, CheckpointStore, CompactSummary, StatusCounts};
use crate::config::{IngestConfig, IngestStrategy, LoadMode};
use crate::destination::{
    commit_with_retry, RetryPolicy, SqliteDestination, CATALOG_VERSION_KEY,
};
use crate::direct::{DirectEngine, DirectSummary};
use crate::error::{IngestError, Result, StagingError};
use crate::loader::{LoadSummary, Loader};
use crate::parser::{DatParser, FileParser};
use crate::scheduler::{StagingSummary, WorkerPool};
use crate::staging::artifact::{self, ArtifactWriter};
use crate::staging::StagingWriter;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct StagedRunSummary {
    pub partials_swept: u64,
    pub staging: StagingSummary,
    pub load: LoadSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RunSummary {
    Staged(StagedRunSummary),
    Direct(DirectSummary),
}

impl RunSummary {
    /// Per-file failures of this run, for the exit status
    pub fn failure_total(&self) -> u64 {
        match self {
            RunSummary::Staged(s) => s.staging.failure_total,
            RunSummary::Direct(d) => d.failure_total,
        }
    }

    pub fn cancelled(&self) -> bool {
        match self {
            RunSummary::Staged(s) => s.staging.cancelled,
            RunSummary::Direct(d) => d.cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub checkpoints: StatusCounts,
    pub permanent_failures: Vec<CheckpointEntry>,
    pub staged_bytes: u64,
    pub destination_rows: u64,
    pub catalog_version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactReport {
    pub checkpoints: CompactSummary,
    pub orphaned_artifacts_removed: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResetSummary {
    pub checkpoints_removed: u64,
    pub artifacts_removed: u64,
    pub destination_rows_removed: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ImportSummary {
    pub rows_read: u64,
    pub rows_inserted: u64,
    pub rows_ignored: u64,
}

pub struct Pipeline {
    config: IngestConfig,
    checkpoints: CheckpointStore,
    staging: StagingWriter,
    destination: Arc<SqliteDestination>,
    parser: Arc<dyn FileParser>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Validate `config` and open every store it names
    pub async fn open(config: IngestConfig) -> Result<Self> {
        config.validate()?;

        let checkpoints = CheckpointStore::open(&config.checkpoint_path).await?;
        let staging = StagingWriter::new(&config.staging_dir)?;
        let destination = Arc::new(SqliteDestination::open(&config.destination_path).await?);

        info!(
            strategy = %config.strategy,
            workers = config.workers,
            batch_size = config.batch_size,
            staging_dir = %config.staging_dir.display(),
            "Pipeline ready"
        );

        Ok(Self {
            config,
            checkpoints,
            staging,
            destination,
            parser: Arc::new(DatParser::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_parser(mut self, parser: Arc<dyn FileParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn staging(&self) -> &StagingWriter {
        &self.staging
    }

    pub fn destination(&self) -> &SqliteDestination {
        &self.destination
    }

    pub async fn close(&self) {
        self.checkpoints.close().await;
        self.destination.close().await;
    }

    fn loader(&self) -> Loader {
        Loader::new(
            &self.config,
            self.checkpoints.clone(),
            self.staging.clone(),
            self.destination.clone(),
        )
    }

    pub async fn run(&self, files: Vec<PathBuf>) -> Result<RunSummary> {
        match self.config.strategy {
            IngestStrategy::Staged => Ok(RunSummary::Staged(self.run_staged(files).await?)),
            IngestStrategy::Direct => {
                let summary = DirectEngine::new(&self.config, self.destination.clone())
                    .with_parser(Arc::clone(&self.parser))
                    .with_cancellation(self.cancel.clone())
                    .run(files)
                    .await?;
                Ok(RunSummary::Direct(summary))
            },
        }
    }

    async fn run_staged(&self, files: Vec<PathBuf>) -> Result<StagedRunSummary> {
        let partials_swept = self.staging.sweep_partials()? as u64;
        if partials_swept > 0 {
            info!(partials_swept, "Removed partial artifacts from an interrupted run");
        }

        let pool = WorkerPool::new(&self.config, self.checkpoints.clone(), self.staging.clone())
            .with_parser(Arc::clone(&self.parser))
            .with_cancellation(self.cancel.clone());
        let loader = self.loader();

        let (staging, mut load) = match self.config.load_mode {
            LoadMode::AfterStaging => (pool.run(files).await?, LoadSummary::default()),
            LoadMode::Concurrent { interval_ms } => {
                let stop = CancellationToken::new();
                let background = tokio::spawn(merge_periodically(
                    loader.clone(),
                    Duration::from_millis(interval_ms),
                    stop.clone(),
                ));

                let staged = pool.run(files).await;
                stop.cancel();
                let merged = background.await?;
                (staged?, merged?)
            },
        };

        if staging.cancelled {
            warn!("Run cancelled; staged artifacts will be merged next run");
        } else {
            load.absorb(&loader.merge().await?);
        }

        Ok(StagedRunSummary {
            partials_swept,
            staging,
            load,
        })
    }

    /// Merge whatever is staged without scanning any sources
    pub async fn merge(&self) -> Result<LoadSummary> {
        self.loader().merge().await
    }

    pub async fn status(&self) -> Result<PipelineStatus> {
        let staged_bytes = self
            .checkpoints
            .staged_entries()
            .await?
            .iter()
            .filter_map(|entry| entry.artifact_path.as_ref())
            .filter_map(|path| std::fs::metadata(path).ok())
            .map(|meta| meta.len())
            .sum();

        Ok(PipelineStatus {
            checkpoints: self.checkpoints.status_counts().await?,
            permanent_failures: self
                .checkpoints
                .permanent_failures(self.config.max_attempts)
                .await?,
            staged_bytes,
            destination_rows: self.destination.row_count().await?,
            catalog_version: self.destination.get_metadata(CATALOG_VERSION_KEY).await?,
        })
    }

    pub async fn compact(&self) -> Result<CompactReport> {
        let checkpoints = self.checkpoints.compact(self.config.retain_artifacts).await?;

        let mut removed = 0;
        for path in &checkpoints.orphaned_artifacts {
            match self.staging.remove(path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Could not remove orphaned artifact"),
            }
        }

        Ok(CompactReport {
            checkpoints,
            orphaned_artifacts_removed: removed,
        })
    }

    /// Forget all progress; destination rows stay
    pub async fn reset(&self) -> Result<ResetSummary> {
        Ok(ResetSummary {
            checkpoints_removed: self.checkpoints.reset().await?,
            artifacts_removed: self.staging.clear()? as u64,
            destination_rows_removed: 0,
        })
    }

    /// Refuse to mix catalog releases in one destination
    ///
    /// With `fresh`, checkpoints, artifacts and destination rows are wiped
    /// first and the new release is recorded.
    pub async fn ensure_catalog_version(&self, version: Option<&str>, fresh: bool) -> Result<ResetSummary> {
        let mut summary = ResetSummary::default();
        if fresh {
            summary = self.reset().await?;
            summary.destination_rows_removed = self.destination.wipe().await?;
            info!(
                checkpoints_removed = summary.checkpoints_removed,
                artifacts_removed = summary.artifacts_removed,
                destination_rows_removed = summary.destination_rows_removed,
                "Fresh start requested"
            );
        }

        let Some(incoming) = version else {
            return Ok(summary);
        };

        match self.destination.get_metadata(CATALOG_VERSION_KEY).await? {
            Some(stored) if stored != incoming => Err(IngestError::CatalogVersionMismatch {
                stored,
                incoming: incoming.to_string(),
            }),
            Some(_) => Ok(summary),
            None => {
                self.destination
                    .set_metadata(CATALOG_VERSION_KEY, incoming)
                    .await?;
                info!(version = incoming, "Catalog release recorded");
                Ok(summary)
            },
        }
    }

    /// Write the whole destination table to one Parquet file
    pub async fn export(&self, path: &Path) -> Result<u64> {
        let file = File::create(path).map_err(|e| StagingError::io(path, e))?;
        let mut writer = ArtifactWriter::new(file, None)?;

        let mut cursor = 0;
        loop {
            let (page, last_id) = self
                .destination
                .fetch_page(cursor, self.config.batch_size)
                .await?;
            let Some(last_id) = last_id else {
                break;
            };
            writer.write(&page)?;
            cursor = last_id;
        }

        let rows = writer.rows_written();
        let file = writer.finish()?;
        file.sync_all().map_err(|e| StagingError::io(path, e))?;

        info!(path = %path.display(), rows, "Destination exported");
        Ok(rows)
    }

    /// Insert-or-ignore every row of a Parquet file in the artifact schema
    pub async fn import(&self, path: &Path) -> Result<ImportSummary> {
        let source = path.to_path_buf();
        let (_, rows) = tokio::task::spawn_blocking(move || artifact::read_rows(&source)).await??;

        let policy = RetryPolicy {
            max_attempts: self.config.max_commit_attempts,
            backoff: self.config.retry_backoff(),
        };
        let mut summary = ImportSummary {
            rows_read: rows.len() as u64,
            ..Default::default()
        };
        for chunk in rows.chunks(self.config.batch_size) {
            let (commit, _) = commit_with_retry(self.destination.as_ref(), chunk, policy).await?;
            summary.rows_inserted += commit.inserted;
            summary.rows_ignored += commit.ignored;
        }

        info!(
            path = %path.display(),
            rows_read = summary.rows_read,
            rows_inserted = summary.rows_inserted,
            "Parquet file imported"
        );
        Ok(summary)
    }
}

async fn merge_periodically(
    loader: Loader,
    interval: Duration,
    stop: CancellationToken,
) -> Result<LoadSummary> {
    let mut total = LoadSummary::default();
    loop {
        tokio::select! {
            _ = stop.cancelled() => return Ok(total),
            _ = tokio::time::sleep(interval) => {
                total.absorb(&loader.merge().await?);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::fs;

    const GAME_A: &str = r#"<?xml version="1.0"?>
<datafile><game name="Game A"><rom name="game.bin" size="1" sha1="abc123"/></game></datafile>"#;

    async fn pipeline(dir: &Path, config: impl FnOnce(IngestConfig) -> IngestConfig) -> Pipeline {
        Pipeline::open(config(IngestConfig::in_dir(dir.join("state"))))
            .await
            .unwrap()
    }

    fn write_dat(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join("dats").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = IngestConfig::in_dir(dir.path()).with_workers(0);
        assert!(matches!(Pipeline::open(config).await, Err(IngestError::Config(_))));
    }

    #[tokio::test]
    async fn test_concurrent_load_mode_merges_everything() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), |c| {
            c.with_load_mode(LoadMode::Concurrent { interval_ms: 5 })
        })
        .await;
        let files: Vec<_> = (0..6)
            .map(|i| write_dat(dir.path(), &format!("{i}.dat"), GAME_A))
            .collect();

        let RunSummary::Staged(summary) = p.run(files).await.unwrap() else {
            panic!("expected staged summary");
        };
        assert_eq!(summary.staging.newly_staged, 6);
        assert_eq!(summary.load.artifacts_loaded, 6);
        assert_eq!(p.destination().row_count().await.unwrap(), 6);
        assert_eq!(p.status().await.unwrap().checkpoints.loaded, 6);
    }

    #[tokio::test]
    async fn test_catalog_version_guard() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), |c| c).await;

        p.ensure_catalog_version(Some("TOSEC-v2023-01-01"), false).await.unwrap();
        p.ensure_catalog_version(Some("TOSEC-v2023-01-01"), false).await.unwrap();
        p.ensure_catalog_version(None, false).await.unwrap();

        let err = p
            .ensure_catalog_version(Some("TOSEC-v2024-01-01"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::CatalogVersionMismatch { .. }));

        p.run(vec![write_dat(dir.path(), "a.dat", GAME_A)]).await.unwrap();
        let wiped = p
            .ensure_catalog_version(Some("TOSEC-v2024-01-01"), true)
            .await
            .unwrap();
        assert_eq!(wiped.destination_rows_removed, 1);
        assert_eq!(wiped.checkpoints_removed, 1);

        let status = p.status().await.unwrap();
        assert_eq!(status.catalog_version.as_deref(), Some("TOSEC-v2024-01-01"));
        assert_eq!(status.destination_rows, 0);
        assert_eq!(status.checkpoints.total(), 0);
    }

    #[tokio::test]
    async fn test_export_then_import_into_fresh_destination() {
        let dir = tempfile::tempdir().unwrap();
        let source = pipeline(dir.path(), |c| c).await;
        source
            .run(vec![write_dat(dir.path(), "a.dat", GAME_A)])
            .await
            .unwrap();

        let exported = dir.path().join("roms.parquet");
        assert_eq!(source.export(&exported).await.unwrap(), 1);

        let other = tempfile::tempdir().unwrap();
        let target = pipeline(other.path(), |c| c).await;
        let first = target.import(&exported).await.unwrap();
        assert_eq!(first.rows_inserted, 1);
        let second = target.import(&exported).await.unwrap();
        assert_eq!(second.rows_ignored, 1);

        assert_eq!(
            target.destination().fetch_rows().await.unwrap(),
            source.destination().fetch_rows().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_compact_after_source_changes() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), |c| c).await;
        let path = write_dat(dir.path(), "a.dat", GAME_A);
        p.run(vec![path.clone()]).await.unwrap();

        // a different size means a different fingerprint
        fs::write(&path, format!("{GAME_A}\n")).unwrap();
        p.run(vec![path]).await.unwrap();
        assert_eq!(p.status().await.unwrap().checkpoints.loaded, 2);

        let report = p.compact().await.unwrap();
        assert_eq!(report.checkpoints.superseded_removed, 1);
        assert_eq!(p.status().await.unwrap().checkpoints.loaded, 1);
        assert_eq!(p.destination().row_count().await.unwrap(), 1);
    }
}
