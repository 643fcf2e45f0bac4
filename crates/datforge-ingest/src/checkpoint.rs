//! Checkpoint store: durable per-fingerprint processing state
//!
//! Backed by its own SQLite database in WAL mode with `synchronous=FULL`, so
//! an acknowledged transition survives a crash. Every transition is a single
//! guarded statement; a guard that does not match is reported as
//! [`CheckpointError::InvalidTransition`] rather than silently ignored.
//!
//! ```text
//! pending --claim--> (claimed) --stage--> staged --merge--> loaded
//!    ^                   |
//!    +----- failed <-----+   (retried next run while attempts < max)
//! ```

use crate::error::CheckpointError;
use crate::fingerprint::Fingerprint;
use crate::staging::ArtifactRef;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

type Result<T> = std::result::Result<T, CheckpointError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Staged,
    Loaded,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Staged => "staged",
            CheckpointStatus::Loaded => "loaded",
            CheckpointStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(CheckpointStatus::Pending),
            "staged" => Some(CheckpointStatus::Staged),
            "loaded" => Some(CheckpointStatus::Loaded),
            "failed" => Some(CheckpointStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointEntry {
    pub fingerprint: Fingerprint,
    pub source_path: PathBuf,
    pub status: CheckpointStatus,
    pub artifact_path: Option<PathBuf>,
    pub artifact_rows: Option<u64>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Run that last claimed the entry
    pub claimed_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl CheckpointEntry {
    pub fn artifact(&self) -> Option<ArtifactRef> {
        self.artifact_path.as_ref().map(|path| ArtifactRef {
            fingerprint: self.fingerprint.clone(),
            path: path.clone(),
            rows: self.artifact_rows.unwrap_or(0),
        })
    }

    pub fn is_permanent_failure(&self, max_attempts: u32) -> bool {
        self.status == CheckpointStatus::Failed && self.attempt_count >= max_attempts
    }
}

/// Result of racing for ownership of one fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the fingerprint for this run
    Claimed { attempt_count: u32 },
    /// Someone else owns it, or its state forbids work; carries the entry as
    /// it is now
    Lost(Option<CheckpointEntry>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub staged: u64,
    pub loaded: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.staged + self.loaded + self.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactSummary {
    /// Loaded entries whose source path has since been re-fingerprinted
    pub superseded_removed: u64,
    /// Artifact references of merged entries that were cleared
    pub references_cleared: u64,
    /// Artifacts the removed entries still pointed at
    pub orphaned_artifacts: Vec<PathBuf>,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn entry_from_row(row: &SqliteRow) -> Result<CheckpointEntry> {
    let raw_fp: String = row.try_get("fingerprint")?;
    let fingerprint = Fingerprint::parse(&raw_fp)
        .ok_or_else(|| CheckpointError::Corrupt(format!("invalid fingerprint '{}'", raw_fp)))?;
    let raw_status: String = row.try_get("status")?;
    let status = CheckpointStatus::parse(&raw_status)
        .ok_or_else(|| CheckpointError::Corrupt(format!("invalid status '{}'", raw_status)))?;

    let source_path: String = row.try_get("source_path")?;
    let artifact_path: Option<String> = row.try_get("artifact_path")?;
    let artifact_rows: Option<i64> = row.try_get("artifact_rows")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;

    Ok(CheckpointEntry {
        fingerprint,
        source_path: PathBuf::from(source_path),
        status,
        artifact_path: artifact_path.map(PathBuf::from),
        artifact_rows: artifact_rows.map(|n| n.max(0) as u64),
        attempt_count: attempt_count.clamp(0, i64::from(u32::MAX)) as u32,
        last_error: row.try_get("last_error")?,
        claimed_by: row.try_get("claimed_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const SELECT_ENTRY: &str = r#"
    SELECT fingerprint, source_path, status, artifact_path, artifact_rows,
           attempt_count, last_error, claimed_by, created_at, updated_at
    FROM checkpoints
"#;

/// Handle to the checkpoint database; cheap to clone
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    /// Open (creating if needed), migrate, and integrity-check the store
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations/checkpoint").run(&pool).await?;

        let check: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&pool)
            .await?;
        if check != "ok" {
            return Err(CheckpointError::Corrupt(check));
        }

        info!(path = %path.display(), "Checkpoint store opened");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CheckpointEntry>> {
        let row = sqlx::query(&format!("{SELECT_ENTRY} WHERE fingerprint = ?1"))
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    /// Insert a `pending` entry unless the fingerprint is already known
    pub async fn register(&self, fingerprint: &Fingerprint, source_path: &Path) -> Result<bool> {
        let ts = now();
        let result = sqlx::query(
            r#"
            INSERT INTO checkpoints (fingerprint, source_path, status, created_at, updated_at)
            VALUES (?1, ?2, 'pending', ?3, ?3)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(path_str(source_path))
        .bind(&ts)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Take ownership of a workable fingerprint for `run_id`
    ///
    /// One guarded UPDATE: among racing callers exactly one sees a row
    /// affected. Entries already claimed by this run, staged or loaded
    /// entries, and entries at the attempt bound are never claimed.
    pub async fn claim(
        &self,
        fingerprint: &Fingerprint,
        run_id: &str,
        max_attempts: u32,
    ) -> Result<ClaimOutcome> {
        let claimed: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE checkpoints
            SET claimed_by = ?2, updated_at = ?4
            WHERE fingerprint = ?1
              AND status IN ('pending', 'failed')
              AND attempt_count < ?3
              AND (claimed_by IS NULL OR claimed_by <> ?2)
            RETURNING attempt_count
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(run_id)
        .bind(i64::from(max_attempts))
        .bind(now())
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some(attempt_count) => Ok(ClaimOutcome::Claimed {
                attempt_count: attempt_count.max(0) as u32,
            }),
            None => Ok(ClaimOutcome::Lost(self.lookup(fingerprint).await?)),
        }
    }

    /// Hand a claimed entry back as `pending` without spending an attempt
    pub async fn release(&self, fingerprint: &Fingerprint, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE checkpoints
            SET status = 'pending', claimed_by = NULL, last_error = ?2, updated_at = ?3
            WHERE fingerprint = ?1 AND status IN ('pending', 'failed')
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(reason)
        .bind(now())
        .execute(&self.pool)
        .await?;

        self.expect_transition(fingerprint, result.rows_affected(), "pending")
            .await
    }

    /// Record a committed artifact; legal from `pending`, `failed`, or unknown
    pub async fn mark_staged(
        &self,
        fingerprint: &Fingerprint,
        source_path: &Path,
        artifact: &ArtifactRef,
    ) -> Result<()> {
        let ts = now();
        let result = sqlx::query(
            r#"
            INSERT INTO checkpoints
                (fingerprint, source_path, status, artifact_path, artifact_rows, created_at, updated_at)
            VALUES (?1, ?2, 'staged', ?3, ?4, ?5, ?5)
            ON CONFLICT(fingerprint) DO UPDATE SET
                status = 'staged',
                artifact_path = excluded.artifact_path,
                artifact_rows = excluded.artifact_rows,
                last_error = NULL,
                updated_at = excluded.updated_at
            WHERE checkpoints.status IN ('pending', 'failed')
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(path_str(source_path))
        .bind(path_str(&artifact.path))
        .bind(artifact.rows as i64)
        .bind(&ts)
        .execute(&self.pool)
        .await?;

        self.expect_transition(fingerprint, result.rows_affected(), "staged")
            .await
    }

    pub async fn mark_loaded(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.mark_loaded_many(std::slice::from_ref(fingerprint)).await
    }

    /// Flip a whole load batch to `loaded` in one transaction
    pub async fn mark_loaded_many(&self, fingerprints: &[Fingerprint]) -> Result<()> {
        let ts = now();
        let mut tx = self.pool.begin().await?;

        for fingerprint in fingerprints {
            let result = sqlx::query(
                r#"
                UPDATE checkpoints
                SET status = 'loaded', updated_at = ?2
                WHERE fingerprint = ?1 AND status = 'staged'
                "#,
            )
            .bind(fingerprint.as_str())
            .bind(&ts)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() != 1 {
                tx.rollback().await?;
                return Err(self.invalid_transition(fingerprint, "loaded").await);
            }
        }

        tx.commit().await?;
        debug!(count = fingerprints.len(), "Checkpoints marked loaded");
        Ok(())
    }

    /// Record a failed attempt; returns the new attempt count
    pub async fn mark_failed(&self, fingerprint: &Fingerprint, error: &str) -> Result<u32> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE checkpoints
            SET status = 'failed',
                attempt_count = attempt_count + 1,
                last_error = ?2,
                artifact_path = NULL,
                artifact_rows = NULL,
                updated_at = ?3
            WHERE fingerprint = ?1 AND status <> 'loaded'
            RETURNING attempt_count
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(error)
        .bind(now())
        .fetch_optional(&self.pool)
        .await?;

        match count {
            Some(count) => Ok(count.max(0) as u32),
            None => Err(self.invalid_transition(fingerprint, "failed").await),
        }
    }

    async fn expect_transition(
        &self,
        fingerprint: &Fingerprint,
        rows_affected: u64,
        to: &'static str,
    ) -> Result<()> {
        if rows_affected == 1 {
            Ok(())
        } else {
            Err(self.invalid_transition(fingerprint, to).await)
        }
    }

    async fn invalid_transition(&self, fingerprint: &Fingerprint, to: &'static str) -> CheckpointError {
        let from = match self.lookup(fingerprint).await {
            Ok(Some(entry)) => entry.status.to_string(),
            Ok(None) => "unknown".to_string(),
            Err(e) => return e,
        };
        CheckpointError::InvalidTransition {
            fingerprint: fingerprint.to_string(),
            from,
            to,
        }
    }

    /// Entries waiting for the loader, oldest first
    pub async fn staged_entries(&self) -> Result<Vec<CheckpointEntry>> {
        let rows = sqlx::query(&format!(
            "{SELECT_ENTRY} WHERE status = 'staged' ORDER BY updated_at, fingerprint"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn permanent_failures(&self, max_attempts: u32) -> Result<Vec<CheckpointEntry>> {
        let rows = sqlx::query(&format!(
            "{SELECT_ENTRY} WHERE status = 'failed' AND attempt_count >= ?1 ORDER BY source_path"
        ))
        .bind(i64::from(max_attempts))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM checkpoints GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            let n = n.max(0) as u64;
            match CheckpointStatus::parse(&status) {
                Some(CheckpointStatus::Pending) => counts.pending = n,
                Some(CheckpointStatus::Staged) => counts.staged = n,
                Some(CheckpointStatus::Loaded) => counts.loaded = n,
                Some(CheckpointStatus::Failed) => counts.failed = n,
                None => return Err(CheckpointError::Corrupt(format!("invalid status '{}'", status))),
            }
        }
        Ok(counts)
    }

    /// Forget every entry; the next run starts from scratch
    pub async fn reset(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM checkpoints")
            .execute(&self.pool)
            .await?;
        info!(removed = result.rows_affected(), "Checkpoint store reset");
        Ok(result.rows_affected())
    }

    /// Prune history an operator no longer needs
    ///
    /// Removes `loaded` entries whose source path has a newer fingerprint,
    /// and unless `retain_artifacts` clears artifact references of merged
    /// entries.
    pub async fn compact(&self, retain_artifacts: bool) -> Result<CompactSummary> {
        let mut tx = self.pool.begin().await?;

        let superseded = r#"
            status = 'loaded' AND EXISTS (
                SELECT 1 FROM checkpoints newer
                WHERE newer.source_path = checkpoints.source_path
                  AND newer.rowid > checkpoints.rowid
            )
        "#;

        let orphaned: Vec<Option<String>> = sqlx::query_scalar(&format!(
            "SELECT artifact_path FROM checkpoints WHERE {superseded}"
        ))
        .fetch_all(&mut *tx)
        .await?;

        let removed = sqlx::query(&format!("DELETE FROM checkpoints WHERE {superseded}"))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let cleared = if retain_artifacts {
            0
        } else {
            sqlx::query(
                r#"
                UPDATE checkpoints SET artifact_path = NULL, updated_at = ?1
                WHERE status = 'loaded' AND artifact_path IS NOT NULL
                "#,
            )
            .bind(now())
            .execute(&mut *tx)
            .await?
            .rows_affected()
        };

        tx.commit().await?;

        let summary = CompactSummary {
            superseded_removed: removed,
            references_cleared: cleared,
            orphaned_artifacts: orphaned.into_iter().flatten().map(PathBuf::from).collect(),
        };
        info!(
            superseded_removed = summary.superseded_removed,
            references_cleared = summary.references_cleared,
            "Checkpoint store compacted"
        );
        Ok(summary)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fp(c: char) -> Fingerprint {
        Fingerprint::parse(&c.to_string().repeat(64)).unwrap()
    }

    fn artifact(fingerprint: &Fingerprint) -> ArtifactRef {
        ArtifactRef {
            fingerprint: fingerprint.clone(),
            path: PathBuf::from(format!("/staging/{}.parquet", fingerprint)),
            rows: 3,
        }
    }

    async fn store(dir: &tempfile::TempDir) -> CheckpointStore {
        CheckpointStore::open(dir.path().join("state/checkpoint.db"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let a = fp('a');

        assert!(store.lookup(&a).await.unwrap().is_none());
        assert!(store.register(&a, Path::new("/dats/a.dat")).await.unwrap());
        assert!(!store.register(&a, Path::new("/dats/a.dat")).await.unwrap());
        assert_eq!(
            store.claim(&a, "run-1", 3).await.unwrap(),
            ClaimOutcome::Claimed { attempt_count: 0 }
        );

        store
            .mark_staged(&a, Path::new("/dats/a.dat"), &artifact(&a))
            .await
            .unwrap();
        let staged = store.lookup(&a).await.unwrap().unwrap();
        assert_eq!(staged.status, CheckpointStatus::Staged);
        assert_eq!(staged.artifact(), Some(artifact(&a)));
        assert_eq!(store.staged_entries().await.unwrap().len(), 1);

        store.mark_loaded(&a).await.unwrap();
        let loaded = store.lookup(&a).await.unwrap().unwrap();
        assert_eq!(loaded.status, CheckpointStatus::Loaded);
        assert!(store.staged_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let a = fp('a');
        {
            let store = store(&dir).await;
            store.register(&a, Path::new("/a.dat")).await.unwrap();
            store.mark_staged(&a, Path::new("/a.dat"), &artifact(&a)).await.unwrap();
            store.close().await;
        }
        let store = store(&dir).await;
        assert_eq!(
            store.lookup(&a).await.unwrap().unwrap().status,
            CheckpointStatus::Staged
        );
    }

    #[tokio::test]
    async fn test_invalid_transitions_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let a = fp('a');
        store.register(&a, Path::new("/a.dat")).await.unwrap();

        let err = store.mark_loaded(&a).await.unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::InvalidTransition { ref from, to: "loaded", .. } if from == "pending"
        ));

        store.mark_staged(&a, Path::new("/a.dat"), &artifact(&a)).await.unwrap();
        store.mark_loaded(&a).await.unwrap();

        assert!(store.mark_staged(&a, Path::new("/a.dat"), &artifact(&a)).await.is_err());
        assert!(store.mark_failed(&a, "late").await.is_err());
        assert!(matches!(
            store.claim(&a, "run-2", 3).await.unwrap(),
            ClaimOutcome::Lost(Some(CheckpointEntry { status: CheckpointStatus::Loaded, .. }))
        ));
    }

    #[tokio::test]
    async fn test_mark_loaded_many_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let (a, b) = (fp('a'), fp('b'));
        store.mark_staged(&a, Path::new("/a.dat"), &artifact(&a)).await.unwrap();
        store.register(&b, Path::new("/b.dat")).await.unwrap();

        assert!(store.mark_loaded_many(&[a.clone(), b.clone()]).await.is_err());
        assert_eq!(
            store.lookup(&a).await.unwrap().unwrap().status,
            CheckpointStatus::Staged
        );
    }

    #[tokio::test]
    async fn test_failures_count_toward_permanent_bound() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let a = fp('a');
        store.register(&a, Path::new("/a.dat")).await.unwrap();

        for run in 1..=2 {
            let run_id = format!("run-{run}");
            assert!(matches!(
                store.claim(&a, &run_id, 2).await.unwrap(),
                ClaimOutcome::Claimed { .. }
            ));
            // same run may not retry
            assert!(matches!(
                store.claim(&a, &run_id, 2).await.unwrap(),
                ClaimOutcome::Lost(_)
            ));
            assert_eq!(store.mark_failed(&a, "truncated").await.unwrap(), run);
        }

        assert!(matches!(store.claim(&a, "run-3", 2).await.unwrap(), ClaimOutcome::Lost(_)));
        let permanent = store.permanent_failures(2).await.unwrap();
        assert_eq!(permanent.len(), 1);
        assert_eq!(permanent[0].last_error.as_deref(), Some("truncated"));
        assert!(permanent[0].is_permanent_failure(2));
    }

    #[tokio::test]
    async fn test_release_does_not_spend_an_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let a = fp('a');
        store.register(&a, Path::new("/a.dat")).await.unwrap();
        store.claim(&a, "run-1", 3).await.unwrap();
        store.release(&a, "disk full").await.unwrap();

        let entry = store.lookup(&a).await.unwrap().unwrap();
        assert_eq!(entry.status, CheckpointStatus::Pending);
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.claimed_by, None);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(&dir).await);
        let a = fp('a');
        store.register(&a, Path::new("/a.dat")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let a = a.clone();
            handles.push(tokio::spawn(async move { store.claim(&a, "run-1", 3).await }));
        }

        let mut winners = 0;
        for handle in handles {
            if matches!(handle.await.unwrap().unwrap(), ClaimOutcome::Claimed { .. }) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_status_counts_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let (a, b, c) = (fp('a'), fp('b'), fp('c'));
        store.register(&a, Path::new("/a.dat")).await.unwrap();
        store.mark_staged(&b, Path::new("/b.dat"), &artifact(&b)).await.unwrap();
        store.register(&c, Path::new("/c.dat")).await.unwrap();
        store.mark_failed(&c, "bad").await.unwrap();

        let counts = store.status_counts().await.unwrap();
        assert_eq!(
            counts,
            StatusCounts {
                pending: 1,
                staged: 1,
                loaded: 0,
                failed: 1
            }
        );
        assert_eq!(counts.total(), 3);

        assert_eq!(store.reset().await.unwrap(), 3);
        assert_eq!(store.status_counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_compact_removes_superseded_loaded_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let (old, new, other) = (fp('a'), fp('b'), fp('c'));

        for (f, path) in [(&old, "/a.dat"), (&new, "/a.dat"), (&other, "/c.dat")] {
            store.mark_staged(f, Path::new(path), &artifact(f)).await.unwrap();
            store.mark_loaded(f).await.unwrap();
        }

        let summary = store.compact(false).await.unwrap();
        assert_eq!(summary.superseded_removed, 1);
        assert_eq!(summary.references_cleared, 2);
        assert_eq!(summary.orphaned_artifacts, vec![artifact(&old).path]);

        assert!(store.lookup(&old).await.unwrap().is_none());
        let kept = store.lookup(&new).await.unwrap().unwrap();
        assert_eq!(kept.artifact_path, None);
        assert_eq!(kept.artifact_rows, Some(3));
    }
}
