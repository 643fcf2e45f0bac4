//! Destination store: the flat `roms` table in an embedded SQLite database
//!
//! Rows are deduplicated on `(group_label, source_id, item_title,
//! item_filename, primary_hash)`, so two games that ship the same file keep
//! a row each. Inserts use `ON CONFLICT DO NOTHING`, so committing the
//! same rows twice leaves the table unchanged.

use crate::error::{DestinationError, IngestError};
use crate::row::CandidateRow;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, DestinationError>;

/// Rows per INSERT statement; 15 binds each stays well under SQLite's limit
const INSERT_CHUNK: usize = 500;

pub const CATALOG_VERSION_KEY: &str = "catalog_version";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCommit {
    pub inserted: u64,
    /// Rows already present under the natural key
    pub ignored: u64,
}

/// Transactional bulk-insert seam used by the loader and the direct engine
#[async_trait]
pub trait RowSink: Send + Sync {
    /// Commit all of `rows` in one transaction, or none of them
    async fn commit_batch(&self, rows: &[CandidateRow]) -> Result<BatchCommit>;
}

/// Whole-batch retry with linear backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

/// Commit `rows`, retrying the whole batch; returns the commit and the number
/// of failed attempts before it. Exhausting the policy is a fatal merge error.
pub async fn commit_with_retry(
    sink: &dyn RowSink,
    rows: &[CandidateRow],
    policy: RetryPolicy,
) -> std::result::Result<(BatchCommit, u32), IngestError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match sink.commit_batch(rows).await {
            Ok(commit) => return Ok((commit, attempt - 1)),
            Err(e) if attempt >= max_attempts => {
                return Err(IngestError::Merge {
                    attempts: attempt,
                    source: e,
                });
            },
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts,
                    rows = rows.len(),
                    error = %e,
                    "Batch commit failed, retrying"
                );
                tokio::time::sleep(policy.backoff * attempt).await;
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteDestination {
    pool: SqlitePool,
}

fn row_from_sql(row: &SqliteRow) -> Result<CandidateRow> {
    let size: i64 = row.try_get("size")?;
    Ok(CandidateRow {
        source_id: row.try_get("source_id")?,
        group_label: row.try_get("group_label")?,
        platform: row.try_get("platform")?,
        category: row.try_get("category")?,
        item_title: row.try_get("item_title")?,
        base_title: row.try_get("base_title")?,
        release_year: row.try_get("release_year")?,
        description: row.try_get("description")?,
        item_filename: row.try_get("item_filename")?,
        size: u64::try_from(size)
            .map_err(|_| DestinationError::Rejected(format!("negative size {}", size)))?,
        crc: row.try_get("crc")?,
        md5: row.try_get("md5")?,
        sha1: row.try_get("sha1")?,
        status: row.try_get("status")?,
    })
}

impl SqliteDestination {
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

        sqlx::migrate!("./migrations/destination").run(&pool).await?;

        info!(path = %path.display(), "Destination opened");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn row_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM roms")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Rows with `id > after_id` in insertion order; returns the last id seen
    pub async fn fetch_page(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<(Vec<CandidateRow>, Option<i64>)> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, group_label, platform, category, item_title, base_title,
                   release_year, description, item_filename, size, crc, md5, sha1, status
            FROM roms
            WHERE id > ?1
            ORDER BY id
            LIMIT ?2
            "#,
        )
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let last_id = match rows.last() {
            Some(row) => Some(row.try_get::<i64, _>("id")?),
            None => None,
        };
        let rows = rows.iter().map(row_from_sql).collect::<Result<Vec<_>>>()?;
        Ok((rows, last_id))
    }

    /// Every row in insertion order
    pub async fn fetch_rows(&self) -> Result<Vec<CandidateRow>> {
        let mut out = Vec::new();
        let mut cursor = 0;
        loop {
            let (page, last_id) = self.fetch_page(cursor, 10_000).await?;
            out.extend(page);
            match last_id {
                Some(id) => cursor = id,
                None => return Ok(out),
            }
        }
    }

    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT value FROM catalog_metadata WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO catalog_metadata (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete every row and metadata entry
    pub async fn wipe(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM roms")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM catalog_metadata")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(removed, "Destination wiped");
        Ok(removed)
    }
}

#[async_trait]
impl RowSink for SqliteDestination {
    async fn commit_batch(&self, rows: &[CandidateRow]) -> Result<BatchCommit> {
        if rows.is_empty() {
            return Ok(BatchCommit::default());
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut query_builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
                r#"
                INSERT INTO roms (
                    source_id, group_label, platform, category, item_title, base_title,
                    release_year, description, item_filename, size, crc, md5, sha1,
                    status, primary_hash
                )
                "#,
            );

            query_builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.source_id.as_str())
                    .push_bind(row.group_label.as_str())
                    .push_bind(row.platform.as_str())
                    .push_bind(row.category.as_str())
                    .push_bind(row.item_title.as_str())
                    .push_bind(row.base_title.as_str())
                    .push_bind(row.release_year)
                    .push_bind(row.description.as_str())
                    .push_bind(row.item_filename.as_str())
                    .push_bind(row.size as i64)
                    .push_bind(row.crc.as_deref())
                    .push_bind(row.md5.as_deref())
                    .push_bind(row.sha1.as_deref())
                    .push_bind(row.status.as_str())
                    .push_bind(row.primary_hash());
            });
            query_builder.push(
                " ON CONFLICT(group_label, source_id, item_title, item_filename, primary_hash) DO NOTHING",
            );

            inserted += query_builder
                .build()
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;

        let commit = BatchCommit {
            inserted,
            ignored: rows.len() as u64 - inserted,
        };
        debug!(inserted = commit.inserted, ignored = commit.ignored, "Batch committed");
        Ok(commit)
    }
}
