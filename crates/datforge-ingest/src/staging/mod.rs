//! Staging writer: one immutable Parquet artifact per source file
//!
//! An artifact becomes visible under its final name only through an atomic
//! rename of a fully written and fsynced `.partial` file, so a reader never
//! observes a half-written artifact. The partial name is derived from the
//! fingerprint, which makes a retried write overwrite its own leftovers.

pub mod artifact;

use crate::error::StagingError;
use crate::fingerprint::Fingerprint;
use crate::row::CandidateRow;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const ARTIFACT_EXT: &str = "parquet";
const PARTIAL_EXT: &str = "partial";

/// Durable handle to a committed artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    pub rows: u64,
}

#[derive(Debug, Clone)]
pub struct StagingWriter {
    dir: PathBuf,
}

impl StagingWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StagingError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StagingError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.{}", fingerprint, ARTIFACT_EXT))
    }

    pub fn partial_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}", fingerprint, ARTIFACT_EXT, PARTIAL_EXT))
    }

    /// Write, fsync, rename, fsync the directory
    ///
    /// Blocking; callers on the async runtime go through `spawn_blocking`.
    pub fn stage(
        &self,
        fingerprint: &Fingerprint,
        rows: &[CandidateRow],
    ) -> Result<ArtifactRef, StagingError> {
        let partial = self.partial_path(fingerprint);
        let target = self.artifact_path(fingerprint);

        let result = self.write_partial(&partial, fingerprint, rows).and_then(|()| {
            fs::rename(&partial, &target).map_err(|e| StagingError::io(&target, e))?;
            sync_dir(&self.dir).map_err(|e| StagingError::io(&self.dir, e))
        });

        if let Err(e) = result {
            if let Err(cleanup) = remove_if_exists(&partial) {
                warn!(path = %partial.display(), error = %cleanup, "Could not remove partial artifact");
            }
            return Err(e);
        }

        debug!(fingerprint = %fingerprint.short(), rows = rows.len(), "Artifact committed");

        Ok(ArtifactRef {
            fingerprint: fingerprint.clone(),
            path: target,
            rows: rows.len() as u64,
        })
    }

    fn write_partial(
        &self,
        partial: &Path,
        fingerprint: &Fingerprint,
        rows: &[CandidateRow],
    ) -> Result<(), StagingError> {
        let file = File::create(partial).map_err(|e| StagingError::io(partial, e))?;
        let file = artifact::write_rows(file, Some(fingerprint.as_str()), rows)?;
        file.sync_all().map_err(|e| StagingError::io(partial, e))
    }

    /// A renamed artifact left behind by a run that died before flipping the
    /// checkpoint. The whole body is decoded before it is adopted; unreadable
    /// or foreign files are removed and ignored.
    pub fn find_committed(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ArtifactRef>, StagingError> {
        let path = self.artifact_path(fingerprint);
        if !path.exists() {
            return Ok(None);
        }

        let reason = match artifact::read_rows(&path) {
            Ok((info, _)) if info.fingerprint.as_deref() != Some(fingerprint.as_str()) => {
                "fingerprint mismatch".to_string()
            },
            Ok((info, rows)) if rows.len() as u64 != info.rows => {
                format!("footer counts {} rows, body holds {}", info.rows, rows.len())
            },
            Ok((info, _)) => {
                return Ok(Some(ArtifactRef {
                    fingerprint: fingerprint.clone(),
                    path,
                    rows: info.rows,
                }));
            },
            Err(e) => e.to_string(),
        };

        warn!(path = %path.display(), reason = %reason, "Discarding unusable artifact");
        remove_if_exists(&path).map_err(|e| StagingError::io(&path, e))?;
        Ok(None)
    }

    /// Rows of a committed artifact, verified against the expected fingerprint
    pub fn read_artifact(
        &self,
        path: &Path,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<CandidateRow>, StagingError> {
        let (info, rows) = artifact::read_rows(path)?;
        if info.fingerprint.as_deref() != Some(fingerprint.as_str()) {
            return Err(StagingError::invalid(
                path,
                format!(
                    "expected fingerprint {}, found {}",
                    fingerprint,
                    info.fingerprint.as_deref().unwrap_or("none")
                ),
            ));
        }
        Ok(rows)
    }

    pub fn remove(&self, path: &Path) -> Result<(), StagingError> {
        remove_if_exists(path).map_err(|e| StagingError::io(path, e))
    }

    /// Delete `.partial` leftovers of interrupted writes
    pub fn sweep_partials(&self) -> Result<usize, StagingError> {
        self.remove_matching(|name| name.ends_with(&format!(".{}", PARTIAL_EXT)))
    }

    /// Delete every artifact and partial in the staging directory
    pub fn clear(&self) -> Result<usize, StagingError> {
        self.remove_matching(|name| {
            name.ends_with(&format!(".{}", PARTIAL_EXT)) || name.ends_with(&format!(".{}", ARTIFACT_EXT))
        })
    }

    fn remove_matching(&self, matches: impl Fn(&str) -> bool) -> Result<usize, StagingError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StagingError::io(&self.dir, e))?;

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| StagingError::io(&self.dir, e))?;
            let name = entry.file_name();
            if !matches(&name.to_string_lossy()) {
                continue;
            }
            let path = entry.path();
            if path.is_file() {
                remove_if_exists(&path).map_err(|e| StagingError::io(&path, e))?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn fp(c: char) -> Fingerprint {
        Fingerprint::parse(&c.to_string().repeat(64)).unwrap()
    }

    fn row(name: &str) -> CandidateRow {
        CandidateRow {
            source_id: "x.dat".into(),
            group_label: "g".into(),
            platform: "p".into(),
            category: "Standard".into(),
            item_title: "Game A".into(),
            base_title: "Game A".into(),
            release_year: None,
            description: String::new(),
            item_filename: name.into(),
            size: 1,
            crc: None,
            md5: None,
            sha1: Some("abc123".into()),
            status: "good".into(),
        }
    }

    #[test]
    fn test_stage_commits_under_final_name() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StagingWriter::new(dir.path().join("staging")).unwrap();
        let fp = fp('a');

        let artifact = writer.stage(&fp, &[row("a.bin"), row("b.bin")]).unwrap();
        assert_eq!(artifact.rows, 2);
        assert_eq!(artifact.path, writer.artifact_path(&fp));
        assert!(artifact.path.exists());
        assert!(!writer.partial_path(&fp).exists());

        let rows = writer.read_artifact(&artifact.path, &fp).unwrap();
        assert_eq!(rows[0].item_filename, "a.bin");
        assert_eq!(rows[1].item_filename, "b.bin");
    }

    #[test]
    fn test_stage_overwrites_stale_partial() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StagingWriter::new(dir.path()).unwrap();
        let fp = fp('b');
        fs::write(writer.partial_path(&fp), b"half a parquet file").unwrap();

        let artifact = writer.stage(&fp, &[row("a.bin")]).unwrap();
        assert_eq!(writer.read_artifact(&artifact.path, &fp).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_rename_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StagingWriter::new(dir.path()).unwrap();
        let fp = fp('c');
        // a directory squatting on the final name makes the rename fail
        fs::create_dir(writer.artifact_path(&fp)).unwrap();
        fs::write(writer.artifact_path(&fp).join("keep"), b"x").unwrap();

        let err = writer.stage(&fp, &[row("a.bin")]).unwrap_err();
        assert!(matches!(err, StagingError::Io { .. }));
        assert!(!writer.partial_path(&fp).exists());
    }

    #[test]
    fn test_find_committed_validates_and_discards() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StagingWriter::new(dir.path()).unwrap();

        let good = fp('d');
        writer.stage(&good, &[row("a.bin")]).unwrap();
        let found = writer.find_committed(&good).unwrap().unwrap();
        assert_eq!(found.rows, 1);

        let junk = fp('e');
        fs::write(writer.artifact_path(&junk), b"garbage").unwrap();
        assert!(writer.find_committed(&junk).unwrap().is_none());
        assert!(!writer.artifact_path(&junk).exists());

        assert!(writer.find_committed(&fp('f')).unwrap().is_none());
    }

    #[test]
    fn test_find_committed_rejects_damaged_body() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StagingWriter::new(dir.path()).unwrap();
        let fp = fp('9');
        let artifact = writer.stage(&fp, &[row("a.bin"), row("b.bin")]).unwrap();

        // zero the column chunks, keep magic and footer intact
        let mut bytes = fs::read(&artifact.path).unwrap();
        let len = bytes.len();
        let footer = u32::from_le_bytes(bytes[len - 8..len - 4].try_into().unwrap()) as usize;
        bytes[4..len - 8 - footer].fill(0);
        fs::write(&artifact.path, &bytes).unwrap();

        assert!(writer.find_committed(&fp).unwrap().is_none());
        assert!(!artifact.path.exists());
    }

    #[test]
    fn test_read_artifact_rejects_foreign_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StagingWriter::new(dir.path()).unwrap();
        let artifact = writer.stage(&fp('1'), &[row("a.bin")]).unwrap();

        let err = writer.read_artifact(&artifact.path, &fp('2')).unwrap_err();
        assert!(matches!(err, StagingError::Invalid { .. }));
    }

    #[test]
    fn test_sweep_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StagingWriter::new(dir.path()).unwrap();
        writer.stage(&fp('3'), &[]).unwrap();
        fs::write(writer.partial_path(&fp('4')), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        assert_eq!(writer.sweep_partials().unwrap(), 1);
        assert!(writer.artifact_path(&fp('3')).exists());
        assert_eq!(writer.clear().unwrap(), 1);
        assert!(dir.path().join("notes.txt").exists());
    }
}
