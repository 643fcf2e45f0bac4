//! Source file observation and discovery

use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

static CATALOG_VERSION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)TOSEC-v\d{4}-\d{2}-\d{2}").ok());

const SOURCE_EXTENSIONS: &[&str] = &["dat", "xml"];

/// A candidate input as seen at the start of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Canonical absolute path
    pub path: PathBuf,
    pub size: u64,
    /// Modification time in nanoseconds relative to the Unix epoch
    pub modified_nanos: i128,
    /// Name of the parent directory
    pub group_label: String,
}

impl SourceFile {
    pub fn observe(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = std::fs::canonicalize(path.as_ref())?;
        let metadata = std::fs::metadata(&path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        Ok(Self {
            size: metadata.len(),
            modified_nanos: epoch_nanos(metadata.modified()?),
            group_label: group_label(&path),
            path,
        })
    }

    /// File name without directories, used as the row source identifier
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn epoch_nanos(time: SystemTime) -> i128 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_nanos() as i128,
        Err(before) => -(before.duration().as_nanos() as i128),
    }
}

/// Parent directory name, or "Unknown" at the filesystem root
pub fn group_label(path: &Path) -> String {
    path.parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Walk `root` for catalog files, sorted for a stable work order
pub fn discover(root: impl AsRef<Path>) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root.as_ref()).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_catalog = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| SOURCE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
            .unwrap_or(false);
        if is_catalog {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

/// Release tag embedded in the input path, e.g. `TOSEC-v2023-08-15`
pub fn detect_catalog_version(path: impl AsRef<Path>) -> Option<String> {
    let re = CATALOG_VERSION.as_ref()?;
    let haystack = path.as_ref().to_string_lossy();
    re.find(&haystack).map(|m| m.as_str().to_string())
}
