//! Stable source file identity used as the checkpoint key

use crate::config::FingerprintMode;
use crate::error::FingerprintError;
use crate::source::SourceFile;
use datforge_common::digest::FieldHasher;
use datforge_common::CommonError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;

/// Lowercase hex SHA-256, 64 characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Accept an existing value, e.g. read back from the checkpoint store
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == 64 && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Fingerprinter {
    mode: FingerprintMode,
}

impl Fingerprinter {
    pub fn new(mode: FingerprintMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> FingerprintMode {
        self.mode
    }

    /// Metadata mode is pure and never touches the file; content mode
    /// streams it exactly once.
    pub fn fingerprint(&self, source: &SourceFile) -> Result<Fingerprint, FingerprintError> {
        let path = source.path.to_string_lossy();

        let digest = match self.mode {
            FingerprintMode::Metadata => FieldHasher::new()
                .field("meta")
                .field(path.as_bytes())
                .field(source.size.to_le_bytes())
                .field(source.modified_nanos.to_le_bytes())
                .finish(),
            FingerprintMode::Content => {
                let io_error = |e: std::io::Error| FingerprintError::Io {
                    path: source.path.clone(),
                    source: e,
                };
                let file = File::open(&source.path).map_err(io_error)?;
                let mut reader = BufReader::new(file);
                FieldHasher::new()
                    .field("content")
                    .field(path.as_bytes())
                    .finish_with_reader(&mut reader)
                    .map_err(|CommonError::Io(e)| io_error(e))?
            },
        };

        Ok(Fingerprint(digest))
    }
}
