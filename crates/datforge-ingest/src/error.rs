//! Error types for datforge ingestion
//!
//! Each layer has its own enum so callers can tell per-file failures
//! (parse, fingerprint, staging) from run-level ones (checkpoint, merge).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Structural failure of one source file
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("source could not be read: {0}")]
    Io(#[from] std::io::Error),

    #[error("unrecognised catalog format")]
    UnknownFormat,

    #[error("malformed markup: {0}")]
    Malformed(String),

    #[error("document is truncated: {0}")]
    Truncated(String),

    #[error("invalid text encoding: {0}")]
    Encoding(String),
}

impl ParseError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn truncated(msg: impl Into<String>) -> Self {
        Self::Truncated(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("cannot fingerprint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure writing or reading a staging artifact
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("staging I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("invalid artifact {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

impl StagingError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Checkpoint store failures are never recoverable within a run
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("checkpoint migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("checkpoint store is corrupt: {0}")]
    Corrupt(String),

    #[error("fingerprint {fingerprint} cannot move to {to} from {from}")]
    InvalidTransition {
        fingerprint: String,
        from: String,
        to: &'static str,
    },
}

#[derive(Error, Debug)]
pub enum DestinationError {
    #[error("destination database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("destination migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("destination rejected batch: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Destination(#[from] DestinationError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("merge failed after {attempts} attempts: {source}")]
    Merge {
        attempts: u32,
        #[source]
        source: DestinationError,
    },

    #[error("catalog release mismatch: destination holds {stored}, input is {incoming}")]
    CatalogVersionMismatch { stored: String, incoming: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
