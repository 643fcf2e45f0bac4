//! Ingestion configuration
//!
//! Resolved once at startup into an [`IngestConfig`]; the pipeline never looks
//! at raw CLI flags or environment variables after that.

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which ingestion path a run takes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IngestStrategy {
    /// DAT -> Parquet artifact -> destination, resumable across runs
    #[default]
    Staged,
    /// DAT -> in-memory batch -> destination, no checkpoints
    Direct,
}

impl FromStr for IngestStrategy {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "staged" => Ok(IngestStrategy::Staged),
            "direct" => Ok(IngestStrategy::Direct),
            other => Err(IngestError::config(format!("unknown strategy '{}'", other))),
        }
    }
}

impl std::fmt::Display for IngestStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestStrategy::Staged => write!(f, "staged"),
            IngestStrategy::Direct => write!(f, "direct"),
        }
    }
}

/// How a source file's identity is derived
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintMode {
    /// path + size + mtime; never opens the file
    #[default]
    Metadata,
    /// path + full content digest; reads every byte once
    Content,
}

impl FromStr for FingerprintMode {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "metadata" | "meta" => Ok(FingerprintMode::Metadata),
            "content" | "hash" => Ok(FingerprintMode::Content),
            other => Err(IngestError::config(format!("unknown fingerprint mode '{}'", other))),
        }
    }
}

/// When the loader runs relative to staging
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LoadMode {
    /// One merge once every worker has finished
    #[default]
    AfterStaging,
    /// Merge the growing staged set every `interval_ms` while workers run
    Concurrent { interval_ms: u64 },
}

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub strategy: IngestStrategy,
    /// Parallel workers (default: available CPU count)
    pub workers: usize,
    /// Maximum rows per destination transaction
    pub batch_size: usize,
    /// Directory holding `<fingerprint>.parquet` artifacts
    pub staging_dir: PathBuf,
    pub checkpoint_path: PathBuf,
    pub destination_path: PathBuf,
    pub fingerprint_mode: FingerprintMode,
    /// Parse attempts per fingerprint before it becomes a permanent failure
    pub max_attempts: u32,
    /// Commit attempts per load batch before the merge aborts
    pub max_commit_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Keep merged artifacts on disk instead of deleting them
    pub retain_artifacts: bool,
    pub load_mode: LoadMode,
    /// How many failure reasons the run summary keeps
    pub failure_sample_limit: usize,
    pub show_progress: bool,
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::in_dir("./datforge-state")
    }
}

impl IngestConfig {
    /// Place checkpoint, staging, and destination under one directory
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            strategy: IngestStrategy::default(),
            workers: default_workers(),
            batch_size: 10_000,
            staging_dir: dir.join("staging"),
            checkpoint_path: dir.join("checkpoint.db"),
            destination_path: dir.join("catalog.db"),
            fingerprint_mode: FingerprintMode::default(),
            max_attempts: 3,
            max_commit_attempts: 3,
            retry_backoff_ms: 250,
            retain_artifacts: false,
            load_mode: LoadMode::default(),
            failure_sample_limit: 10,
            show_progress: false,
        }
    }

    /// Load configuration from `DATFORGE_*` environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("DATFORGE_STATE_DIR") {
            Ok(dir) => Self::in_dir(dir),
            Err(_) => Self::default(),
        };

        if let Some(strategy) = env_parse("DATFORGE_STRATEGY")? {
            config.strategy = strategy;
        }
        if let Some(workers) = env_parse("DATFORGE_WORKERS")? {
            config.workers = workers;
        }
        if let Some(batch_size) = env_parse("DATFORGE_BATCH_SIZE")? {
            config.batch_size = batch_size;
        }
        if let Ok(dir) = std::env::var("DATFORGE_STAGING_DIR") {
            config.staging_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("DATFORGE_CHECKPOINT_PATH") {
            config.checkpoint_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("DATFORGE_DESTINATION_PATH") {
            config.destination_path = PathBuf::from(path);
        }
        if let Some(mode) = env_parse("DATFORGE_FINGERPRINT_MODE")? {
            config.fingerprint_mode = mode;
        }
        if let Some(max_attempts) = env_parse("DATFORGE_MAX_ATTEMPTS")? {
            config.max_attempts = max_attempts;
        }
        if let Some(max_commit_attempts) = env_parse("DATFORGE_MAX_COMMIT_ATTEMPTS")? {
            config.max_commit_attempts = max_commit_attempts;
        }
        if let Some(backoff) = env_parse("DATFORGE_RETRY_BACKOFF_MS")? {
            config.retry_backoff_ms = backoff;
        }
        if let Some(retain) = env_parse("DATFORGE_RETAIN_ARTIFACTS")? {
            config.retain_artifacts = retain;
        }
        if let Some(interval_ms) = env_parse::<u64>("DATFORGE_LOAD_INTERVAL_MS")? {
            config.load_mode = LoadMode::Concurrent { interval_ms };
        }

        Ok(config)
    }

    pub fn with_strategy(mut self, strategy: IngestStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_fingerprint_mode(mut self, mode: FingerprintMode) -> Self {
        self.fingerprint_mode = mode;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_load_mode(mut self, load_mode: LoadMode) -> Self {
        self.load_mode = load_mode;
        self
    }

    pub fn with_retain_artifacts(mut self, retain: bool) -> Self {
        self.retain_artifacts = retain;
        self
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Reject configurations the pipeline cannot run safely
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(IngestError::config("workers must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(IngestError::config("batch_size must be at least 1"));
        }
        if self.max_attempts == 0 || self.max_commit_attempts == 0 {
            return Err(IngestError::config("attempt limits must be at least 1"));
        }
        if self.checkpoint_path == self.destination_path {
            return Err(IngestError::config(
                "checkpoint store and destination must be separate files",
            ));
        }
        if let LoadMode::Concurrent { interval_ms: 0 } = self.load_mode {
            return Err(IngestError::config("concurrent load interval must be positive"));
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| IngestError::config(format!("{}={}: {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IngestConfig::default();
        assert_eq!(config.strategy, IngestStrategy::Staged);
        assert_eq!(config.fingerprint_mode, FingerprintMode::Metadata);
        assert!(config.workers >= 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_in_dir_places_all_state_together() {
        let config = IngestConfig::in_dir("/tmp/run");
        assert_eq!(config.staging_dir, PathBuf::from("/tmp/run/staging"));
        assert_eq!(config.checkpoint_path, PathBuf::from("/tmp/run/checkpoint.db"));
        assert_eq!(config.destination_path, PathBuf::from("/tmp/run/catalog.db"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(IngestConfig::default().with_workers(0).validate().is_err());
        assert!(IngestConfig::default().with_batch_size(0).validate().is_err());
        assert!(IngestConfig::default().with_max_attempts(0).validate().is_err());

        let mut shared = IngestConfig::default();
        shared.destination_path = shared.checkpoint_path.clone();
        assert!(shared.validate().is_err());

        let zero_interval =
            IngestConfig::default().with_load_mode(LoadMode::Concurrent { interval_ms: 0 });
        assert!(zero_interval.validate().is_err());
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("Direct".parse::<IngestStrategy>().unwrap(), IngestStrategy::Direct);
        assert_eq!("staged".parse::<IngestStrategy>().unwrap(), IngestStrategy::Staged);
        assert!("legacy".parse::<IngestStrategy>().is_err());
    }

    #[test]
    fn test_load_mode_serde_shape() {
        let json = serde_json::to_string(&LoadMode::Concurrent { interval_ms: 500 }).unwrap();
        assert_eq!(json, r#"{"mode":"concurrent","interval_ms":500}"#);
        let back: LoadMode = serde_json::from_str(r#"{"mode":"after_staging"}"#).unwrap();
        assert_eq!(back, LoadMode::AfterStaging);
    }
}
