//! Datforge Ingest Library
//!
//! Loads directories of DAT catalog files into a deduplicated SQLite ROM
//! catalog.
//!
//! # Strategies
//!
//! - **Staged**: each source file is parsed into a Parquet artifact named by
//!   its fingerprint, tracked in a checkpoint store, then merged into the
//!   destination in bounded transactions. Interrupted runs resume.
//! - **Direct**: rows stream from the parser straight into destination
//!   batches. Nothing is checkpointed.
//!
//! # Example
//!
//! ```no_run
//! use datforge_ingest::{source, IngestConfig, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = Pipeline::open(IngestConfig::in_dir("./state")).await?;
//!     let files = source::discover("./dats")?;
//!     let summary = pipeline.run(files).await?;
//!     println!("{}", serde_json::to_string_pretty(&summary)?);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checkpoint;
pub mod config;
pub mod destination;
pub mod direct;
pub mod error;
pub mod fingerprint;
pub mod loader;
pub mod parser;
pub mod pipeline;
pub mod progress;
pub mod row;
pub mod scheduler;
pub mod source;
pub mod staging;

pub use config::{FingerprintMode, IngestConfig, IngestStrategy, LoadMode};
pub use error::{IngestError, Result};
pub use pipeline::{Pipeline, RunSummary};
pub use row::CandidateRow;
