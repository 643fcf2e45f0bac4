//! datforge common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the datforge workspace members.
//!
//! - **Logging**: tracing subscriber setup (console, rolling file, JSON)
//! - **Digests**: length-framed SHA-256 used for source fingerprints
//! - **Errors**: the shared error and result types
//!
//! # Example
//!
//! ```no_run
//! use datforge_common::digest::FieldHasher;
//!
//! fn identify(path: &str) -> datforge_common::Result<String> {
//!     let mut file = std::fs::File::open(path)?;
//!     FieldHasher::new().field(path).finish_with_reader(&mut file)
//! }
//! ```

pub mod digest;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
