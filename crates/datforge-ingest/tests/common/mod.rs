//! Shared fixtures for integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use datforge_ingest::parser::{DatParser, FileParser, ParseOutcome};
use datforge_ingest::{CandidateRow, IngestConfig, Pipeline};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

pub const CORRUPT: &str = r#"<?xml version="1.0"?>
<datafile>
  <game name="Half Written">
    <rom name="half.bin" size="12" sha1="ffff"#;

/// Source DATs live under `<root>/dats/<group>/`, state under `<root>/state*`
pub struct Workspace {
    pub root: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
        }
    }

    pub fn dats(&self) -> PathBuf {
        self.root.path().join("dats")
    }

    pub fn write(&self, rel: &str, body: &str) -> PathBuf {
        let path = self.dats().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    pub fn config(&self, state: &str) -> IngestConfig {
        IngestConfig::in_dir(self.root.path().join(state))
            .with_workers(2)
            .with_batch_size(64)
    }

    pub async fn pipeline(&self, state: &str) -> Pipeline {
        Pipeline::open(self.config(state)).await.unwrap()
    }

    pub async fn pipeline_with(&self, config: IngestConfig) -> Pipeline {
        Pipeline::open(config).await.unwrap()
    }
}

/// Zero an artifact's column chunks, leaving the magic and footer intact
pub fn damage_artifact_body(path: &Path) {
    let mut bytes = fs::read(path).unwrap();
    let len = bytes.len();
    let footer = u32::from_le_bytes(bytes[len - 8..len - 4].try_into().unwrap()) as usize;
    bytes[4..len - 8 - footer].fill(0);
    fs::write(path, &bytes).unwrap();
}

/// One game with one rom per `(filename, sha1)` pair
pub fn catalog(game: &str, roms: &[(&str, &str)]) -> String {
    let mut doc = String::from("<?xml version=\"1.0\"?>\n<datafile>\n");
    doc.push_str(&format!("  <game name=\"{game}\">\n"));
    doc.push_str(&format!("    <description>{game}</description>\n"));
    for (name, sha1) in roms {
        doc.push_str(&format!(
            "    <rom name=\"{name}\" size=\"1024\" sha1=\"{sha1}\"/>\n"
        ));
    }
    doc.push_str("  </game>\n</datafile>\n");
    doc
}

/// `count` single-rom catalogs with distinct hashes
pub fn write_many(ws: &Workspace, group: &str, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let sha1 = format!("{:040x}", i + 1);
            let name = format!("Title {i:03} (1993)");
            ws.write(
                &format!("{group}/Title {i:03}.dat"),
                &catalog(&name, &[("disk.adf", &sha1)]),
            )
        })
        .collect()
}

pub async fn sorted_rows(pipeline: &Pipeline) -> Vec<CandidateRow> {
    let mut rows = pipeline.destination().fetch_rows().await.unwrap();
    rows.sort();
    rows
}

/// Delegates to [`DatParser`] and counts calls per path
#[derive(Default)]
pub struct CountingParser {
    calls: Mutex<HashMap<PathBuf, u32>>,
}

impl CountingParser {
    pub fn calls(&self) -> HashMap<PathBuf, u32> {
        self.calls.lock().unwrap().clone()
    }

    pub fn total(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

impl FileParser for CountingParser {
    fn parse(&self, path: &Path) -> ParseOutcome {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default() += 1;
        DatParser::new().parse(path)
    }
}
