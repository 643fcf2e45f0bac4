//! The flattened destination record

use serde::{Deserialize, Serialize};

pub const DEFAULT_STATUS: &str = "good";
pub const DEFAULT_TITLE: &str = "Unknown";
pub const DEFAULT_CATEGORY: &str = "Standard";

/// One rom entry flattened together with its game and catalog context
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateRow {
    /// DAT file name the row came from
    pub source_id: String,
    /// Parent directory of the DAT file
    pub group_label: String,
    pub platform: String,
    pub category: String,
    /// Full game name, e.g. `Dragonstone (1994)(Core)(Disk 1 of 4)`
    pub item_title: String,
    /// Game name up to the first parenthesis
    pub base_title: String,
    pub release_year: Option<i32>,
    pub description: String,
    pub item_filename: String,
    pub size: u64,
    pub crc: Option<String>,
    pub md5: Option<String>,
    pub sha1: Option<String>,
    pub status: String,
}

impl CandidateRow {
    /// Strongest hash present: sha1, then md5, then crc
    pub fn primary_hash(&self) -> &str {
        self.sha1
            .as_deref()
            .or(self.md5.as_deref())
            .or(self.crc.as_deref())
            .unwrap_or("")
    }
}
