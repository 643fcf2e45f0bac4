//! Field derivation shared by the XML and CMP grammars

use crate::row::{CandidateRow, DEFAULT_CATEGORY, DEFAULT_STATUS, DEFAULT_TITLE};
use crate::source::group_label;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;

static RELEASE_YEAR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\((\d{4})\)").ok());

/// A single rom entry that cannot become a row; the file still succeeds
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntryError {
    #[error("rom entry has no name")]
    MissingName,

    #[error("unparsable size '{0}'")]
    InvalidSize(String),
}

/// Per-file values stamped on every row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContext {
    pub source_id: String,
    pub group_label: String,
    pub platform: String,
    pub category: String,
}

impl FileContext {
    /// `Commodore Amiga - Games - [ADF] (TOSEC-v2023).dat` gives platform
    /// `Commodore Amiga` and category `Games - [ADF]`.
    pub fn from_path(path: &Path) -> Self {
        let source_id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let stem = match source_id.rsplit_once('.') {
            Some((stem, _)) => stem,
            None => source_id.as_str(),
        };
        let stem = match stem.find("(TOSEC") {
            Some(idx) => stem[..idx].trim(),
            None => stem,
        };

        let (platform, category) = match stem.split_once(" - ") {
            Some((platform, category)) => (platform.trim(), category.trim()),
            None => (stem.trim(), DEFAULT_CATEGORY),
        };

        Self {
            platform: platform.to_string(),
            category: category.to_string(),
            group_label: group_label(path),
            source_id,
        }
    }
}

/// Game-level values collected before its roms are flattened
#[derive(Debug, Clone, Default)]
pub struct GameFields {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Raw rom attributes as found in the document
#[derive(Debug, Clone, Default)]
pub struct RomFields {
    pub name: Option<String>,
    pub size: Option<String>,
    pub crc: Option<String>,
    pub md5: Option<String>,
    pub sha1: Option<String>,
    pub status: Option<String>,
}

/// `Dragonstone (1994)(Core)(Disk 1 of 4)` -> (`Dragonstone`, Some(1994))
pub fn split_title(name: &str) -> (String, Option<i32>) {
    if name.trim().is_empty() {
        return (DEFAULT_TITLE.to_string(), None);
    }

    let title = match name.find('(') {
        Some(idx) => name[..idx].trim(),
        None => name.trim(),
    };

    let year = RELEASE_YEAR
        .as_ref()
        .and_then(|re| re.captures(name))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok());

    (title.to_string(), year)
}

/// Size attribute as written by assorted DAT tools
///
/// Empty means 0; `0x`/`$` prefixes are hexadecimal; otherwise the first run
/// of digits, scaled by a `k`/`m`/`g` unit when present.
pub fn parse_size(raw: Option<&str>) -> Result<u64, EntryError> {
    let Some(raw) = raw else {
        return Ok(0);
    };
    let s = raw.trim().to_lowercase();
    if s.is_empty() {
        return Ok(0);
    }
    let invalid = || EntryError::InvalidSize(raw.to_string());

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix('$')) {
        return u64::from_str_radix(hex, 16).map_err(|_| invalid());
    }

    let has_unit = |unit: char| {
        let short = format!("{} ", unit);
        let long = format!("{}b", unit);
        s.contains(&long) || s.contains(&short) || s.ends_with(unit)
    };
    let multiplier: u64 = if has_unit('k') {
        1 << 10
    } else if has_unit('m') {
        1 << 20
    } else if has_unit('g') {
        1 << 30
    } else {
        1
    };

    let digits: String = s
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return Err(invalid());
    }

    digits
        .parse::<u64>()
        .ok()
        .and_then(|v| v.checked_mul(multiplier))
        .ok_or_else(invalid)
}

fn normalize_hash(raw: Option<String>) -> Option<String> {
    raw.map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
}

/// Flatten one rom with its game and file context
pub fn build_row(
    ctx: &FileContext,
    game: &GameFields,
    rom: RomFields,
) -> Result<CandidateRow, EntryError> {
    let item_filename = rom
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or(EntryError::MissingName)?;
    let size = parse_size(rom.size.as_deref())?;

    let item_title = game
        .name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string());
    let (base_title, release_year) = split_title(&item_title);

    Ok(CandidateRow {
        source_id: ctx.source_id.clone(),
        group_label: ctx.group_label.clone(),
        platform: ctx.platform.clone(),
        category: ctx.category.clone(),
        item_title,
        base_title,
        release_year,
        description: game.description.clone().unwrap_or_default(),
        item_filename,
        size,
        crc: normalize_hash(rom.crc),
        md5: normalize_hash(rom.md5),
        sha1: normalize_hash(rom.sha1),
        status: rom
            .status
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_STATUS.to_string()),
    })
}
