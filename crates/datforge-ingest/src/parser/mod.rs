//! Record parser: one DAT file in, flattened rows out
//!
//! The format is sniffed from the first kilobyte and the matching grammar
//! streams rows lazily. [`FileParser::parse`] wraps a stream into an
//! all-or-nothing [`ParseOutcome`]: any structural error discards the rows
//! and reports the failure instead.

pub mod cmp;
pub mod fields;
pub mod xml;

use crate::error::ParseError;
use crate::row::CandidateRow;
use cmp::CmpRows;
use fields::FileContext;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use xml::XmlRows;

const SNIFF_LEN: usize = 1024;
const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogFormat {
    Xml,
    Cmp,
    Unknown,
}

pub fn detect_format_bytes(head: &[u8]) -> CatalogFormat {
    let head = String::from_utf8_lossy(head).to_lowercase();
    let head = head.trim();

    if head.contains("<?xml") || head.contains("<datafile") || head.contains("<mame") {
        CatalogFormat::Xml
    } else if head.contains("clrmamepro") || head.contains("rom (") || head.contains("game (") {
        CatalogFormat::Cmp
    } else {
        CatalogFormat::Unknown
    }
}

pub fn detect_format(path: &Path) -> std::io::Result<CatalogFormat> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    File::open(path)?
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)?;
    Ok(detect_format_bytes(&head))
}

/// Lazy, fused, single-use row sequence for one file
pub enum RowStream {
    Xml(XmlRows<BufReader<File>>),
    Cmp(CmpRows<BufReader<File>>),
}

impl RowStream {
    pub fn rejected_entries(&self) -> usize {
        match self {
            RowStream::Xml(rows) => rows.rejected_entries(),
            RowStream::Cmp(rows) => rows.rejected_entries(),
        }
    }
}

impl Iterator for RowStream {
    type Item = Result<CandidateRow, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            RowStream::Xml(rows) => rows.next(),
            RowStream::Cmp(rows) => rows.next(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub rows: Vec<CandidateRow>,
    /// Individual rom entries skipped inside an otherwise valid file
    pub rejected_entries: usize,
}

#[derive(Debug)]
pub struct ParseFailure {
    pub path: PathBuf,
    pub error: ParseError,
}

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.error)
    }
}

/// Either every row of the file or the reason there are none
#[derive(Debug)]
pub enum ParseOutcome {
    Parsed(ParsedFile),
    Failed(ParseFailure),
}

impl ParseOutcome {
    pub fn rows(&self) -> &[CandidateRow] {
        match self {
            ParseOutcome::Parsed(parsed) => &parsed.rows,
            ParseOutcome::Failed(_) => &[],
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ParseOutcome::Failed(_))
    }
}

/// Seam between the pipeline and the DAT grammars
pub trait FileParser: Send + Sync + 'static {
    /// Read-only; never panics on bad input and never returns partial rows
    fn parse(&self, path: &Path) -> ParseOutcome;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DatParser;

impl DatParser {
    pub fn new() -> Self {
        Self
    }

    /// Open `path` and return its rows as a lazy stream
    pub fn stream(&self, path: &Path) -> Result<RowStream, ParseError> {
        let format = detect_format(path)?;
        let ctx = FileContext::from_path(path);
        let reader = BufReader::with_capacity(READ_BUFFER, File::open(path)?);

        match format {
            CatalogFormat::Xml => Ok(RowStream::Xml(XmlRows::new(reader, ctx, path))),
            CatalogFormat::Cmp => Ok(RowStream::Cmp(CmpRows::new(reader, ctx, path))),
            CatalogFormat::Unknown => Err(ParseError::UnknownFormat),
        }
    }
}

impl FileParser for DatParser {
    fn parse(&self, path: &Path) -> ParseOutcome {
        let fail = |error: ParseError| {
            ParseOutcome::Failed(ParseFailure {
                path: path.to_path_buf(),
                error,
            })
        };

        let mut stream = match self.stream(path) {
            Ok(stream) => stream,
            Err(e) => return fail(e),
        };

        let mut rows = Vec::new();
        for item in stream.by_ref() {
            match item {
                Ok(row) => rows.push(row),
                Err(e) => return fail(e),
            }
        }

        ParseOutcome::Parsed(ParsedFile {
            rows,
            rejected_entries: stream.rejected_entries(),
        })
    }
}
