//! Line-oriented reader for ClrMamePro (CMP) text catalogs
//!
//! ```text
//! game (
//!     name "Game A (1990)"
//!     description "Game A"
//!     rom ( name "a.bin" size 1024 crc 12345678 sha1 abc123 )
//! )
//! ```

use super::fields::{build_row, FileContext, GameFields, RomFields};
use crate::error::ParseError;
use crate::row::CandidateRow;
use regex::Regex;
use std::collections::VecDeque;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::LazyLock;

struct CmpPatterns {
    name: Regex,
    description: Regex,
    size: Regex,
    crc: Regex,
    md5: Regex,
    sha1: Regex,
    status: Regex,
    rom_open: Regex,
}

impl CmpPatterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            name: Regex::new(r#"(?i)\bname\s+"([^"]*)""#)?,
            description: Regex::new(r#"(?i)\bdescription\s+"([^"]*)""#)?,
            size: Regex::new(r"(?i)\bsize\s+([^\s()]+)")?,
            crc: Regex::new(r"(?i)\bcrc\s+([0-9a-f]+)")?,
            md5: Regex::new(r"(?i)\bmd5\s+([0-9a-f]+)")?,
            sha1: Regex::new(r"(?i)\bsha1\s+([0-9a-f]+)")?,
            status: Regex::new(r"(?i)\bstatus\s+(\w+)")?,
            rom_open: Regex::new(r"(?i)\brom\s*\(")?,
        })
    }

    /// Match against `masked` so keywords inside quoted names are ignored,
    /// then take the value from the real `line`
    fn capture(re: &Regex, masked: &str, line: &str) -> Option<String> {
        re.captures(masked)
            .and_then(|c| c.get(1))
            .map(|m| line[m.range()].to_string())
    }

    fn rom(&self, line: &str) -> RomFields {
        let masked = mask_quoted(line);
        RomFields {
            name: Self::capture(&self.name, &masked, line),
            size: Self::capture(&self.size, &masked, line),
            crc: Self::capture(&self.crc, &masked, line),
            md5: Self::capture(&self.md5, &masked, line),
            sha1: Self::capture(&self.sha1, &masked, line),
            status: Self::capture(&self.status, &masked, line),
        }
    }

    /// Game attributes and `rom ( .. )` groups written on the opening line
    fn opening_line(&self, line: &str) -> (GameFields, Vec<RomFields>) {
        let masked = mask_quoted(line);
        let mut outside = masked.clone();
        let mut roms = Vec::new();

        for group in self.rom_open.find_iter(&masked) {
            let end = closing_paren(&masked, group.end() - 1).unwrap_or(masked.len());
            roms.push(self.rom(&line[group.start()..end]));
            outside.replace_range(group.start()..end, &" ".repeat(end - group.start()));
        }

        let fields = GameFields {
            name: Self::capture(&self.name, &outside, line),
            description: Self::capture(&self.description, &outside, line),
        };
        (fields, roms)
    }
}

static PATTERNS: LazyLock<Result<CmpPatterns, regex::Error>> = LazyLock::new(CmpPatterns::compile);

fn patterns() -> Result<&'static CmpPatterns, ParseError> {
    PATTERNS
        .as_ref()
        .map_err(|e| ParseError::malformed(e.to_string()))
}

const GAME_OPENERS: &[&str] = &["game (", "resource (", "machine ("];

/// Value of `key "value"`, allowing quotes inside the value
fn quoted_value(line: &str) -> Option<String> {
    let start = line.find('"')?;
    let end = line.rfind('"')?;
    (end > start).then(|| line[start + 1..end].to_string())
}

/// `line` with every character inside quotes replaced by `_`, byte for byte
fn mask_quoted(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut quoted = false;
    for c in line.chars() {
        if c == '"' {
            quoted = !quoted;
            out.push(c);
        } else if quoted {
            out.extend(std::iter::repeat('_').take(c.len_utf8()));
        } else {
            out.push(c);
        }
    }
    out
}

/// End (exclusive) of the group whose `(` sits at `open`
fn closing_paren(masked: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in masked.bytes().enumerate().skip(open) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            },
            _ => {},
        }
    }
    None
}

/// Opened minus closed parentheses outside quotes
fn paren_balance(line: &str) -> isize {
    mask_quoted(line).bytes().fold(0, |depth, b| match b {
        b'(' => depth + 1,
        b')' => depth - 1,
        _ => depth,
    })
}

struct OpenGame {
    fields: GameFields,
    roms: Vec<RomFields>,
}

pub struct CmpRows<R: BufRead> {
    reader: R,
    line: String,
    line_no: usize,
    ctx: FileContext,
    path: PathBuf,
    depth: usize,
    game: Option<OpenGame>,
    ready: VecDeque<CandidateRow>,
    rejected: usize,
    finished: bool,
}

impl<R: BufRead> CmpRows<R> {
    pub fn new(reader: R, ctx: FileContext, path: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            line: String::new(),
            line_no: 0,
            ctx,
            path: path.into(),
            depth: 0,
            game: None,
            ready: VecDeque::new(),
            rejected: 0,
            finished: false,
        }
    }

    pub fn rejected_entries(&self) -> usize {
        self.rejected
    }

    fn read_line(&mut self) -> Result<bool, ParseError> {
        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) => Ok(false),
            Ok(_) => {
                self.line_no += 1;
                Ok(true)
            },
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(ParseError::encoding(format!(
                "line {} is not valid UTF-8",
                self.line_no + 1
            ))),
            Err(e) => Err(ParseError::Io(e)),
        }
    }

    /// Consume one line; `Ok(false)` at a clean end of file
    fn advance(&mut self) -> Result<bool, ParseError> {
        if !self.read_line()? {
            if self.depth > 0 {
                return Err(ParseError::truncated(format!(
                    "end of file inside an open block ({} unclosed)",
                    self.depth
                )));
            }
            return Ok(false);
        }

        let line = self.line.trim().to_string();
        if line.is_empty() {
            return Ok(true);
        }

        if line == ")" {
            if self.depth == 0 {
                return Err(ParseError::malformed(format!(
                    "unbalanced ')' on line {}",
                    self.line_no
                )));
            }
            self.depth -= 1;
            if self.depth == 0 {
                if let Some(game) = self.game.take() {
                    self.flush_game(game);
                }
            }
            return Ok(true);
        }

        if self.depth == 0 && GAME_OPENERS.iter().any(|p| line.starts_with(p)) {
            let (fields, roms) = patterns()?.opening_line(&line);
            let game = OpenGame { fields, roms };
            match paren_balance(&line) {
                depth if depth > 0 => {
                    self.depth = depth.unsigned_abs();
                    self.game = Some(game);
                },
                0 => self.flush_game(game),
                _ => {
                    return Err(ParseError::malformed(format!(
                        "unbalanced ')' on line {}",
                        self.line_no
                    )));
                },
            }
            return Ok(true);
        }

        if line.ends_with('(') {
            self.depth += 1;
            return Ok(true);
        }

        if self.depth == 1 {
            if let Some(game) = self.game.as_mut() {
                if line.starts_with("rom (") || line.starts_with("rom(") {
                    game.roms.push(patterns()?.rom(&line));
                } else if line.starts_with("name ") {
                    game.fields.name = quoted_value(&line);
                } else if line.starts_with("description ") {
                    game.fields.description = quoted_value(&line);
                }
            }
        }

        Ok(true)
    }

    fn flush_game(&mut self, game: OpenGame) {
        for rom in game.roms {
            match build_row(&self.ctx, &game.fields, rom) {
                Ok(row) => self.ready.push_back(row),
                Err(e) => {
                    self.rejected += 1;
                    tracing::warn!(
                        path = %self.path.display(),
                        line = self.line_no,
                        error = %e,
                        "Rejected rom entry"
                    );
                },
            }
        }
    }
}

impl<R: BufRead> Iterator for CmpRows<R> {
    type Item = Result<CandidateRow, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.ready.pop_front() {
                return Some(Ok(row));
            }
            if self.finished {
                return None;
            }
            match self.advance() {
                Ok(true) => {},
                Ok(false) => self.finished = true,
                Err(e) => {
                    self.finished = true;
                    self.ready.clear();
                    return Some(Err(e));
                },
            }
        }
    }
}

impl<R: BufRead> std::iter::FusedIterator for CmpRows<R> {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::Path;

    fn run(doc: &[u8]) -> (Vec<Result<CandidateRow, ParseError>>, usize) {
        let ctx = FileContext::from_path(Path::new("/dats/Spectrum/Sinclair ZX Spectrum - Games.dat"));
        let mut stream = CmpRows::new(Cursor::new(doc.to_vec()), ctx, "test.dat");
        let items: Vec<_> = stream.by_ref().collect();
        (items, stream.rejected_entries())
    }

    const SAMPLE: &str = r#"clrmamepro (
	name "Sinclair ZX Spectrum - Games"
	version 2023-08-15
)

game (
	name "Game A (1990)(Publisher)"
	description "Game A (1990)(Publisher)"
	rom ( name "Game A (1990)(Publisher).tzx" size 48912 crc 1A2B3C4D md5 0123456789ABCDEF0123456789ABCDEF sha1 ABC123 )
)

resource (
	name "Loader"
	rom ( name "loader.bin" size 0x100 status baddump )
	rom ( name "nameless" size lots )
)
"#;

    #[test]
    fn test_parses_games_and_resources() {
        let (items, rejected) = run(SAMPLE.as_bytes());
        let rows: Vec<_> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rejected, 1);

        assert_eq!(rows[0].item_title, "Game A (1990)(Publisher)");
        assert_eq!(rows[0].base_title, "Game A");
        assert_eq!(rows[0].release_year, Some(1990));
        assert_eq!(rows[0].item_filename, "Game A (1990)(Publisher).tzx");
        assert_eq!(rows[0].size, 48912);
        assert_eq!(rows[0].crc.as_deref(), Some("1a2b3c4d"));
        assert_eq!(rows[0].md5.as_deref(), Some("0123456789abcdef0123456789abcdef"));
        assert_eq!(rows[0].sha1.as_deref(), Some("abc123"));
        assert_eq!(rows[0].status, "good");
        assert_eq!(rows[0].group_label, "Spectrum");

        assert_eq!(rows[1].item_title, "Loader");
        assert_eq!(rows[1].description, "");
        assert_eq!(rows[1].size, 256);
        assert_eq!(rows[1].status, "baddump");
    }

    #[test]
    fn test_game_without_name_uses_default_title() {
        let doc = b"game (\n\trom ( name \"x.bin\" size 1 )\n)\n";
        let (items, _) = run(doc);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().item_title, "Unknown");
    }

    #[test]
    fn test_eof_inside_block_is_truncation() {
        let doc = b"game (\n\tname \"G\"\n\trom ( name \"a\" size 1 )\n";
        let (items, _) = run(doc);
        assert!(matches!(items.as_slice(), [Err(ParseError::Truncated(_))]));
    }

    #[test]
    fn test_invalid_utf8_is_an_encoding_failure() {
        let mut doc = b"game (\n\tname \"G".to_vec();
        doc.extend_from_slice(&[0xff, 0xfe]);
        doc.extend_from_slice(b"\"\n)\n");
        let (items, _) = run(&doc);
        assert!(matches!(items.as_slice(), [Err(ParseError::Encoding(_))]));
    }

    #[test]
    fn test_stray_close_is_malformed() {
        let (items, _) = run(b")\n");
        assert!(matches!(items.as_slice(), [Err(ParseError::Malformed(_))]));
    }

    #[test]
    fn test_single_line_block_is_closed() {
        let doc = concat!(
            "game ( name \"Game B (1987)\" rom ( name \"b.bin\" size 2 crc 0B ) )\n",
            "game (\n\tname \"Game C\"\n\trom ( name \"c.bin\" size 3 crc 0C )\n)\n",
        );
        let (items, rejected) = run(doc.as_bytes());
        let rows: Vec<_> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(rejected, 0);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].item_title, "Game B (1987)");
        assert_eq!(rows[0].release_year, Some(1987));
        assert_eq!(rows[0].item_filename, "b.bin");
        assert_eq!(rows[0].size, 2);
        assert_eq!(rows[1].item_title, "Game C");
        assert_eq!(rows[1].crc.as_deref(), Some("0c"));
    }

    #[test]
    fn test_keywords_inside_quoted_names_are_ignored() {
        let doc = b"game (\n\tname \"G\"\n\trom ( name \"a size 9 crc ff.bin\" size 1 crc 0A )\n)\n";
        let (items, _) = run(doc);
        let row = items[0].as_ref().unwrap();
        assert_eq!(row.item_filename, "a size 9 crc ff.bin");
        assert_eq!(row.size, 1);
        assert_eq!(row.crc.as_deref(), Some("0a"));
    }

    #[test]
    fn test_single_line_block_with_extra_close_is_malformed() {
        let (items, _) = run(b"game ( name \"G\" ) )\n");
        assert!(matches!(items.as_slice(), [Err(ParseError::Malformed(_))]));
    }

    #[test]
    fn test_mask_keeps_byte_offsets() {
        let line = r#"rom ( name "é size" size 4 )"#;
        let masked = mask_quoted(line);
        assert_eq!(masked.len(), line.len());
        assert!(!masked.contains("size\""));
        assert_eq!(paren_balance(r#"game ( name "a (b" )"#), 0);
    }

    #[test]
    fn test_quoted_value_keeps_inner_quotes() {
        assert_eq!(quoted_value(r#"name "He said "hi"""#), Some(r#"He said "hi""#.to_string()));
        assert_eq!(quoted_value("name bare"), None);
    }
}
