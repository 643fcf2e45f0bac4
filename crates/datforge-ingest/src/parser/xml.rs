//! Streaming reader for Logiqx-style XML catalogs (`<datafile>`, `<mame>`)
//!
//! Rows of one `<game>`/`<machine>` are released when its end tag is seen,
//! so memory is bounded by the largest single game.

use super::fields::{build_row, FileContext, GameFields, RomFields};
use crate::error::ParseError;
use crate::row::CandidateRow;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::VecDeque;
use std::io::BufRead;
use std::path::PathBuf;

struct OpenGame {
    depth: usize,
    fields: GameFields,
    in_description: bool,
    roms: Vec<RomFields>,
}

pub struct XmlRows<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    ctx: FileContext,
    path: PathBuf,
    depth: usize,
    saw_root: bool,
    game: Option<OpenGame>,
    ready: VecDeque<CandidateRow>,
    rejected: usize,
    finished: bool,
}

fn is_game(name: &[u8]) -> bool {
    name == b"game" || name == b"machine"
}

impl<R: BufRead> XmlRows<R> {
    pub fn new(source: R, ctx: FileContext, path: impl Into<PathBuf>) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.config_mut().trim_text(true);

        Self {
            reader,
            buf: Vec::with_capacity(4096),
            ctx,
            path: path.into(),
            depth: 0,
            saw_root: false,
            game: None,
            ready: VecDeque::new(),
            rejected: 0,
            finished: false,
        }
    }

    pub fn rejected_entries(&self) -> usize {
        self.rejected
    }

    fn attr(element: &BytesStart<'_>, key: &str) -> Result<Option<String>, ParseError> {
        let attr = element
            .try_get_attribute(key)
            .map_err(|e| ParseError::malformed(e.to_string()))?;
        match attr {
            Some(attr) => {
                let value = attr
                    .unescape_value()
                    .map_err(|e| ParseError::encoding(e.to_string()))?;
                Ok(Some(value.into_owned()))
            },
            None => Ok(None),
        }
    }

    fn rom_fields(element: &BytesStart<'_>) -> Result<RomFields, ParseError> {
        Ok(RomFields {
            name: Self::attr(element, "name")?,
            size: Self::attr(element, "size")?,
            crc: Self::attr(element, "crc")?,
            md5: Self::attr(element, "md5")?,
            sha1: Self::attr(element, "sha1")?,
            status: Self::attr(element, "status")?,
        })
    }

    /// Handles `<x>` and `<x/>`; only the former increases depth
    fn open(&mut self, element: &BytesStart<'_>, has_children: bool) -> Result<(), ParseError> {
        self.saw_root = true;
        if has_children {
            self.depth += 1;
        }
        let element_depth = if has_children { self.depth } else { self.depth + 1 };
        let local = element.local_name();
        let name = local.as_ref();

        match self.game.as_mut() {
            None if is_game(name) => {
                let game_name = Self::attr(element, "name")?;
                if has_children {
                    self.game = Some(OpenGame {
                        depth: element_depth,
                        fields: GameFields {
                            name: game_name,
                            description: None,
                        },
                        in_description: false,
                        roms: Vec::new(),
                    });
                }
            },
            Some(game) if element_depth == game.depth + 1 => {
                if name == b"rom" {
                    let rom = Self::rom_fields(element)?;
                    game.roms.push(rom);
                } else if name == b"description" {
                    game.fields.description.get_or_insert_with(String::new);
                    game.in_description = has_children;
                }
            },
            _ => {},
        }

        Ok(())
    }

    fn close(&mut self, name: &[u8]) -> Result<(), ParseError> {
        if self.depth == 0 {
            return Err(ParseError::malformed("closing tag without an open element"));
        }

        let closes_game = matches!(&self.game, Some(g) if g.depth == self.depth && is_game(name));
        if let Some(game) = self.game.as_mut() {
            if game.in_description && name == b"description" {
                game.in_description = false;
            }
        }
        if closes_game {
            if let Some(game) = self.game.take() {
                self.flush_game(game);
            }
        }

        self.depth -= 1;
        Ok(())
    }

    fn flush_game(&mut self, game: OpenGame) {
        for rom in game.roms {
            match build_row(&self.ctx, &game.fields, rom) {
                Ok(row) => self.ready.push_back(row),
                Err(e) => {
                    self.rejected += 1;
                    tracing::warn!(
                        path = %self.path.display(),
                        game = game.fields.name.as_deref().unwrap_or("?"),
                        error = %e,
                        "Rejected rom entry"
                    );
                },
            }
        }
    }

    fn append_description(&mut self, text: &str) {
        if let Some(game) = self.game.as_mut() {
            if game.in_description {
                game.fields
                    .description
                    .get_or_insert_with(String::new)
                    .push_str(text);
            }
        }
    }

    /// Consume one event; `Ok(false)` at a clean end of document
    fn advance(&mut self) -> Result<bool, ParseError> {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let result = self.handle_next(&mut buf);
        self.buf = buf;
        result
    }

    fn handle_next(&mut self, buf: &mut Vec<u8>) -> Result<bool, ParseError> {
        let event = self.reader.read_event_into(buf).map_err(map_xml_error)?;

        match event {
            Event::Start(e) => self.open(&e, true)?,
            Event::Empty(e) => self.open(&e, false)?,
            Event::End(e) => {
                let local = e.local_name();
                self.close(local.as_ref())?;
            },
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| ParseError::encoding(e.to_string()))?;
                self.append_description(&text);
            },
            Event::CData(c) => {
                let text = std::str::from_utf8(c.as_ref())
                    .map_err(|e| ParseError::encoding(e.to_string()))?
                    .to_string();
                self.append_description(&text);
            },
            Event::Eof => {
                if self.depth > 0 {
                    return Err(ParseError::truncated(format!(
                        "document ended with {} open element(s)",
                        self.depth
                    )));
                }
                if !self.saw_root {
                    return Err(ParseError::malformed("document has no root element"));
                }
                return Ok(false);
            },
            _ => {},
        }

        Ok(true)
    }
}

fn map_xml_error(error: quick_xml::Error) -> ParseError {
    match error {
        quick_xml::Error::Io(e) => ParseError::Io(std::io::Error::new(e.kind(), e.to_string())),
        // every syntax error quick-xml reports is an unclosed construct at end of input
        quick_xml::Error::Syntax(e) => ParseError::truncated(e.to_string()),
        other => ParseError::malformed(other.to_string()),
    }
}

impl<R: BufRead> Iterator for XmlRows<R> {
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

impl<R: BufRead> std::iter::FusedIterator for XmlRows<R> {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::Path;

    fn rows(doc: &str) -> (Vec<Result<CandidateRow, ParseError>>, usize) {
        let ctx = FileContext::from_path(Path::new("/dats/Amiga/Commodore Amiga - Games.dat"));
        let mut stream = XmlRows::new(Cursor::new(doc.as_bytes().to_vec()), ctx, "test.dat");
        let items: Vec<_> = stream.by_ref().collect();
        (items, stream.rejected_entries())
    }

    #[test]
    fn test_parses_games_and_machines() {
        let doc = r#"<?xml version="1.0"?>
<!DOCTYPE datafile PUBLIC "-//Logiqx//DTD ROM Management Datafile//EN" "http://www.logiqx.com/Dats/datafile.dtd">
<datafile>
  <header><name>Commodore Amiga - Games</name></header>
  <game name="Dragonstone (1994)(Core)">
    <description>Dragonstone &amp; friends</description>
    <rom name="disk1.adf" size="901120" crc="ABCD1234" md5="M" sha1="S1" status="verified"/>
    <rom name="disk2.adf" size="0x10"/>
  </game>
  <machine name="pacman">
    <rom name="pacman.6e" size="4096" crc="c1e6ab10"/>
  </machine>
</datafile>"#;

        let (items, rejected) = rows(doc);
        let rows: Vec<_> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(rejected, 0);
        assert_eq!(rows.len(), 3);

        assert_eq!(rows[0].item_title, "Dragonstone (1994)(Core)");
        assert_eq!(rows[0].base_title, "Dragonstone");
        assert_eq!(rows[0].release_year, Some(1994));
        assert_eq!(rows[0].description, "Dragonstone & friends");
        assert_eq!(rows[0].crc.as_deref(), Some("abcd1234"));
        assert_eq!(rows[0].status, "verified");
        assert_eq!(rows[0].platform, "Commodore Amiga");
        assert_eq!(rows[0].category, "Games");
        assert_eq!(rows[0].group_label, "Amiga");

        assert_eq!(rows[1].size, 16);
        assert_eq!(rows[1].status, "good");
        assert_eq!(rows[2].item_title, "pacman");
        assert_eq!(rows[2].description, "");
    }

    #[test]
    fn test_rejected_entries_do_not_fail_the_file() {
        let doc = r#"<datafile>
  <game name="G"><rom size="1"/><rom name="bad" size="0xZZ"/><rom name="ok" size="2"/></game>
</datafile>"#;
        let (items, rejected) = rows(doc);
        assert_eq!(rejected, 2);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().item_filename, "ok");
    }

    #[test]
    fn test_truncated_document_fails() {
        let doc = r#"<datafile><game name="G"><rom name="a" size="1"/></game><game name="H">"#;
        let (items, _) = rows(doc);
        // the completed game streams out before the error ends the sequence
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(ParseError::Truncated(_))));
    }

    #[test]
    fn test_truncated_inside_tag_fails() {
        let doc = r#"<datafile><game name="G"><rom name="a"#;
        let (items, _) = rows(doc);
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[test]
    fn test_mismatched_tags_fail() {
        let (items, _) = rows("<datafile><game name=\"G\"></datafile>");
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[test]
    fn test_empty_input_is_malformed() {
        let (items, _) = rows("");
        assert!(matches!(items.as_slice(), [Err(ParseError::Malformed(_))]));
    }

    #[test]
    fn test_empty_catalog_is_valid() {
        let (items, rejected) = rows("<?xml version=\"1.0\"?><datafile/>");
        assert!(items.is_empty());
        assert_eq!(rejected, 0);
    }
}
