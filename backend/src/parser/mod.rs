//! Streaming XML record reader.
//!
//! Pulls events from any [`BufRead`] with `quick_xml` and yields one owned
//! [`Element`] per record boundary. Only the subtree of the record being
//! read is materialized; everything outside a record is tracked by name only
//! so that tag balance can be checked.
//!
//! # Example
//! ```ignore
//! use xml2csv::parser::{RecordReader, RecordSelector};
//!
//! let xml = "<Items><Item><A>1</A></Item><Item><A>2</A></Item></Items>";
//! let reader = RecordReader::new(xml.as_bytes(), RecordSelector::tag("Item"));
//! assert_eq!(reader.count(), 2);
//! ```

pub mod preview;

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::BufRead;

use crate::error::{ParseError, ParseResult};
use crate::models::{normalize_text, Element};

pub use preview::{preview_reader, Preview};

/// Default maximum element nesting depth.
pub const DEFAULT_MAX_DEPTH: usize = 512;

/// Which elements are records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSelector {
    /// Outermost elements whose tag equals this name.
    Tag(String),
    /// The first element to complete that has attributes or children.
    /// Yields at most one record.
    FirstStructured,
}

impl RecordSelector {
    pub fn tag(name: impl Into<String>) -> Self {
        Self::Tag(name.into())
    }

    /// `Tag` when a name is given, `FirstStructured` otherwise.
    pub fn from_option(tag: Option<&str>) -> Self {
        match tag {
            Some(t) => Self::tag(t),
            None => Self::FirstStructured,
        }
    }
}

/// Element under construction.
#[derive(Debug)]
struct ElementBuilder {
    tag: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl ElementBuilder {
    fn new(tag: String, attributes: Vec<(String, String)>) -> Self {
        Self {
            tag,
            attributes,
            text: String::new(),
            children: Vec::new(),
        }
    }

    fn finish(self) -> Element {
        Element {
            tag: self.tag,
            attributes: self.attributes,
            text: normalize_text(&self.text),
            children: self.children,
        }
    }
}

/// Owned copy of the event data we act on, so the event buffer can be
/// released before the event is handled.
enum ParsedEvent {
    Start { name: String, attrs: Vec<(String, String)> },
    Empty { name: String, attrs: Vec<(String, String)> },
    End { name: String },
    Text(String),
    Eof,
    Skip,
}

/// Iterator over the records of an XML document.
///
/// Yields `Ok(Element)` per completed record. The first error ends the
/// iteration.
pub struct RecordReader<R: BufRead> {
    reader: Reader<R>,
    selector: RecordSelector,
    buf: Vec<u8>,
    /// Names of every open element, root first.
    open: Vec<String>,
    /// Builders for the open elements that belong to the current record
    /// (tag mode), or for every open element (first-structured mode).
    building: Vec<ElementBuilder>,
    max_depth: usize,
    records: usize,
    finished: bool,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(input: R, selector: RecordSelector) -> Self {
        let mut reader = Reader::from_reader(input);
        let config = reader.config_mut();
        config.trim_text(false);
        // Tag balance is checked here so errors carry record context.
        config.check_end_names = false;

        Self {
            reader,
            selector,
            buf: Vec::with_capacity(8192),
            open: Vec::new(),
            building: Vec::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            records: 0,
            finished: false,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Records yielded so far.
    pub fn records_read(&self) -> usize {
        self.records
    }

    /// Bytes consumed from the input so far.
    pub fn position(&self) -> u64 {
        self.reader.buffer_position() as u64
    }

    /// Give back the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }

    fn capturing(&self) -> bool {
        match self.selector {
            RecordSelector::Tag(_) => !self.building.is_empty(),
            RecordSelector::FirstStructured => true,
        }
    }

    fn read_event(&mut self) -> ParseResult<ParsedEvent> {
        self.buf.clear();
        let offset = Self::position(self);
        let record = self.records;

        let event = self.reader.read_event_into(&mut self.buf).map_err(|e| match e {
            quick_xml::Error::Io(source) => ParseError::Io {
                offset,
                record,
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            quick_xml::Error::Syntax(syntax) if !matches!(syntax, SyntaxError::InvalidBangMarkup) => {
                ParseError::UnclosedMarkup {
                    offset,
                    record,
                    message: syntax.to_string(),
                }
            }
            other => ParseError::Xml {
                offset,
                record,
                message: other.to_string(),
            },
        })?;

        let parsed = match event {
            Event::Start(ref e) => ParsedEvent::Start {
                name: element_name(e, offset, record)?,
                attrs: extract_attrs(e, offset, record)?,
            },
            Event::Empty(ref e) => ParsedEvent::Empty {
                name: element_name(e, offset, record)?,
                attrs: extract_attrs(e, offset, record)?,
            },
            Event::End(ref e) => ParsedEvent::End {
                name: std::str::from_utf8(e.name().as_ref())
                    .map_err(|_| ParseError::Utf8 { offset, record })?
                    .to_string(),
            },
            Event::Text(ref e) => {
                let text = e.unescape().map_err(|err| ParseError::Xml {
                    offset,
                    record,
                    message: err.to_string(),
                })?;
                ParsedEvent::Text(text.into_owned())
            }
            Event::CData(ref e) => {
                let text = std::str::from_utf8(e).map_err(|_| ParseError::Utf8 { offset, record })?;
                ParsedEvent::Text(text.to_string())
            }
            Event::Eof => ParsedEvent::Eof,
            _ => ParsedEvent::Skip,
        };

        Ok(parsed)
    }

    fn handle_start(&mut self, name: String, attrs: Vec<(String, String)>) -> ParseResult<()> {
        if self.open.len() >= self.max_depth {
            return Err(ParseError::DepthExceeded {
                offset: Self::position(self),
                record: self.records,
                max_depth: self.max_depth,
            });
        }

        let starts_record = match &self.selector {
            RecordSelector::Tag(tag) => self.building.is_empty() && *tag == name,
            RecordSelector::FirstStructured => true,
        };

        if starts_record || self.capturing() {
            self.building.push(ElementBuilder::new(name.clone(), attrs));
        }
        self.open.push(name);
        Ok(())
    }

    /// Close the innermost element. Returns a record when one completes.
    fn handle_end(&mut self, name: &str) -> ParseResult<Option<Element>> {
        match self.open.last() {
            None => {
                return Err(ParseError::UnexpectedEndTag {
                    offset: Self::position(self),
                    record: self.records,
                    found: name.to_string(),
                })
            }
            Some(expected) if expected != name => {
                return Err(ParseError::MismatchedEndTag {
                    offset: Self::position(self),
                    record: self.records,
                    expected: expected.clone(),
                    found: name.to_string(),
                })
            }
            Some(_) => {}
        }

        let capturing = self.capturing();
        self.open.pop();
        if !capturing {
            return Ok(None);
        }

        let Some(builder) = self.building.pop() else {
            return Ok(None);
        };
        let element = builder.finish();

        let completes_record = match self.selector {
            RecordSelector::Tag(_) => self.building.is_empty(),
            RecordSelector::FirstStructured => element.is_structured(),
        };

        if completes_record {
            return Ok(Some(element));
        }

        if let Some(parent) = self.building.last_mut() {
            parent.children.push(element);
        }
        Ok(None)
    }

    fn handle_text(&mut self, text: &str) {
        if !self.capturing() {
            return;
        }
        if let Some(current) = self.building.last_mut() {
            current.text.push_str(text);
        }
    }

    fn next_record(&mut self) -> ParseResult<Option<Element>> {
        loop {
            match self.read_event()? {
                ParsedEvent::Start { name, attrs } => self.handle_start(name, attrs)?,
                ParsedEvent::Empty { name, attrs } => {
                    self.handle_start(name.clone(), attrs)?;
                    if let Some(record) = self.handle_end(&name)? {
                        return Ok(Some(record));
                    }
                }
                ParsedEvent::End { name } => {
                    if let Some(record) = self.handle_end(&name)? {
                        return Ok(Some(record));
                    }
                }
                ParsedEvent::Text(text) => self.handle_text(&text),
                ParsedEvent::Skip => {}
                ParsedEvent::Eof => {
                    if let Some(innermost) = self.open.last() {
                        return Err(ParseError::UnclosedElements {
                            offset: Self::position(self),
                            record: self.records,
                            open: self.open.len(),
                            innermost: innermost.clone(),
                        });
                    }
                    return Ok(None);
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = ParseResult<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.next_record() {
            Ok(Some(element)) => {
                self.records += 1;
                if self.selector == RecordSelector::FirstStructured {
                    self.finished = true;
                    self.building.clear();
                }
                Some(Ok(element))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                self.building.clear();
                Some(Err(e))
            }
        }
    }
}

fn element_name(e: &BytesStart<'_>, offset: u64, record: usize) -> ParseResult<String> {
    std::str::from_utf8(e.name().as_ref())
        .map(str::to_string)
        .map_err(|_| ParseError::Utf8 { offset, record })
}

/// Attributes as owned `(name, unescaped value)` pairs.
fn extract_attrs(e: &BytesStart<'_>, offset: u64, record: usize) -> ParseResult<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ParseError::Xml {
            offset,
            record,
            message: err.to_string(),
        })?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|_| ParseError::Utf8 { offset, record })?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|err| ParseError::Xml {
                offset,
                record,
                message: err.to_string(),
            })?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(attrs)
}
