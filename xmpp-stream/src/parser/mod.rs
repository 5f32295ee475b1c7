// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Incremental, namespace-aware XML tokenizer.
//!
//! [`XmlParser`] accepts input in chunks of any size. Bytes which do not
//! yet form a complete syntactic unit (a tag, a comment, a run of
//! character data up to the next `<`) stay in an internal buffer until a
//! later [`XmlParser::feed`] supplies the rest. Since events are only
//! produced for complete units, the sequence of events is independent of
//! how the input was split.
//!
//! Multi-byte UTF-8 sequences never contain the ASCII delimiters the
//! tokenizer looks for, so a sequence split across chunks is simply carried
//! over with the rest of its unit.

use bytes::BytesMut;

use crate::ns;

mod error;

pub use error::{ParseError, ParseErrorKind};

/// Default upper bound on the size of a single buffered syntactic unit.
pub const DEFAULT_MAX_BUFFER: usize = 4 * 1024 * 1024;

/// An event produced by the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseEvent {
    /// An element was opened.
    StartElement {
        /// Local name
        name: String,
        /// Resolved namespace URI, empty when none is in scope
        namespace: String,
        /// Attributes in document order, keyed as described on
        /// [`crate::node::Node::attr`]
        attributes: Vec<(String, String)>,
    },
    /// The most recently opened element was closed.
    EndElement,
    /// Character data, with references resolved.
    CharacterData(String),
}

impl ParseEvent {
    /// The `"{namespace} {localname}"` string of a start event.
    pub fn qualified_name(&self) -> Option<String> {
        match self {
            ParseEvent::StartElement {
                name, namespace, ..
            } => Some(format!("{} {}", namespace, name)),
            _ => None,
        }
    }
}

struct Scope {
    raw_name: String,
    declarations: Vec<(Option<String>, String)>,
}

enum Unit {
    Tag,
    Comment,
    Cdata,
    ProcessingInstruction,
}

/// Incremental XML parser state for one stream.
pub struct XmlParser {
    buf: BytesMut,
    // position in `buf` up to which no terminator has been found
    scan: usize,
    quote: Option<u8>,
    scopes: Vec<Scope>,
    offset: u64,
    max_buffer: usize,
    dead: bool,
}

impl Default for XmlParser {
    fn default() -> Self {
        XmlParser::new()
    }
}

impl XmlParser {
    /// Create a parser with the default buffer limit.
    pub fn new() -> XmlParser {
        XmlParser::with_limit(DEFAULT_MAX_BUFFER)
    }

    /// Create a parser which rejects syntactic units larger than
    /// `max_buffer` bytes.
    pub fn with_limit(max_buffer: usize) -> XmlParser {
        XmlParser {
            buf: BytesMut::new(),
            scan: 0,
            quote: None,
            scopes: Vec::new(),
            offset: 0,
            max_buffer,
            dead: false,
        }
    }

    /// Number of currently open elements.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Whether a previous error has made the parser unusable.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Number of bytes received but not yet turned into events.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Whether anything besides whitespace is buffered.
    pub fn has_pending_data(&self) -> bool {
        self.buf.iter().any(|b| !b.is_ascii_whitespace())
    }

    /// Feed a chunk of input, appending the events it completes to
    /// `events`.
    ///
    /// Events produced before an error are kept in `events`. After an
    /// error the parser is dead and silently drops further input.
    pub fn feed(&mut self, data: &[u8], events: &mut Vec<ParseEvent>) -> Result<(), ParseError> {
        if self.dead {
            log::debug!("Dropping {} bytes fed to dead parser", data.len());
            return Ok(());
        }
        self.buf.extend_from_slice(data);
        let result = self.drain(events);
        if result.is_err() {
            self.dead = true;
            self.buf.clear();
        }
        result
    }

    fn error(&self, kind: ParseErrorKind) -> ParseError {
        ParseError::new(kind, self.offset)
    }

    fn drain(&mut self, events: &mut Vec<ParseEvent>) -> Result<(), ParseError> {
        while !self.buf.is_empty() {
            if self.buf[0] == b'<' {
                let Some((unit, end)) = self.find_markup_end()? else {
                    break;
                };
                let data = self.buf.split_to(end);
                self.scan = 0;
                self.quote = None;
                let result = self.handle_markup(unit, &data, events);
                self.offset += end as u64;
                result?;
            } else {
                let Some(pos) = self.buf[self.scan..].iter().position(|b| *b == b'<') else {
                    self.scan = self.buf.len();
                    break;
                };
                let end = self.scan + pos;
                let data = self.buf.split_to(end);
                self.scan = 0;
                let result = self.handle_text(&data, events);
                self.offset += end as u64;
                result?;
            }
        }
        if self.buf.len() > self.max_buffer {
            return Err(self.error(ParseErrorKind::BufferLimitExceeded(self.max_buffer)));
        }
        Ok(())
    }

    /// Classify the markup at the start of the buffer and find its end.
    ///
    /// Returns `None` if the unit is not complete yet.
    fn find_markup_end(&mut self) -> Result<Option<(Unit, usize)>, ParseError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        match self.buf[1] {
            b'?' => Ok(self
                .find_terminator(2, b"?>")
                .map(|end| (Unit::ProcessingInstruction, end))),
            b'!' => {
                const COMMENT: &[u8] = b"<!--";
                const CDATA: &[u8] = b"<![CDATA[";
                const DOCTYPE: &[u8] = b"<!DOCTYPE";
                if self.buf.starts_with(COMMENT) {
                    Ok(self
                        .find_terminator(COMMENT.len(), b"-->")
                        .map(|end| (Unit::Comment, end)))
                } else if self.buf.starts_with(CDATA) {
                    Ok(self
                        .find_terminator(CDATA.len(), b"]]>")
                        .map(|end| (Unit::Cdata, end)))
                } else if COMMENT.starts_with(&self.buf) || CDATA.starts_with(&self.buf) {
                    Ok(None)
                } else if self.buf.starts_with(DOCTYPE) || DOCTYPE.starts_with(&self.buf) {
                    Err(self.error(ParseErrorKind::DoctypeForbidden))
                } else {
                    Err(self.error(ParseErrorKind::UnsupportedDeclaration))
                }
            }
            _ => {
                let start = self.scan.max(1);
                let mut quote = self.quote;
                for (i, b) in self.buf[start..].iter().enumerate() {
                    match (quote, *b) {
                        (None, b'"') | (None, b'\'') => quote = Some(*b),
                        (None, b'>') => return Ok(Some((Unit::Tag, start + i + 1))),
                        (Some(q), b) if q == b => quote = None,
                        _ => (),
                    }
                }
                self.quote = quote;
                self.scan = self.buf.len();
                Ok(None)
            }
        }
    }

    /// Look for `terminator` at or after `min_start`, resuming where the
    /// previous search stopped. Returns the end of the unit.
    fn find_terminator(&mut self, min_start: usize, terminator: &[u8]) -> Option<usize> {
        let start = self
            .scan
            .saturating_sub(terminator.len() - 1)
            .max(min_start);
        match self.buf[start..]
            .windows(terminator.len())
            .position(|w| w == terminator)
        {
            Some(pos) => Some(start + pos + terminator.len()),
            None => {
                self.scan = self.buf.len();
                None
            }
        }
    }

    fn decode<'a>(&self, data: &'a [u8]) -> Result<&'a str, ParseError> {
        std::str::from_utf8(data).map_err(|_| self.error(ParseErrorKind::InvalidUtf8))
    }

    fn handle_text(&mut self, data: &[u8], events: &mut Vec<ParseEvent>) -> Result<(), ParseError> {
        let raw = self.decode(data)?;
        if self.scopes.is_empty() {
            if raw.bytes().all(|b| b.is_ascii_whitespace()) {
                return Ok(());
            }
            return Err(self.error(ParseErrorKind::TextOutsideElement));
        }
        let text = normalize_line_endings(raw);
        let text = resolve_references(&text).map_err(|kind| self.error(kind))?;
        if !text.is_empty() {
            events.push(ParseEvent::CharacterData(text));
        }
        Ok(())
    }

    fn handle_markup(
        &mut self,
        unit: Unit,
        data: &[u8],
        events: &mut Vec<ParseEvent>,
    ) -> Result<(), ParseError> {
        match unit {
            Unit::Comment | Unit::ProcessingInstruction => {
                self.decode(data)?;
                Ok(())
            }
            Unit::Cdata => {
                let raw = self.decode(data)?;
                if self.scopes.is_empty() {
                    return Err(self.error(ParseErrorKind::TextOutsideElement));
                }
                // strip "<![CDATA[" and "]]>"
                let content = normalize_line_endings(&raw[9..raw.len() - 3]);
                if !content.is_empty() {
                    events.push(ParseEvent::CharacterData(content));
                }
                Ok(())
            }
            Unit::Tag => {
                let raw = self.decode(data)?;
                // strip "<" and ">"
                let inner = &raw[1..raw.len() - 1];
                if let Some(name) = inner.strip_prefix('/') {
                    self.handle_end_tag(name, events)
                } else {
                    let (inner, empty) = match inner.strip_suffix('/') {
                        Some(inner) => (inner, true),
                        None => (inner, false),
                    };
                    self.handle_start_tag(inner, empty, events)
                }
            }
        }
    }

    fn handle_end_tag(&mut self, inner: &str, events: &mut Vec<ParseEvent>) -> Result<(), ParseError> {
        let mut cursor = Cursor::new(inner);
        let name = cursor.name().map_err(|kind| self.error(kind))?;
        cursor.skip_ws();
        if let Some(c) = cursor.peek() {
            return Err(self.error(ParseErrorKind::UnexpectedChar(c)));
        }
        match self.scopes.last() {
            None => Err(self.error(ParseErrorKind::UnexpectedEndTag(name.to_owned()))),
            Some(scope) if scope.raw_name != name => {
                Err(self.error(ParseErrorKind::MismatchedEndTag {
                    expected: scope.raw_name.clone(),
                    found: name.to_owned(),
                }))
            }
            Some(_) => {
                self.scopes.pop();
                events.push(ParseEvent::EndElement);
                Ok(())
            }
        }
    }

    fn handle_start_tag(
        &mut self,
        inner: &str,
        empty: bool,
        events: &mut Vec<ParseEvent>,
    ) -> Result<(), ParseError> {
        let mut cursor = Cursor::new(inner);
        let raw_name = cursor.name().map_err(|kind| self.error(kind))?;

        let mut raw_attributes: Vec<(&str, String)> = Vec::new();
        loop {
            let had_ws = cursor.skip_ws();
            let Some(c) = cursor.peek() else {
                break;
            };
            if !had_ws {
                return Err(self.error(ParseErrorKind::UnexpectedChar(c)));
            }
            let (name, value) = cursor.attribute().map_err(|kind| self.error(kind))?;
            if raw_attributes.iter().any(|(n, _)| *n == name) {
                return Err(self.error(ParseErrorKind::DuplicateAttribute(name.to_owned())));
            }
            raw_attributes.push((name, value));
        }

        let mut scope = Scope {
            raw_name: raw_name.to_owned(),
            declarations: Vec::new(),
        };
        for (name, value) in raw_attributes.iter() {
            if *name == "xmlns" {
                scope.declarations.push((None, value.clone()));
            } else if let Some(prefix) = name.strip_prefix("xmlns:") {
                if value.is_empty() {
                    return Err(self.error(ParseErrorKind::UndeclaredPrefix(prefix.to_owned())));
                }
                scope
                    .declarations
                    .push((Some(prefix.to_owned()), value.clone()));
            }
        }

        let (prefix, local) = split_qname(raw_name);
        let namespace = self
            .resolve(&scope, prefix)
            .ok_or_else(|| self.error(ParseErrorKind::UndeclaredPrefix(prefix.unwrap_or("").to_owned())))?;

        let mut attributes = Vec::with_capacity(raw_attributes.len());
        for (name, value) in raw_attributes.into_iter() {
            if name == "xmlns" || name.starts_with("xmlns:") {
                continue;
            }
            let key = match split_qname(name) {
                (None, local) => local.to_owned(),
                (Some("xml"), _) => name.to_owned(),
                (Some(prefix), local) => {
                    let uri = self.resolve(&scope, Some(prefix)).ok_or_else(|| {
                        self.error(ParseErrorKind::UndeclaredPrefix(prefix.to_owned()))
                    })?;
                    format!("{} {}", uri, local)
                }
            };
            if attributes.iter().any(|(k, _): &(String, String)| *k == key) {
                return Err(self.error(ParseErrorKind::DuplicateAttribute(key)));
            }
            attributes.push((key, value));
        }

        events.push(ParseEvent::StartElement {
            name: local.to_owned(),
            namespace,
            attributes,
        });
        if empty {
            events.push(ParseEvent::EndElement);
        } else {
            self.scopes.push(scope);
        }
        Ok(())
    }

    /// Resolve `prefix` against the element's own declarations and then
    /// the enclosing scopes.
    fn resolve(&self, own: &Scope, prefix: Option<&str>) -> Option<String> {
        if prefix == Some("xml") {
            return Some(ns::XML.to_owned());
        }
        let lookup = |scope: &Scope| {
            scope
                .declarations
                .iter()
                .rev()
                .find(|(p, _)| p.as_deref() == prefix)
                .map(|(_, uri)| uri.clone())
        };
        if let Some(uri) = lookup(own) {
            return Some(uri);
        }
        for scope in self.scopes.iter().rev() {
            if let Some(uri) = lookup(scope) {
                return Some(uri);
            }
        }
        match prefix {
            // no default namespace in scope
            None => Some(String::new()),
            Some(_) => None,
        }
    }
}

fn split_qname(name: &str) -> (Option<&str>, &str) {
    match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, name),
    }
}

fn is_name_start_char(c: char) -> bool {
    matches!(c,
        ':' | 'A'..='Z' | '_' | 'a'..='z'
        | '\u{C0}'..='\u{D6}'
        | '\u{D8}'..='\u{F6}'
        | '\u{F8}'..='\u{2FF}'
        | '\u{370}'..='\u{37D}'
        | '\u{37F}'..='\u{1FFF}'
        | '\u{200C}'..='\u{200D}'
        | '\u{2070}'..='\u{218F}'
        | '\u{2C00}'..='\u{2FEF}'
        | '\u{3001}'..='\u{D7FF}'
        | '\u{F900}'..='\u{FDCF}'
        | '\u{FDF0}'..='\u{FFFD}'
        | '\u{10000}'..='\u{EFFFF}')
}

fn is_name_char(c: char) -> bool {
    is_name_start_char(c)
        || matches!(c,
            '-' | '.' | '0'..='9' | '\u{B7}'
            | '\u{300}'..='\u{36F}'
            | '\u{203F}'..='\u{2040}')
}

fn normalize_line_endings(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_owned();
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Replace entity and character references in `text`.
fn resolve_references(text: &str) -> Result<String, ParseErrorKind> {
    if !text.contains('&') {
        return Ok(text.to_owned());
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let semi = after
            .find(';')
            .ok_or_else(|| ParseErrorKind::InvalidReference(after.chars().take(8).collect()))?;
        let reference = &after[..semi];
        let resolved = match reference {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = reference
                    .strip_prefix("#x")
                    .or_else(|| reference.strip_prefix("#X"))
                {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = reference.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
                    .filter(|c| *c != '\0')
                    .ok_or_else(|| ParseErrorKind::InvalidReference(reference.to_owned()))?
            }
        };
        out.push(resolved);
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Attribute value normalization: literal whitespace becomes a space,
/// references are resolved afterwards.
fn normalize_attribute(raw: &str) -> Result<String, ParseErrorKind> {
    if raw.contains('<') {
        return Err(ParseErrorKind::UnexpectedChar('<'));
    }
    let spaced: String = raw
        .replace("\r\n", " ")
        .chars()
        .map(|c| match c {
            '\r' | '\n' | '\t' => ' ',
            c => c,
        })
        .collect();
    resolve_references(&spaced)
}

struct Cursor<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Cursor<'a> {
        Cursor { s, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.s[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while let Some(' ' | '\t' | '\r' | '\n') = self.peek() {
            self.pos += 1;
        }
        self.pos > start
    }

    /// Consume a qualified name.
    fn name(&mut self) -> Result<&'a str, ParseErrorKind> {
        let start = self.pos;
        match self.peek() {
            Some(c) if is_name_start_char(c) => {
                self.bump();
            }
            Some(c) => return Err(ParseErrorKind::UnexpectedChar(c)),
            None => return Err(ParseErrorKind::UnexpectedEnd),
        }
        while let Some(c) = self.peek() {
            if !is_name_char(c) {
                break;
            }
            self.bump();
        }
        let name = &self.s[start..self.pos];
        let valid = match name.split_once(':') {
            None => true,
            Some((prefix, local)) => {
                !prefix.is_empty() && !local.is_empty() && !local.contains(':')
            }
        };
        if !valid {
            return Err(ParseErrorKind::InvalidName(name.to_owned()));
        }
        Ok(name)
    }

    /// Consume `name = "value"`.
    fn attribute(&mut self) -> Result<(&'a str, String), ParseErrorKind> {
        let name = self.name()?;
        self.skip_ws();
        match self.bump() {
            Some('=') => (),
            Some(c) => return Err(ParseErrorKind::UnexpectedChar(c)),
            None => return Err(ParseErrorKind::UnexpectedEnd),
        }
        self.skip_ws();
        let quote = match self.bump() {
            Some(q @ ('"' | '\'')) => q,
            Some(c) => return Err(ParseErrorKind::UnexpectedChar(c)),
            None => return Err(ParseErrorKind::UnexpectedEnd),
        };
        let rest = &self.s[self.pos..];
        let len = rest.find(quote).ok_or(ParseErrorKind::UnexpectedEnd)?;
        let value = normalize_attribute(&rest[..len])?;
        self.pos += len + 1;
        Ok((name, value))
    }
}
