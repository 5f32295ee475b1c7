// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::error::Error as StdError;
use std::fmt;

/// What exactly was wrong with the input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input is not valid UTF-8
    InvalidUtf8,
    /// A name is not a valid XML name or qualified name
    InvalidName(String),
    /// A character which is not allowed at this point
    UnexpectedChar(char),
    /// A tag ended where more was expected
    UnexpectedEnd,
    /// An element or attribute uses a prefix without declaration
    UndeclaredPrefix(String),
    /// The same attribute appears twice on one element
    DuplicateAttribute(String),
    /// An end tag does not match the open element
    MismatchedEndTag {
        /// Name of the element which is open
        expected: String,
        /// Name found in the end tag
        found: String,
    },
    /// An end tag without any open element
    UnexpectedEndTag(String),
    /// Unknown entity or invalid character reference
    InvalidReference(String),
    /// Non-whitespace character data outside of any element
    TextOutsideElement,
    /// DOCTYPE declarations are not permitted in XMPP streams
    DoctypeForbidden,
    /// A `<!` construct other than a comment or CDATA section
    UnsupportedDeclaration,
    /// A single syntactic unit grew beyond the configured limit
    BufferLimitExceeded(usize),
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseErrorKind::InvalidUtf8 => write!(fmt, "invalid UTF-8"),
            ParseErrorKind::InvalidName(name) => write!(fmt, "invalid name {:?}", name),
            ParseErrorKind::UnexpectedChar(c) => write!(fmt, "unexpected character {:?}", c),
            ParseErrorKind::UnexpectedEnd => write!(fmt, "unexpected end of tag"),
            ParseErrorKind::UndeclaredPrefix(p) => write!(fmt, "undeclared prefix {:?}", p),
            ParseErrorKind::DuplicateAttribute(a) => write!(fmt, "duplicate attribute {:?}", a),
            ParseErrorKind::MismatchedEndTag { expected, found } => write!(
                fmt,
                "end tag </{}> does not match open element <{}>",
                found, expected
            ),
            ParseErrorKind::UnexpectedEndTag(name) => {
                write!(fmt, "end tag </{}> without open element", name)
            }
            ParseErrorKind::InvalidReference(r) => write!(fmt, "invalid reference &{};", r),
            ParseErrorKind::TextOutsideElement => write!(fmt, "text outside of element"),
            ParseErrorKind::DoctypeForbidden => write!(fmt, "DOCTYPE is not allowed"),
            ParseErrorKind::UnsupportedDeclaration => write!(fmt, "unsupported declaration"),
            ParseErrorKind::BufferLimitExceeded(limit) => {
                write!(fmt, "syntactic unit exceeds {} bytes", limit)
            }
        }
    }
}

/// Malformed input. Every parse error is fatal to the stream it occurred
/// on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseError {
    kind: ParseErrorKind,
    offset: u64,
}

impl ParseError {
    pub(crate) fn new(kind: ParseErrorKind, offset: u64) -> ParseError {
        ParseError { kind, offset }
    }

    /// What went wrong.
    pub fn kind(&self) -> &ParseErrorKind {
        &self.kind
    }

    /// Byte offset into the stream of the unit that failed to parse.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether the stream can continue after this error. It never can.
    pub fn fatal(&self) -> bool {
        true
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{} at byte {}", self.kind, self.offset)
    }
}

impl StdError for ParseError {}
