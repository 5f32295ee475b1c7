// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Assembly of parse events into stanzas.
//!
//! The stream root is depth 0. Its start tag is reported as a
//! [`StreamItem::Header`], every direct child becomes a
//! [`StreamItem::Stanza`] once its end tag arrives, and the root's end tag
//! is reported as [`StreamItem::Footer`].

use std::collections::BTreeMap;

use crate::node::Node;
use crate::parser::{ParseError, ParseErrorKind, ParseEvent, XmlParser};

/// Attributes of a received stream root element.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// Local name of the root, `stream` for XMPP
    pub name: String,
    /// Namespace of the root
    pub namespace: String,
    /// Attributes of the root
    pub attributes: BTreeMap<String, String>,
}

impl StreamHeader {
    /// The stream ID assigned by the peer.
    pub fn id(&self) -> Option<&str> {
        self.attributes.get("id").map(String::as_str)
    }

    /// The `from` attribute of the root.
    pub fn from(&self) -> Option<&str> {
        self.attributes.get("from").map(String::as_str)
    }

    /// The `version` attribute of the root.
    pub fn version(&self) -> Option<&str> {
        self.attributes.get("version").map(String::as_str)
    }
}

/// A unit of stream-level content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamItem {
    /// The peer's stream root was opened.
    Header(StreamHeader),
    /// A direct child of the stream root was completed.
    Stanza(Node),
    /// The peer closed its stream root.
    Footer,
}

fn node_from_start(name: String, namespace: String, attributes: Vec<(String, String)>) -> Node {
    let mut node = Node::new(name, namespace);
    for (key, value) in attributes {
        node.set_attr(key, value);
    }
    node
}

/// Depth-tracking stanza assembler on top of an [`XmlParser`].
pub struct StanzaBuilder {
    parser: XmlParser,
    max_buffer: usize,
    // in-progress elements; index 0 is the stanza itself
    stack: Vec<Node>,
    root_open: bool,
    root_closed: bool,
    events: Vec<ParseEvent>,
}

impl Default for StanzaBuilder {
    fn default() -> Self {
        StanzaBuilder::new(crate::parser::DEFAULT_MAX_BUFFER)
    }
}

impl StanzaBuilder {
    /// Create a builder whose parser rejects units above `max_buffer`
    /// bytes.
    pub fn new(max_buffer: usize) -> StanzaBuilder {
        StanzaBuilder {
            parser: XmlParser::with_limit(max_buffer),
            max_buffer,
            stack: Vec::new(),
            root_open: false,
            root_closed: false,
            events: Vec::new(),
        }
    }

    /// Discard all state, ready for a new stream root.
    pub fn reset(&mut self) {
        *self = StanzaBuilder::new(self.max_buffer);
    }

    /// Nesting depth relative to the stream root.
    ///
    /// 0 before the root was opened, 1 between stanzas.
    pub fn depth(&self) -> usize {
        if self.root_open {
            1 + self.stack.len()
        } else {
            0
        }
    }

    /// Whether received input beyond whitespace is not yet part of a
    /// completed item.
    pub fn has_pending_input(&self) -> bool {
        !self.stack.is_empty() || self.parser.has_pending_data()
    }

    /// Whether a parse error has killed this builder.
    pub fn is_dead(&self) -> bool {
        self.parser.is_dead()
    }

    /// Feed received bytes, appending completed items to `items`.
    ///
    /// Items completed before a parse error are still appended; the
    /// stanza being built when the error occurred is dropped.
    pub fn feed(&mut self, data: &[u8], items: &mut Vec<StreamItem>) -> Result<(), ParseError> {
        let mut events = std::mem::take(&mut self.events);
        let result = self.parser.feed(data, &mut events);
        for event in events.drain(..) {
            self.handle_event(event, items);
        }
        self.events = events;
        if result.is_err() {
            self.stack.clear();
        }
        result
    }

    fn handle_event(&mut self, event: ParseEvent, items: &mut Vec<StreamItem>) {
        if self.root_closed {
            log::debug!("Ignoring {:?} after the stream footer", event);
            return;
        }
        match event {
            ParseEvent::StartElement {
                name,
                namespace,
                attributes,
            } => {
                if !self.root_open {
                    self.root_open = true;
                    items.push(StreamItem::Header(StreamHeader {
                        name,
                        namespace,
                        attributes: attributes.into_iter().collect(),
                    }));
                } else {
                    self.stack
                        .push(node_from_start(name, namespace, attributes));
                }
            }
            ParseEvent::CharacterData(text) => match self.stack.last_mut() {
                Some(top) => top.append_text(&text),
                None => {
                    if !text.bytes().all(|b| b.is_ascii_whitespace()) {
                        log::warn!("Ignoring character data between stanzas: {:?}", text);
                    }
                }
            },
            ParseEvent::EndElement => match self.stack.pop() {
                Some(mut node) => {
                    node.strip_interelement_whitespace();
                    match self.stack.last_mut() {
                        Some(parent) => {
                            parent.append_child(node);
                        }
                        None => items.push(StreamItem::Stanza(node)),
                    }
                }
                None => {
                    self.root_open = false;
                    self.root_closed = true;
                    items.push(StreamItem::Footer);
                }
            },
        }
    }
}

/// Parse a complete standalone XML document into a [`Node`].
pub fn parse_document(data: &[u8]) -> Result<Node, ParseError> {
    let mut parser = XmlParser::new();
    let mut events = Vec::new();
    parser.feed(data, &mut events)?;

    let mut stack: Vec<Node> = Vec::new();
    for event in events {
        match event {
            ParseEvent::StartElement {
                name,
                namespace,
                attributes,
            } => stack.push(node_from_start(name, namespace, attributes)),
            ParseEvent::CharacterData(text) => {
                if let Some(top) = stack.last_mut() {
                    top.append_text(&text);
                }
            }
            ParseEvent::EndElement => {
                let Some(mut node) = stack.pop() else {
                    continue;
                };
                node.strip_interelement_whitespace();
                match stack.last_mut() {
                    Some(parent) => {
                        parent.append_child(node);
                    }
                    None => return Ok(node),
                }
            }
        }
    }
    Err(ParseError::new(
        ParseErrorKind::UnexpectedEnd,
        data.len() as u64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &[u8] = b"<stream:stream to='example.org' xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' id='s-1' version='1.0'>";

    fn feed_all(builder: &mut StanzaBuilder, chunks: &[&[u8]]) -> Vec<StreamItem> {
        let mut items = Vec::new();
        for chunk in chunks {
            builder.feed(chunk, &mut items).unwrap();
        }
        items
    }

    #[test]
    fn header_is_not_a_stanza() {
        let mut builder = StanzaBuilder::default();
        let items = feed_all(&mut builder, &[HEADER]);
        assert_eq!(items.len(), 1);
        match &items[0] {
            StreamItem::Header(header) => {
                assert_eq!(header.name, "stream");
                assert_eq!(header.namespace, "http://etherx.jabber.org/streams");
                assert_eq!(header.id(), Some("s-1"));
                assert_eq!(header.version(), Some("1.0"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(builder.depth(), 1);
    }

    #[test]
    fn end_to_end_three_splits() {
        let mut data = HEADER.to_vec();
        data.extend_from_slice(b"<iq type='result' id='abc'/>");
        let mut builder = StanzaBuilder::default();
        let items = feed_all(&mut builder, &[&data[..20], &data[20..131], &data[131..]]);
        assert_eq!(items.len(), 2);
        let StreamItem::Stanza(ref iq) = items[1] else {
            panic!("expected stanza, got {:?}", items[1]);
        };
        assert_eq!(iq.name(), "iq");
        assert_eq!(iq.ns(), "jabber:client");
        assert_eq!(iq.stanza_type(), Some("result"));
        assert_eq!(iq.id(), Some("abc"));
    }

    #[test]
    fn nested_stanza_and_whitespace() {
        let mut builder = StanzaBuilder::default();
        let items = feed_all(
            &mut builder,
            &[
                HEADER,
                b"\n  <message to='a@b'>\n    <body> hi </body>\n    <thread>t1</thread>\n  </message> ",
                b"<presence/>",
            ],
        );
        assert_eq!(items.len(), 3);
        let StreamItem::Stanza(ref message) = items[1] else {
            panic!("expected stanza");
        };
        assert_eq!(message.child_count(), 2);
        assert_eq!(message.text(), "");
        let body = message.get_child("body", "jabber:client").unwrap();
        assert_eq!(body.text(), " hi ");
        assert!(matches!(items[2], StreamItem::Stanza(ref p) if p.name() == "presence"));
    }

    #[test]
    fn footer_reported() {
        let mut builder = StanzaBuilder::default();
        let items = feed_all(&mut builder, &[HEADER, b"<a/></stream:stream>"]);
        assert_eq!(items.last(), Some(&StreamItem::Footer));
        assert_eq!(builder.depth(), 0);
    }

    #[test]
    fn partial_stanza_dropped_on_error() {
        let mut builder = StanzaBuilder::default();
        let mut items = Vec::new();
        builder.feed(HEADER, &mut items).unwrap();
        let err = builder
            .feed(b"<done/><message><body>x</wrong>", &mut items)
            .unwrap_err();
        assert!(err.fatal());
        // header and the complete <done/>, nothing from the broken message
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], StreamItem::Stanza(ref n) if n.name() == "done"));
        assert!(builder.is_dead());
        builder.feed(b"</message><late/>", &mut items).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn stanza_count_matches_closed_children() {
        let mut data = HEADER.to_vec();
        for i in 0..25 {
            data.extend_from_slice(format!("<message id='m{}'><body>{}</body></message>", i, i).as_bytes());
        }
        // one unterminated child must not be delivered
        data.extend_from_slice(b"<message id='open'><body>");
        for chunk_size in [1, 3, 17, 64, 1000] {
            let mut builder = StanzaBuilder::default();
            let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();
            let items = feed_all(&mut builder, &chunks);
            let stanzas = items
                .iter()
                .filter(|i| matches!(i, StreamItem::Stanza(_)))
                .count();
            assert_eq!(stanzas, 25);
        }
    }

    #[test]
    fn reset_accepts_new_root() {
        let mut builder = StanzaBuilder::default();
        feed_all(&mut builder, &[HEADER, b"<message><body>"]);
        builder.reset();
        let items = feed_all(&mut builder, &[HEADER]);
        assert!(matches!(items[0], StreamItem::Header(_)));
        assert_eq!(builder.depth(), 1);
    }

    #[test]
    fn parse_document_requires_complete_root() {
        assert!(parse_document(b"<a><b/>").is_err());
        let node = parse_document(b"<?xml version='1.0'?><a xmlns='urn:a'><b/>t</a>").unwrap();
        assert_eq!(node.name(), "a");
        assert_eq!(node.text(), "t");
    }
}
