// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-memory XML element trees.
//!
//! A [`Node`] holds one stanza, or any descendant of one. Character data is
//! kept as a list of segments interleaved with the children: segment `i`
//! precedes child `i` and the last segment trails the last child, so that
//! serialization reproduces the original ordering of mixed content.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};

use crate::ns;
use crate::parser::ParseError;

pub mod stanza;

/// Escape `data` into `out`, replacing every byte in `specials` with its
/// entity or character reference.
fn escape<B: BufMut>(out: &mut B, data: &[u8], specials: &'static [u8]) {
    let mut last_index = 0;
    for (i, ch) in data.iter().enumerate() {
        if !specials.contains(ch) {
            continue;
        }
        if i > last_index {
            out.put_slice(&data[last_index..i]);
        }
        match ch {
            b'"' => out.put_slice(b"&quot;"),
            b'\'' => out.put_slice(b"&apos;"),
            b'<' => out.put_slice(b"&lt;"),
            b'>' => out.put_slice(b"&gt;"),
            b'&' => out.put_slice(b"&amp;"),
            b'\r' => out.put_slice(b"&#xd;"),
            b'\n' => out.put_slice(b"&#xa;"),
            b'\t' => out.put_slice(b"&#x9;"),
            // only reachable if `specials` lists a byte not handled above
            other => out.put_u8(*other),
        }
        last_index = i + 1;
    }
    out.put_slice(&data[last_index..]);
}

/// Escape character data for use between tags.
pub(crate) fn escape_text<B: BufMut>(out: &mut B, text: &str) {
    escape(out, text.as_bytes(), b"&<>\r");
}

/// Escape an attribute value for use inside double quotes.
pub(crate) fn escape_attr<B: BufMut>(out: &mut B, value: &str) {
    escape(out, value.as_bytes(), b"&<>\"'\r\n\t");
}

/// Split an attribute key of the form `"{namespace} {localname}"`.
///
/// Keys without a separator (plain attributes and `xml:`-prefixed ones) are
/// returned as `None`.
fn split_attr_key(key: &str) -> Option<(&str, &str)> {
    key.rsplit_once(' ')
}

/// An XML element with attributes, children and interleaved text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    name: String,
    namespace: String,
    attributes: BTreeMap<String, String>,
    children: Vec<Node>,
    // always exactly one more entry than `children`
    texts: Vec<String>,
}

impl Node {
    /// Create an empty element.
    ///
    /// An empty `namespace` means the element inherits the namespace of
    /// whatever it is serialized inside of.
    pub fn new<N: Into<String>, S: Into<String>>(name: N, namespace: S) -> Node {
        Node {
            name: name.into(),
            namespace: namespace.into(),
            attributes: BTreeMap::new(),
            children: Vec::new(),
            texts: vec![String::new()],
        }
    }

    /// Start building an element.
    pub fn builder<N: Into<String>, S: Into<String>>(name: N, namespace: S) -> NodeBuilder {
        NodeBuilder {
            node: Node::new(name, namespace),
        }
    }

    /// Local name of the element.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace URI of the element, possibly empty.
    pub fn ns(&self) -> &str {
        &self.namespace
    }

    /// Overwrite the namespace of this element.
    pub fn set_ns<S: Into<String>>(&mut self, namespace: S) {
        self.namespace = namespace.into();
    }

    /// The `"{namespace} {localname}"` string for this element.
    pub fn qualified_name(&self) -> String {
        format!("{} {}", self.namespace, self.name)
    }

    /// Whether this element has the given name and namespace.
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }

    /// Look up an attribute.
    ///
    /// Attributes in the `xml` namespace are keyed by their prefixed name
    /// (`xml:lang`), other namespaced attributes as
    /// `"{namespace} {localname}"`.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Set an attribute, returning the previous value.
    pub fn set_attr<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) -> Option<String> {
        self.attributes.insert(name.into(), value.into())
    }

    /// Remove an attribute, returning its value.
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        self.attributes.remove(name)
    }

    /// Iterate over all attributes.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The `id` attribute.
    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    /// Set the `id` attribute.
    pub fn set_id<S: Into<String>>(&mut self, id: S) {
        self.set_attr("id", id);
    }

    /// The `type` attribute.
    pub fn stanza_type(&self) -> Option<&str> {
        self.attr("type")
    }

    /// Child elements, in document order.
    pub fn children(&self) -> impl Iterator<Item = &Node> {
        self.children.iter()
    }

    /// Mutable access to the child elements.
    pub fn children_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.children.iter_mut()
    }

    /// Number of child elements.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// First child with the given name and namespace.
    pub fn get_child(&self, name: &str, namespace: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.is(name, namespace))
    }

    /// Mutable variant of [`Self::get_child`].
    pub fn get_child_mut(&mut self, name: &str, namespace: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|c| c.is(name, namespace))
    }

    /// Whether a child with the given name and namespace exists.
    pub fn has_child(&self, name: &str, namespace: &str) -> bool {
        self.get_child(name, namespace).is_some()
    }

    /// Remove and return the first child with the given name and namespace.
    ///
    /// The text around the removed child is joined.
    pub fn remove_child(&mut self, name: &str, namespace: &str) -> Option<Node> {
        let index = self.children.iter().position(|c| c.is(name, namespace))?;
        let trailing = self.texts.remove(index + 1);
        self.texts[index].push_str(&trailing);
        Some(self.children.remove(index))
    }

    /// Append a child element and return a reference to it.
    pub fn append_child(&mut self, child: Node) -> &mut Node {
        self.children.push(child);
        self.texts.push(String::new());
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// Append character data after the current last child.
    pub fn append_text(&mut self, text: &str) {
        // texts is never empty
        if let Some(last) = self.texts.last_mut() {
            last.push_str(text);
        }
    }

    /// All character data directly inside this element, concatenated.
    pub fn text(&self) -> String {
        self.texts.concat()
    }

    /// The character data segments interleaved with the children.
    pub fn text_segments(&self) -> &[String] {
        &self.texts
    }

    /// Whether the element has neither children nor text.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.texts.iter().all(String::is_empty)
    }

    /// Clear whitespace-only text segments of an element with children.
    pub(crate) fn strip_interelement_whitespace(&mut self) {
        if self.children.is_empty() {
            return;
        }
        for text in self.texts.iter_mut() {
            if !text.is_empty() && text.bytes().all(|b| b.is_ascii_whitespace()) {
                text.clear();
            }
        }
    }

    /// Serialize into `out`.
    ///
    /// `parent_ns` is the namespace in effect where the element is written;
    /// an `xmlns` declaration is emitted only when the element's namespace
    /// differs from it.
    pub fn write_to(&self, out: &mut BytesMut, parent_ns: &str) {
        let effective_ns = if self.namespace.is_empty() {
            parent_ns
        } else {
            self.namespace.as_str()
        };

        out.put_u8(b'<');
        out.put_slice(self.name.as_bytes());
        if effective_ns != parent_ns {
            out.put_slice(b" xmlns=\"");
            escape_attr(out, effective_ns);
            out.put_u8(b'"');
        }

        let mut prefixes: Vec<&str> = Vec::new();
        for (key, value) in self.attributes.iter() {
            out.put_u8(b' ');
            match split_attr_key(key) {
                Some((attr_ns, local)) if attr_ns == ns::XML => {
                    out.put_slice(b"xml:");
                    out.put_slice(local.as_bytes());
                }
                Some((attr_ns, local)) => {
                    let index = match prefixes.iter().position(|p| *p == attr_ns) {
                        Some(index) => index,
                        None => {
                            prefixes.push(attr_ns);
                            let index = prefixes.len() - 1;
                            out.put_slice(format!("xmlns:ns{}=\"", index).as_bytes());
                            escape_attr(out, attr_ns);
                            out.put_slice(b"\" ");
                            index
                        }
                    };
                    out.put_slice(format!("ns{}:", index).as_bytes());
                    out.put_slice(local.as_bytes());
                }
                None => out.put_slice(key.as_bytes()),
            }
            out.put_slice(b"=\"");
            escape_attr(out, value);
            out.put_u8(b'"');
        }

        if self.is_empty() {
            out.put_slice(b"/>");
            return;
        }
        out.put_u8(b'>');
        for (text, child) in self.texts.iter().zip(self.children.iter()) {
            escape_text(out, text);
            child.write_to(out, effective_ns);
        }
        if let Some(trailing) = self.texts.last() {
            escape_text(out, trailing);
        }
        out.put_slice(b"</");
        out.put_slice(self.name.as_bytes());
        out.put_u8(b'>');
    }

    /// Serialize to a string, declaring the element's namespace.
    pub fn to_xml(&self) -> String {
        let mut out = BytesMut::new();
        self.write_to(&mut out, "");
        String::from_utf8_lossy(&out).into_owned()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

impl FromStr for Node {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Node, ParseError> {
        crate::builder::parse_document(s.as_bytes())
    }
}

/// Fluent constructor for [`Node`].
pub struct NodeBuilder {
    node: Node,
}

impl NodeBuilder {
    /// Set an attribute.
    pub fn attr<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> NodeBuilder {
        self.node.set_attr(name, value);
        self
    }

    /// Set an attribute if `value` is `Some`.
    pub fn attr_opt<K: Into<String>, V: Into<String>>(
        mut self,
        name: K,
        value: Option<V>,
    ) -> NodeBuilder {
        if let Some(value) = value {
            self.node.set_attr(name, value);
        }
        self
    }

    /// Append a child element.
    pub fn append(mut self, child: Node) -> NodeBuilder {
        self.node.append_child(child);
        self
    }

    /// Append character data.
    pub fn append_text(mut self, text: &str) -> NodeBuilder {
        self.node.append_text(text);
        self
    }

    /// Finish building.
    pub fn build(self) -> Node {
        self.node
    }
}

impl From<NodeBuilder> for Node {
    fn from(builder: NodeBuilder) -> Node {
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Node {
        Node::builder("message", ns::JABBER_CLIENT)
            .attr("to", "juliet@example.com")
            .attr("type", "chat")
            .append_text("lead ")
            .append(
                Node::builder("body", ns::JABBER_CLIENT)
                    .append_text("a < b && c > \"d\"")
                    .build(),
            )
            .append_text(" middle ")
            .append(
                Node::builder("x", "urn:example:x")
                    .attr("note", "it's <quoted>\n\t&")
                    .append(Node::new("y", "urn:example:x"))
                    .build(),
            )
            .append_text(" tail")
            .build()
    }

    #[test]
    fn segments_track_children() {
        let node = sample();
        assert_eq!(node.child_count(), 2);
        assert_eq!(node.text_segments(), &["lead ", " middle ", " tail"]);
        assert_eq!(node.text(), "lead  middle  tail");
    }

    #[test]
    fn round_trip_through_parser() {
        let node = sample();
        let xml = node.to_xml();
        let parsed: Node = xml.parse().unwrap();
        assert_eq!(parsed, node);
    }

    #[test]
    fn escapes_specials() {
        let node = Node::builder("body", "jabber:client")
            .attr("a", "x\"y'z")
            .append_text("1 < 2 & 3 > 2")
            .build();
        assert_eq!(
            node.to_xml(),
            "<body xmlns=\"jabber:client\" a=\"x&quot;y&apos;z\">1 &lt; 2 &amp; 3 &gt; 2</body>"
        );
    }

    #[test]
    fn inherits_namespace_of_parent() {
        let node = Node::builder("iq", "jabber:client")
            .append(Node::new("query", "jabber:iq:version"))
            .append(Node::new("extra", ""))
            .build();
        assert_eq!(
            node.to_xml(),
            "<iq xmlns=\"jabber:client\"><query xmlns=\"jabber:iq:version\"/><extra/></iq>"
        );
    }

    #[test]
    fn namespaced_attributes_get_prefixes() {
        let node = Node::builder("presence", "jabber:client")
            .attr("xml:lang", "en")
            .attr("urn:example:a foo", "1")
            .build();
        let xml = node.to_xml();
        assert!(xml.contains("xml:lang=\"en\""));
        assert!(xml.contains("xmlns:ns0=\"urn:example:a\" ns0:foo=\"1\""));
        let parsed: Node = xml.parse().unwrap();
        assert_eq!(parsed.attr("urn:example:a foo"), Some("1"));
        assert_eq!(parsed.attr("xml:lang"), Some("en"));
    }

    #[test]
    fn remove_child_joins_text() {
        let mut node = sample();
        let removed = node.remove_child("body", ns::JABBER_CLIENT).unwrap();
        assert_eq!(removed.text(), "a < b && c > \"d\"");
        assert_eq!(node.text_segments(), &["lead  middle ", " tail"]);
    }
}
