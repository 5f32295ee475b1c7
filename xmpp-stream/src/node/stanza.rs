// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Constructors and predicates for the three stanza kinds.
//!
//! Stanzas built here carry an empty namespace, so they pick up the
//! default namespace of whatever stream they are written to.

use std::fmt;

use super::Node;
use crate::ns;

/// The `type` of an `<iq/>` stanza.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IqType {
    /// Request for information
    Get,
    /// Request to change something
    Set,
    /// Successful response
    Result,
    /// Error response
    Error,
}

impl IqType {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    /// Parse the wire representation.
    pub fn from_attr(value: &str) -> Option<IqType> {
        Some(match value {
            "get" => IqType::Get,
            "set" => IqType::Set,
            "result" => IqType::Result,
            "error" => IqType::Error,
            _ => return None,
        })
    }
}

/// Build an `<iq/>` stanza with an optional payload.
pub fn iq(iq_type: IqType, to: Option<&str>, payload: Option<Node>) -> Node {
    let mut node = Node::builder("iq", "")
        .attr("type", iq_type.as_str())
        .attr_opt("to", to)
        .build();
    if let Some(payload) = payload {
        node.append_child(payload);
    }
    node
}

/// Build a `<message/>` stanza, optionally with a `<body/>`.
pub fn message(to: &str, message_type: Option<&str>, body: Option<&str>) -> Node {
    let mut node = Node::builder("message", "")
        .attr("to", to)
        .attr_opt("type", message_type)
        .build();
    if let Some(body) = body {
        node.append_child(Node::builder("body", "").append_text(body).build());
    }
    node
}

/// Build a `<presence/>` stanza.
pub fn presence(to: Option<&str>, presence_type: Option<&str>) -> Node {
    Node::builder("presence", "")
        .attr_opt("to", to)
        .attr_opt("type", presence_type)
        .build()
}

/// Whether `node` is an `<iq/>` of type `get` or `set`, which must always
/// be answered.
pub fn is_iq_request(node: &Node) -> bool {
    node.name() == "iq" && matches!(node.stanza_type(), Some("get") | Some("set"))
}

/// Whether `node` is an `<iq/>` response.
pub fn is_iq_response(node: &Node) -> bool {
    node.name() == "iq" && matches!(node.stanza_type(), Some("result") | Some("error"))
}

/// Build the `result` reply to an iq request.
pub fn result_reply(request: &Node, payload: Option<Node>) -> Node {
    let mut reply = iq(IqType::Result, request.attr("from"), payload);
    if let Some(id) = request.id() {
        reply.set_id(id);
    }
    reply
}

/// RFC 6120 §8.3.2 error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry
    Cancel,
    /// Proceed, the condition was only a warning
    Continue,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting
    Wait,
}

impl ErrorType {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }
}

/// The subset of RFC 6120 §8.3.3 stanza error conditions the engine emits
/// itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefinedCondition {
    /// Malformed or unprocessable request
    BadRequest,
    /// The recipient does not implement the request
    FeatureNotImplemented,
    /// The recipient hit an internal error
    InternalServerError,
    /// The addressed item does not exist
    ItemNotFound,
    /// The recipient does not allow the action
    NotAllowed,
    /// The service is not available
    ServiceUnavailable,
}

impl DefinedCondition {
    /// Element name of the condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinedCondition::BadRequest => "bad-request",
            DefinedCondition::FeatureNotImplemented => "feature-not-implemented",
            DefinedCondition::InternalServerError => "internal-server-error",
            DefinedCondition::ItemNotFound => "item-not-found",
            DefinedCondition::NotAllowed => "not-allowed",
            DefinedCondition::ServiceUnavailable => "service-unavailable",
        }
    }

    /// The error type RFC 6120 associates with the condition.
    pub fn default_type(&self) -> ErrorType {
        match self {
            DefinedCondition::BadRequest => ErrorType::Modify,
            DefinedCondition::InternalServerError => ErrorType::Wait,
            _ => ErrorType::Cancel,
        }
    }
}

impl fmt::Display for DefinedCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build an error reply to `stanza`.
///
/// The reply keeps the original id and payload, swaps the addresses and
/// carries an `<error/>` with the given condition.
pub fn error_reply(stanza: &Node, condition: DefinedCondition, text: Option<&str>) -> Node {
    let mut reply = Node::builder(stanza.name(), stanza.ns())
        .attr("type", "error")
        .attr_opt("to", stanza.attr("from"))
        .attr_opt("from", stanza.attr("to"))
        .attr_opt("id", stanza.id())
        .build();
    for child in stanza.children() {
        reply.append_child(child.clone());
    }

    let mut error = Node::builder("error", stanza.ns())
        .attr("type", condition.default_type().as_str())
        .append(Node::new(condition.as_str(), ns::XMPP_STANZAS))
        .build();
    if let Some(text) = text {
        error.append_child(
            Node::builder("text", ns::XMPP_STANZAS)
                .append_text(text)
                .build(),
        );
    }
    reply.append_child(error);
    reply
}

/// Extract the defined condition name from an `<error/>` child, if any.
pub fn error_condition(stanza: &Node) -> Option<&str> {
    stanza
        .children()
        .find(|c| c.name() == "error")?
        .children()
        .find(|c| c.ns() == ns::XMPP_STANZAS && c.name() != "text")
        .map(Node::name)
}
