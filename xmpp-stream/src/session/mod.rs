// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # One logical XMPP stream
//!
//! [`StreamSession`] owns everything about a stream that does not involve
//! I/O: the incremental stanza builder, the handler registry, the table of
//! pending responses and the queue of outbound data. It never touches a
//! socket. Received bytes are handed to [`StreamSession::feed`], and
//! whatever the session wants to send is collected with
//! [`StreamSession::take_outbound`] by the driver owning the transport.
//!
//! Handlers are invoked from [`StreamSession::dispatch`] with a
//! [`StanzaContext`], through which they may send further stanzas or close
//! the stream.

use core::ops::ControlFlow;
use core::time::Duration;
use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use rand::{thread_rng, Rng};
use tokio::time::Instant;

use crate::builder::{StanzaBuilder, StreamHeader, StreamItem};
use crate::error::{Error, ProtocolError, ResponseError};
use crate::node::{escape_attr, stanza, Node};
use crate::ns;

mod pending;
mod registry;
#[cfg(test)]
mod tests;

pub use pending::{ResponseCallback, ResponseResult, ResponseSink, ResponseToken};
pub use registry::{Handler, HandlerId, Matcher, Priority};

use pending::PendingResponses;
use registry::HandlerRegistry;

/// Lifecycle of the local side of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No stream header sent yet
    Idle,
    /// Stream header sent, waiting for the peer's
    Opening,
    /// Both headers exchanged
    Open,
    /// Stream footer sent
    Closing,
    /// The transport is gone
    Closed,
}

/// The opening `<stream:stream>` tag we send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenStream {
    /// Peer address
    pub to: String,
    /// Namespace of stanzas on the stream
    pub default_ns: String,
    /// Stream id to resume, if any
    pub id: Option<String>,
    /// `xml:lang` of the stream
    pub lang: Option<String>,
    /// Whether this header restarts the stream after TLS or SASL
    pub restart: bool,
}

impl OpenStream {
    /// Serialize the XML declaration and the unterminated root tag.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_slice(b"<?xml version='1.0'?><stream:stream xmlns=\"");
        escape_attr(&mut out, &self.default_ns);
        out.put_slice(b"\" xmlns:stream=\"");
        out.put_slice(ns::STREAM.as_bytes());
        out.put_slice(b"\" to=\"");
        escape_attr(&mut out, &self.to);
        out.put_slice(b"\" version=\"1.0\"");
        if let Some(id) = self.id.as_ref() {
            out.put_slice(b" id=\"");
            escape_attr(&mut out, id);
            out.put_u8(b'"');
        }
        if let Some(lang) = self.lang.as_ref() {
            out.put_slice(b" xml:lang=\"");
            escape_attr(&mut out, lang);
            out.put_u8(b'"');
        }
        out.put_u8(b'>');
        out.freeze()
    }
}

/// The closing tag of a stream.
pub const STREAM_FOOTER: &[u8] = b"</stream:stream>";

/// Something the driver has to hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Open (or restart) the stream
    Header(OpenStream),
    /// Serialized stanza or whitespace
    Data(Bytes),
    /// Close the stream, then the transport
    Footer,
}

/// Outcome of [`StreamSession::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// The stanza resolved a pending response
    Response,
    /// A registered handler handled it
    Handled,
    /// No handler claimed it and the fallback ran
    Fallback,
}

/// Generates stanza ids unique within a session.
struct IdGenerator {
    prefix: String,
    counter: u64,
}

impl IdGenerator {
    fn new() -> IdGenerator {
        let prefix: u32 = thread_rng().gen();
        IdGenerator {
            prefix: format!("{:08x}", prefix),
            counter: 0,
        }
    }

    fn next_id(&mut self) -> String {
        self.counter += 1;
        format!("{}-{}", self.prefix, self.counter)
    }
}

/// The part of a session handlers can reach.
pub(crate) struct SessionCore {
    to: String,
    default_ns: String,
    lang: Option<String>,
    state: StreamState,
    stream_id: Option<String>,
    ids: IdGenerator,
    pending: PendingResponses,
    outbox: VecDeque<Outbound>,
    response_timeout: Option<Duration>,
    // declare the namespace on every top-level element
    qualified: bool,
}

impl SessionCore {
    fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Opening | StreamState::Open)
    }

    fn send(
        &mut self,
        mut node: Node,
        response: Option<(Option<Duration>, ResponseSink)>,
    ) -> Result<String, Error> {
        if !self.can_send() {
            log::debug!("Not sending {} on a {:?} stream", node.name(), self.state);
            return Err(Error::Disconnected);
        }
        if node.ns().is_empty() {
            node.set_ns(self.default_ns.clone());
        }
        let id = match node.id() {
            Some(id) => id.to_owned(),
            None => {
                let id = self.ids.next_id();
                node.set_id(id.clone());
                id
            }
        };
        if let Some((timeout, sink)) = response {
            if self.pending.contains(&id) {
                return Err(Error::DuplicateId(id));
            }
            let deadline = timeout
                .or(self.response_timeout)
                .map(|timeout| Instant::now() + timeout);
            self.pending.insert(id.clone(), &node, deadline, sink);
        }
        self.push_node(&node);
        Ok(id)
    }

    fn push_node(&mut self, node: &Node) {
        let mut out = BytesMut::new();
        let parent_ns = if self.qualified {
            ""
        } else {
            self.default_ns.as_str()
        };
        node.write_to(&mut out, parent_ns);
        self.outbox.push_back(Outbound::Data(out.freeze()));
    }

    fn close(&mut self) {
        match self.state {
            StreamState::Closing | StreamState::Closed => return,
            StreamState::Idle => self.state = StreamState::Closed,
            StreamState::Opening | StreamState::Open => {
                self.outbox.push_back(Outbound::Footer);
                self.state = StreamState::Closing;
            }
        }
        self.fail_pending(ResponseError::ConnectionLost);
    }

    fn fail_pending(&mut self, error: ResponseError) -> usize {
        let entries = self.pending.take_all();
        let count = entries.len();
        for (id, entry) in entries {
            log::debug!("Resolving pending response {} with {}", id, error);
            let mut ctx = StanzaContext { core: self };
            entry.sink.complete(&mut ctx, Err(error));
        }
        count
    }
}

/// Access to the session from within handlers and response callbacks.
pub struct StanzaContext<'a> {
    core: &'a mut SessionCore,
}

impl StanzaContext<'_> {
    /// Send a stanza, assigning an id if it has none.
    pub fn send(&mut self, node: Node) -> Result<String, Error> {
        self.core.send(node, None)
    }

    /// Send a stanza and have `sink` resolved with its reply.
    pub fn send_with_response(
        &mut self,
        node: Node,
        timeout: Option<Duration>,
        sink: ResponseSink,
    ) -> Result<String, Error> {
        self.core.send(node, Some((timeout, sink)))
    }

    /// Close the stream. Idempotent.
    pub fn close(&mut self) {
        self.core.close()
    }

    /// The stream id assigned by the peer.
    pub fn stream_id(&self) -> Option<&str> {
        self.core.stream_id.as_deref()
    }

    /// The default stanza namespace of the stream.
    pub fn default_ns(&self) -> &str {
        &self.core.default_ns
    }
}

/// Extract condition and text from a `<stream:error/>`.
pub fn stream_error(node: &Node) -> Option<(String, Option<String>)> {
    if !node.is("error", ns::STREAM) {
        return None;
    }
    let condition = node
        .children()
        .find(|c| c.ns() == ns::XMPP_STREAMS && c.name() != "text")
        .map(|c| c.name().to_owned())
        .unwrap_or_else(|| "undefined-condition".to_owned());
    let text = node.get_child("text", ns::XMPP_STREAMS).map(Node::text);
    Some((condition, text))
}

/// State of one logical stream.
pub struct StreamSession {
    core: SessionCore,
    builder: StanzaBuilder,
    registry: HandlerRegistry,
    fallback: Option<Handler>,
    peer_header: Option<StreamHeader>,
    remote_closed: bool,
}

impl Default for StreamSession {
    fn default() -> Self {
        StreamSession::new()
    }
}

impl StreamSession {
    /// Create an idle session.
    pub fn new() -> StreamSession {
        StreamSession::with_max_buffer(crate::parser::DEFAULT_MAX_BUFFER)
    }

    /// Create an idle session whose parser rejects units larger than
    /// `max_buffer` bytes.
    pub fn with_max_buffer(max_buffer: usize) -> StreamSession {
        StreamSession {
            core: SessionCore {
                to: String::new(),
                default_ns: ns::JABBER_CLIENT.to_owned(),
                lang: None,
                state: StreamState::Idle,
                stream_id: None,
                ids: IdGenerator::new(),
                pending: PendingResponses::default(),
                outbox: VecDeque::new(),
                response_timeout: None,
                qualified: false,
            },
            builder: StanzaBuilder::new(max_buffer),
            registry: HandlerRegistry::default(),
            fallback: None,
            peer_header: None,
            remote_closed: false,
        }
    }

    /// Set the `xml:lang` sent in stream headers.
    pub fn set_lang(&mut self, lang: Option<String>) {
        self.core.lang = lang;
    }

    /// Deadline applied to responses sent without an explicit timeout.
    /// `None` lets them wait until the stream ends.
    pub fn set_default_response_timeout(&mut self, timeout: Option<Duration>) {
        self.core.response_timeout = timeout;
    }

    /// Declare the stanza namespace on every element sent, for transports
    /// which do not carry stanzas inside the stream root (BOSH).
    pub fn set_qualified_stanzas(&mut self, qualified: bool) {
        self.core.qualified = qualified;
    }

    /// Current state of the local side.
    pub fn state(&self) -> StreamState {
        self.core.state
    }

    /// The stream id assigned by the peer, once its header arrived.
    pub fn stream_id(&self) -> Option<&str> {
        self.core.stream_id.as_deref()
    }

    /// The peer's most recent stream header.
    pub fn peer_header(&self) -> Option<&StreamHeader> {
        self.peer_header.as_ref()
    }

    /// The default stanza namespace.
    pub fn default_ns(&self) -> &str {
        &self.core.default_ns
    }

    /// Whether the peer sent its stream footer.
    pub fn remote_closed(&self) -> bool {
        self.remote_closed
    }

    /// Nesting depth of the stanza builder.
    pub fn depth(&self) -> usize {
        self.builder.depth()
    }

    /// Whether received bytes are still waiting in the stanza builder.
    pub fn has_pending_input(&self) -> bool {
        self.builder.has_pending_input()
    }

    /// Number of responses still awaited.
    pub fn pending_responses(&self) -> usize {
        self.core.pending.len()
    }

    /// Emit the opening stream header.
    ///
    /// The peer's header is reported later through [`Self::feed`].
    pub fn open(&mut self, to: &str, default_ns: &str, id: Option<&str>) {
        self.core.to = to.to_owned();
        self.core.default_ns = default_ns.to_owned();
        self.core.state = StreamState::Opening;
        self.core.outbox.push_back(Outbound::Header(OpenStream {
            to: to.to_owned(),
            default_ns: default_ns.to_owned(),
            id: id.map(str::to_owned),
            lang: self.core.lang.clone(),
            restart: false,
        }));
    }

    /// Restart the stream after TLS or SASL: reset the parser and emit a
    /// fresh header. Handlers and pending responses are kept.
    pub fn restart(&mut self) {
        self.builder.reset();
        self.peer_header = None;
        self.core.stream_id = None;
        self.core.state = StreamState::Opening;
        self.core.outbox.push_back(Outbound::Header(OpenStream {
            to: self.core.to.clone(),
            default_ns: self.core.default_ns.clone(),
            id: None,
            lang: self.core.lang.clone(),
            restart: true,
        }));
    }

    /// Feed received bytes, appending completed stream items to `items`.
    ///
    /// Stream headers are validated and recorded before they are handed
    /// out. Items completed before an error are kept; a rejected header
    /// and everything after it are dropped.
    pub fn feed(&mut self, data: &[u8], items: &mut Vec<StreamItem>) -> Result<(), Error> {
        let start = items.len();
        let parsed = self.builder.feed(data, items);
        for index in start..items.len() {
            let accepted = match &items[index] {
                StreamItem::Header(header) => self.accept_header(header),
                StreamItem::Footer => {
                    self.remote_closed = true;
                    Ok(())
                }
                StreamItem::Stanza(_) => Ok(()),
            };
            if let Err(e) = accepted {
                items.truncate(index);
                return Err(e.into());
            }
        }
        Ok(parsed?)
    }

    fn accept_header(&mut self, header: &StreamHeader) -> Result<(), ProtocolError> {
        if header.name != "stream" || header.namespace != ns::STREAM {
            return Err(ProtocolError::InvalidStreamStart(format!(
                "{{{}}}{}",
                header.namespace, header.name
            )));
        }
        match header.version() {
            Some(version) if version.split('.').next() == Some("1") => (),
            version => {
                return Err(ProtocolError::UnsupportedVersion(
                    version.unwrap_or("0.9").to_owned(),
                ))
            }
        }
        log::debug!("Stream opened by peer with id {:?}", header.id());
        self.core.stream_id = header.id().map(str::to_owned);
        self.peer_header = Some(header.clone());
        if self.core.state == StreamState::Opening {
            self.core.state = StreamState::Open;
        }
        Ok(())
    }

    /// Register a stanza handler.
    ///
    /// An empty `namespace` stands for the stream's default namespace.
    pub fn register_handler<F>(
        &mut self,
        namespace: &str,
        name: &str,
        matcher: Matcher,
        priority: Priority,
        handler: F,
    ) -> HandlerId
    where
        F: FnMut(&mut StanzaContext<'_>, &Node) -> ControlFlow<()> + Send + 'static,
    {
        self.register_boxed_handler(namespace, name, matcher, priority, Box::new(handler))
    }

    /// Register an already boxed stanza handler.
    pub fn register_boxed_handler(
        &mut self,
        namespace: &str,
        name: &str,
        matcher: Matcher,
        priority: Priority,
        handler: Handler,
    ) -> HandlerId {
        let namespace = if namespace.is_empty() {
            self.core.default_ns.clone()
        } else {
            namespace.to_owned()
        };
        self.registry
            .register(namespace, name.to_owned(), matcher, priority, handler)
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn unregister_handler(&mut self, id: HandlerId) -> bool {
        self.registry.unregister(id)
    }

    /// Replace the fallback run for stanzas no handler claimed.
    pub fn set_fallback_handler(&mut self, handler: Handler) {
        self.fallback = Some(handler);
    }

    /// Restore the built-in fallback, which answers unhandled iq requests
    /// with `feature-not-implemented`.
    pub fn reset_fallback_handler(&mut self) {
        self.fallback = None;
    }

    /// Send a stanza, assigning an id if it has none. Returns the id.
    pub fn send(&mut self, node: Node) -> Result<String, Error> {
        self.core.send(node, None)
    }

    /// Send a stanza and have `sink` resolved with its reply, a timeout
    /// or the loss of the connection, whichever comes first.
    pub fn send_with_response(
        &mut self,
        node: Node,
        timeout: Option<Duration>,
        sink: ResponseSink,
    ) -> Result<String, Error> {
        self.core.send(node, Some((timeout, sink)))
    }

    /// Send a stanza and return a future resolving with its reply.
    pub fn request(
        &mut self,
        node: Node,
        timeout: Option<Duration>,
    ) -> Result<(String, ResponseToken), Error> {
        let (sink, token) = ResponseSink::channel();
        let id = self.send_with_response(node, timeout, sink)?;
        Ok((id, token))
    }

    /// Send a top-level element as is, without assigning an id, as
    /// needed for `<auth/>`, `<starttls/>` and their kin.
    pub fn send_element(&mut self, node: &Node) -> Result<(), Error> {
        if !self.core.can_send() {
            return Err(Error::Disconnected);
        }
        self.core.push_node(node);
        Ok(())
    }

    /// Queue a single space, keeping idle connections alive.
    pub fn send_whitespace(&mut self) -> Result<(), Error> {
        if !self.core.can_send() {
            return Err(Error::Disconnected);
        }
        self.core
            .outbox
            .push_back(Outbound::Data(Bytes::from_static(b" ")));
        Ok(())
    }

    /// Route one completed stanza.
    ///
    /// A reply to a pending response resolves it and goes no further.
    /// Otherwise handlers run in order: those matching the stanza type,
    /// those matching a child namespace, then those registered for any
    /// stanza of that name. The first to break stops dispatch; if none
    /// does, the fallback runs.
    pub fn dispatch(&mut self, node: Node) -> Dispatched {
        if let Some(entry) = self.core.pending.take_reply(&node) {
            let mut ctx = StanzaContext {
                core: &mut self.core,
            };
            entry.sink.complete(&mut ctx, Ok(node));
            return Dispatched::Response;
        }

        let mut namespace = if node.ns().is_empty() {
            self.core.default_ns.clone()
        } else {
            node.ns().to_owned()
        };
        if !self.registry.knows_namespace(&namespace) && namespace != self.core.default_ns {
            log::warn!(
                "No handlers for namespace {}, dispatching {} as {}",
                namespace,
                node.name(),
                self.core.default_ns
            );
            namespace = self.core.default_ns.clone();
        }

        let mut ctx = StanzaContext {
            core: &mut self.core,
        };
        for id in self.registry.matching(&namespace, &node) {
            if self.registry.invoke(id, &mut ctx, &node).is_break() {
                return Dispatched::Handled;
            }
        }

        match self.fallback.as_mut() {
            Some(fallback) => {
                let _ = fallback(&mut ctx, &node);
            }
            None => builtin_fallback(&mut ctx, &node),
        }
        Dispatched::Fallback
    }

    /// Emit the stream footer and fail all pending responses. Idempotent.
    pub fn close(&mut self) {
        self.core.close()
    }

    /// The transport is gone: resolve every pending response with
    /// [`ResponseError::ConnectionLost`]. Returns how many there were.
    pub fn on_disconnect(&mut self) -> usize {
        self.core.state = StreamState::Closed;
        self.core.outbox.clear();
        self.core.fail_pending(ResponseError::ConnectionLost)
    }

    /// Resolve all pending responses whose deadline is not after `now`
    /// with [`ResponseError::Timeout`]. Returns how many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired = self.core.pending.take_expired(now);
        let count = expired.len();
        for (id, entry) in expired {
            log::debug!("Response to {} timed out", id);
            let mut ctx = StanzaContext {
                core: &mut self.core,
            };
            entry.sink.complete(&mut ctx, Err(ResponseError::Timeout));
        }
        count
    }

    /// The earliest pending response deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.core.pending.next_deadline()
    }

    /// Take the next item to hand to the transport.
    pub fn take_outbound(&mut self) -> Option<Outbound> {
        self.core.outbox.pop_front()
    }

    /// Whether anything waits to be handed to the transport.
    pub fn has_outbound(&self) -> bool {
        !self.core.outbox.is_empty()
    }
}

fn builtin_fallback(ctx: &mut StanzaContext<'_>, node: &Node) {
    if stanza::is_iq_request(node) {
        log::debug!(
            "Answering unhandled iq {:?} with feature-not-implemented",
            node.id()
        );
        let reply =
            stanza::error_reply(node, stanza::DefinedCondition::FeatureNotImplemented, None);
        if let Err(e) = ctx.send(reply) {
            log::debug!("Could not send error reply: {}", e);
        }
    } else {
        log::debug!("Unhandled stanza {}", node.qualified_name());
    }
}
