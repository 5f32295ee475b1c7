// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Connection driver
//!
//! A [`Connection`] owns the transport, the [`StreamSession`] and the
//! [`NegotiationPipeline`] of one client connection and runs them on a
//! single task: one `select!` over the transport, the command channel and
//! the earliest pending deadline. Applications talk to it through cloneable
//! [`ConnectionHandle`]s.
//!
//! ```no_run
//! # async fn demo() -> Result<(), xmpp_stream::Error> {
//! use xmpp_stream::{Connection, ConnectionConfig};
//! use xmpp_stream::negotiation::StaticPassword;
//! use xmpp_stream::node::stanza;
//!
//! let config = ConnectionConfig::new("juliet@example.org/balcony".parse()?);
//! let (connection, handle) =
//!     Connection::new(config, Box::new(StaticPassword("r0m30".to_owned())));
//! tokio::spawn(connection.run());
//! // queued until the stream is established
//! handle.send(stanza::presence(None, None))?;
//! # Ok(())
//! # }
//! ```
//!
//! The connection is never re-established: once it is down, the reason is
//! reported through [`ConnectionHandle::status`], the return value of
//! [`Connection::run`] and the callback given to
//! [`Connection::on_disconnect`], and a new [`Connection`] must be created.

use core::future::pending;
use core::ops::ControlFlow;
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use jid::Jid;
use rand::{thread_rng, Rng};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::builder::StreamItem;
use crate::config::{ConnectionConfig, Endpoint, SecurityMode};
use crate::error::{DisconnectReason, Error, ProtocolError, TransportError};
use crate::negotiation::{
    NegotiationPipeline, NegotiationState, PasswordProvider, Step, TlsPolicy,
};
use crate::node::Node;
use crate::session::{
    stream_error, Handler, HandlerId, Matcher, Outbound, Priority, ResponseSink, ResponseToken,
    StanzaContext, StreamSession, StreamState, STREAM_FOOTER,
};
use crate::traffic::{Direction, LogTraffic, TrafficLog};
use crate::transport::{ByteTransport, Transport};

/// Externally visible phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not running, or finished
    Disconnected,
    /// Establishing the transport
    Connecting,
    /// The stream is open and being negotiated
    Negotiating(NegotiationState),
    /// Application stanzas flow
    Established,
    /// Flushing and shutting the transport down
    Disconnecting,
}

/// Snapshot published on every state change.
#[derive(Debug, Clone)]
pub struct Status {
    /// Current phase
    pub state: ConnectionState,
    /// Address bound by the server, while established
    pub jid: Option<Jid>,
    /// Why the connection ended, once it has
    pub reason: Option<Arc<DisconnectReason>>,
}

impl Status {
    fn initial() -> Status {
        Status {
            state: ConnectionState::Disconnected,
            jid: None,
            reason: None,
        }
    }
}

type SendResponse = Option<(Option<Duration>, ResponseSink)>;

enum Command {
    Send {
        node: Node,
        response: SendResponse,
    },
    Register {
        namespace: String,
        name: String,
        matcher: Matcher,
        priority: Priority,
        handler: Handler,
        reply: oneshot::Sender<HandlerId>,
    },
    Unregister {
        id: HandlerId,
        reply: oneshot::Sender<bool>,
    },
    Close,
}

/// Stanza ids handed out by handles, so `send` can report them before
/// the stanza reaches the session.
struct IdSource {
    prefix: String,
    counter: AtomicU64,
}

impl IdSource {
    fn new() -> IdSource {
        let prefix: u32 = thread_rng().gen();
        IdSource {
            prefix: format!("h{:08x}", prefix),
            counter: AtomicU64::new(0),
        }
    }

    fn assign(&self, node: &mut Node) -> String {
        match node.id() {
            Some(id) => id.to_owned(),
            None => {
                let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
                let id = format!("{}-{}", self.prefix, n);
                node.set_id(id.clone());
                id
            }
        }
    }
}

/// Application-side handle of a [`Connection`].
///
/// Dropping every handle closes the connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
    ids: Arc<IdSource>,
}

impl ConnectionHandle {
    fn command(&self, command: Command) -> Result<(), Error> {
        self.commands.send(command).map_err(|_| Error::Disconnected)
    }

    /// Send a stanza, assigning an id if it has none. Returns the id.
    ///
    /// Stanzas sent before the stream is established are queued and sent
    /// in order once it is.
    pub fn send(&self, mut node: Node) -> Result<String, Error> {
        let id = self.ids.assign(&mut node);
        self.command(Command::Send {
            node,
            response: None,
        })?;
        Ok(id)
    }

    /// Send a stanza and wait for its reply.
    ///
    /// Without an explicit `timeout`, [`crate::config::Timeouts::response`]
    /// applies.
    pub fn send_with_response(
        &self,
        mut node: Node,
        timeout: Option<Duration>,
    ) -> Result<ResponseToken, Error> {
        self.ids.assign(&mut node);
        let (sink, token) = ResponseSink::channel();
        self.command(Command::Send {
            node,
            response: Some((timeout, sink)),
        })?;
        Ok(token)
    }

    /// Register a stanza handler on the running connection.
    pub async fn register_handler<F>(
        &self,
        namespace: &str,
        name: &str,
        matcher: Matcher,
        priority: Priority,
        handler: F,
    ) -> Result<HandlerId, Error>
    where
        F: FnMut(&mut StanzaContext<'_>, &Node) -> ControlFlow<()> + Send + 'static,
    {
        let (reply, id) = oneshot::channel();
        self.command(Command::Register {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            matcher,
            priority,
            handler: Box::new(handler),
            reply,
        })?;
        id.await.map_err(|_| Error::Disconnected)
    }

    /// Remove a handler. Returns whether it was registered.
    pub async fn unregister_handler(&self, id: HandlerId) -> Result<bool, Error> {
        let (reply, removed) = oneshot::channel();
        self.command(Command::Unregister { id, reply })?;
        removed.await.map_err(|_| Error::Disconnected)
    }

    /// Close the stream and shut the connection down.
    pub fn close(&self) -> Result<(), Error> {
        self.command(Command::Close)
    }

    /// Current phase of the connection.
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// A receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    /// Wait until the stream is established, returning the bound address,
    /// or until the connection ended, returning why.
    pub async fn wait_established(&self) -> Result<Jid, Arc<DisconnectReason>> {
        let mut status = self.status.clone();
        let result = status
            .wait_for(|s| s.state == ConnectionState::Established || s.reason.is_some())
            .await;
        match result {
            Ok(status) => match (&status.reason, &status.jid) {
                (Some(reason), _) => Err(Arc::clone(reason)),
                (None, Some(jid)) => Ok(jid.clone()),
                (None, None) => Err(Arc::new(DisconnectReason::Requested)),
            },
            // the connection was dropped without running
            Err(_) => Err(Arc::new(DisconnectReason::Requested)),
        }
    }
}

type DisconnectCallback = Box<dyn FnOnce(&DisconnectReason) + Send>;

/// One client connection, to be driven by [`Connection::run`].
pub struct Connection {
    config: ConnectionConfig,
    password: Box<dyn PasswordProvider>,
    session: StreamSession,
    traffic: Box<dyn TrafficLog>,
    on_disconnect: Option<DisconnectCallback>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<Status>,
}

impl Connection {
    /// Create a connection and its first handle. Nothing happens until
    /// [`Self::run`] is awaited.
    pub fn new(
        config: ConnectionConfig,
        password: Box<dyn PasswordProvider>,
    ) -> (Connection, ConnectionHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(Status::initial());
        let session = StreamSession::with_max_buffer(config.max_buffer);
        let connection = Connection {
            config,
            password,
            session,
            traffic: Box::new(LogTraffic),
            on_disconnect: None,
            commands,
            status,
        };
        let handle = ConnectionHandle {
            commands: commands_tx,
            status: status_rx,
            ids: Arc::new(IdSource::new()),
        };
        (connection, handle)
    }

    /// Register a stanza handler before the connection runs.
    ///
    /// An empty `namespace` stands for the configured default namespace.
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
        let namespace = if namespace.is_empty() {
            self.config.default_ns.as_str()
        } else {
            namespace
        };
        self.session
            .register_handler(namespace, name, matcher, priority, handler)
    }

    /// Replace the handler run for stanzas nobody else handled.
    pub fn set_fallback_handler(&mut self, handler: Handler) {
        self.session.set_fallback_handler(handler);
    }

    /// Replace the sink receiving raw traffic. The default traces it
    /// through `log`.
    pub fn set_traffic_log(&mut self, traffic: Box<dyn TrafficLog>) {
        self.traffic = traffic;
    }

    /// Have `callback` called once with the reason the connection ended.
    pub fn on_disconnect<F>(&mut self, callback: F)
    where
        F: FnOnce(&DisconnectReason) + Send + 'static,
    {
        self.on_disconnect = Some(Box::new(callback));
    }

    /// Establish the configured transport and run the connection until
    /// it ends.
    pub async fn run(mut self) -> Arc<DisconnectReason> {
        self.publish(|s| s.state = ConnectionState::Connecting);
        log::debug!("Connecting to {:?}", self.config.endpoint);
        match Transport::connect(&self.config).await {
            Ok(transport) => self.run_on(transport).await,
            Err(e) => {
                log::debug!("Connection failed: {}", e);
                self.session.on_disconnect();
                self.finish(DisconnectReason::ConnectFailed(e))
            }
        }
    }

    /// Run the connection over an already established transport.
    pub async fn run_on<T: ByteTransport>(mut self, transport: T) -> Arc<DisconnectReason> {
        let mode = match &self.config.endpoint {
            Endpoint::Tcp { security, .. } => *security,
            Endpoint::Bosh(_) => SecurityMode::Plain,
        };
        let tls = TlsPolicy {
            mode,
            secure: transport.is_secure(),
            starttls_supported: transport.supports_starttls(),
        };
        let mut pipeline = NegotiationPipeline::new(
            self.config.jid.clone(),
            self.config.sasl.clone(),
            tls,
            core::mem::replace(&mut self.password, Box::new(|| None::<String>)),
        );
        pipeline.set_step_timeout(self.config.timeouts.response);

        let session = core::mem::take(&mut self.session);
        let traffic = core::mem::replace(&mut self.traffic, Box::new(LogTraffic));
        let keepalive = self
            .config
            .keepalive
            .filter(|_| transport.supports_keepalive());
        let mut driver = Driver {
            transport,
            session,
            pipeline,
            traffic,
            domain: self.config.domain().to_owned(),
            deferred: VecDeque::new(),
            established: false,
            keepalive,
            last_sent: Instant::now(),
            status: &self.status,
        };
        driver.session.set_lang(self.config.lang.clone());
        driver
            .session
            .set_default_response_timeout(Some(self.config.timeouts.response));
        driver
            .session
            .set_qualified_stanzas(driver.transport.qualified_stanzas());
        driver
            .session
            .open(&driver.domain, &self.config.default_ns, None);
        driver.pipeline.start();
        driver.publish_negotiating();

        let reason = driver.run(&mut self.commands).await;
        log::debug!("Disconnecting: {}", reason);
        self.publish(|s| s.state = ConnectionState::Disconnecting);
        driver.shutdown(self.config.timeouts.disconnect).await;
        drop(driver);
        self.finish(reason)
    }

    fn publish<F: FnOnce(&mut Status)>(&self, modify: F) {
        self.status.send_modify(modify);
    }

    fn finish(&mut self, reason: DisconnectReason) -> Arc<DisconnectReason> {
        if let Some(callback) = self.on_disconnect.take() {
            callback(&reason);
        }
        let reason = Arc::new(reason);
        self.publish(|s| {
            s.state = ConnectionState::Disconnected;
            s.jid = None;
            s.reason = Some(Arc::clone(&reason));
        });
        reason
    }
}

fn error_reason(e: Error) -> DisconnectReason {
    match e {
        Error::Parse(e) => DisconnectReason::Parse(e),
        Error::Protocol(e) => DisconnectReason::Protocol(e),
        Error::Negotiation(e) => DisconnectReason::Negotiation(e),
        Error::Transport(e) => DisconnectReason::Transport(e),
        Error::Connect(e) => DisconnectReason::ConnectFailed(e),
        Error::Io(e) => DisconnectReason::Transport(TransportError::Io(e)),
        e => {
            log::debug!("Stream no longer usable: {}", e);
            DisconnectReason::Transport(TransportError::Closed)
        }
    }
}

struct Driver<'a, T> {
    transport: T,
    session: StreamSession,
    pipeline: NegotiationPipeline,
    traffic: Box<dyn TrafficLog>,
    domain: String,
    // application sends waiting for the stream to be established
    deferred: VecDeque<(Node, SendResponse)>,
    established: bool,
    keepalive: Option<Duration>,
    last_sent: Instant,
    status: &'a watch::Sender<Status>,
}

impl<T: ByteTransport> Driver<'_, T> {
    async fn run(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> DisconnectReason {
        loop {
            if matches!(
                self.session.state(),
                StreamState::Closing | StreamState::Closed
            ) {
                break DisconnectReason::Requested;
            }
            if let Err(e) = self.pump() {
                break e.into();
            }

            let deadline = self.next_deadline();
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => pending().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        log::debug!("All handles dropped, closing the stream");
                        self.session.close();
                    }
                },
                data = self.transport.read() => match data {
                    Ok(data) if data.is_empty() => {
                        break if self.session.remote_closed() {
                            DisconnectReason::RemoteClosed
                        } else {
                            DisconnectReason::Transport(TransportError::Closed)
                        };
                    }
                    Ok(data) => {
                        self.traffic.record(Direction::Inbound, Utc::now(), &data);
                        if let Err(reason) = self.on_data(&data).await {
                            break reason;
                        }
                    }
                    Err(e) => break e.into(),
                },
                () = timer => {
                    if let Err(reason) = self.on_timer(Instant::now()) {
                        break reason;
                    }
                }
            }
        }
    }

    fn publish_negotiating(&self) {
        let state = ConnectionState::Negotiating(self.pipeline.state());
        self.status.send_if_modified(|s| {
            if s.state == state {
                return false;
            }
            s.state = state;
            true
        });
    }

    /// Hand everything the session queued to the transport.
    fn pump(&mut self) -> Result<(), TransportError> {
        while let Some(outbound) = self.session.take_outbound() {
            match outbound {
                Outbound::Header(header) => {
                    self.record_sent(&header.to_bytes());
                    self.transport.open_stream(&header)?;
                }
                Outbound::Data(data) => {
                    self.record_sent(&data);
                    self.transport.write(data)?;
                }
                Outbound::Footer => {
                    self.record_sent(STREAM_FOOTER);
                    self.transport.close_stream()?;
                }
            }
        }
        Ok(())
    }

    fn record_sent(&mut self, data: &[u8]) {
        self.traffic.record(Direction::Outbound, Utc::now(), data);
        self.last_sent = Instant::now();
    }

    fn next_deadline(&self) -> Option<Instant> {
        let negotiation = if self.established {
            None
        } else {
            self.pipeline.deadline()
        };
        let keepalive = self
            .keepalive
            .filter(|_| self.established)
            .map(|interval| self.last_sent + interval);
        [self.session.next_deadline(), negotiation, keepalive]
            .into_iter()
            .flatten()
            .min()
    }

    fn on_timer(&mut self, now: Instant) -> Result<(), DisconnectReason> {
        self.session.expire(now);
        if !self.established {
            self.pipeline.check_deadline(now)?;
        }
        if let Some(interval) = self.keepalive {
            if self.established && self.last_sent + interval <= now {
                log::trace!("Sending whitespace keepalive");
                self.session.send_whitespace().map_err(error_reason)?;
            }
        }
        Ok(())
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { node, response } if !self.established => {
                log::debug!("Stream not established yet, deferring {}", node.name());
                self.deferred.push_back((node, response));
            }
            Command::Send { node, response } => self.send(node, response),
            Command::Register {
                namespace,
                name,
                matcher,
                priority,
                handler,
                reply,
            } => {
                let id = self
                    .session
                    .register_boxed_handler(&namespace, &name, matcher, priority, handler);
                log::debug!("Registered handler {:?} for {} {}", id, namespace, name);
                let _ = reply.send(id);
            }
            Command::Unregister { id, reply } => {
                let _ = reply.send(self.session.unregister_handler(id));
            }
            Command::Close => {
                log::debug!("Close requested");
                self.session.close();
            }
        }
    }

    fn send(&mut self, node: Node, response: SendResponse) {
        let name = node.name().to_owned();
        let result = match response {
            Some((timeout, sink)) => self.session.send_with_response(node, timeout, sink),
            None => self.session.send(node),
        };
        if let Err(e) = result {
            log::warn!("Dropping {}: {}", name, e);
        }
    }

    async fn on_data(&mut self, data: &[u8]) -> Result<(), DisconnectReason> {
        let mut items = Vec::new();
        // items after a rejected header are never returned
        let fed = self.session.feed(data, &mut items);
        let mut upgrade = false;
        for item in items {
            if upgrade {
                return Err(DisconnectReason::Protocol(ProtocolError::DataAfterProceed));
            }
            upgrade = self.on_item(item)?;
        }
        fed.map_err(error_reason)?;
        if upgrade {
            self.starttls().await?;
        }
        Ok(())
    }

    // Returns whether the TLS handshake has to start.
    fn on_item(&mut self, item: StreamItem) -> Result<bool, DisconnectReason> {
        let node = match item {
            StreamItem::Header(header) => {
                log::debug!("Received stream header from {:?}", header.from());
                return Ok(false);
            }
            StreamItem::Footer => {
                log::debug!("Peer closed the stream");
                return Err(DisconnectReason::RemoteClosed);
            }
            StreamItem::Stanza(node) => node,
        };

        if let Some((condition, text)) = stream_error(&node) {
            log::warn!("Received stream error {} {:?}", condition, text);
            return Err(DisconnectReason::StreamError { condition, text });
        }

        if self.established {
            self.session.dispatch(node);
            return Ok(false);
        }

        let step = self
            .pipeline
            .handle(&mut self.session, &node)
            .map_err(error_reason)?;
        match step {
            Step::Continue => self.publish_negotiating(),
            Step::StartTls => return Ok(true),
            Step::Established(jid) => self.on_established(jid),
        }
        Ok(false)
    }

    async fn starttls(&mut self) -> Result<(), DisconnectReason> {
        if self.session.has_pending_input() {
            return Err(DisconnectReason::Protocol(ProtocolError::DataAfterProceed));
        }
        self.publish_negotiating();
        self.pump()?;
        self.transport.flush().await?;
        log::debug!("Starting TLS handshake with {}", self.domain);
        match self.transport.starttls(&self.domain).await {
            Ok(()) => {
                self.pipeline.tls_established(&mut self.session);
                self.publish_negotiating();
                Ok(())
            }
            Err(e) => Err(self.pipeline.tls_failed(e.to_string()).into()),
        }
    }

    fn on_established(&mut self, jid: Jid) {
        log::debug!("Stream established as {}", jid);
        self.established = true;
        self.status.send_modify(|s| {
            s.state = ConnectionState::Established;
            s.jid = Some(jid);
        });
        while let Some((node, response)) = self.deferred.pop_front() {
            self.send(node, response);
        }
    }

    /// Send our footer if the stream is still open, flush and shut the
    /// transport down, giving up after `timeout`.
    async fn shutdown(&mut self, timeout: Duration) {
        self.session.close();
        let pumped = self.pump();
        let transport = &mut self.transport;
        let closing = async {
            if let Err(e) = pumped {
                log::debug!("Could not queue stream footer: {}", e);
            } else if let Err(e) = transport.flush().await {
                log::debug!("Flush during shutdown failed: {}", e);
            }
            transport.disconnect().await;
        };
        if tokio::time::timeout(timeout, closing).await.is_err() {
            log::debug!("Giving up on clean stream shutdown after timeout elapsed.");
        }
        let lost = self.session.on_disconnect();
        if lost > 0 {
            log::debug!("{} pending responses lost with the connection", lost);
        }
        // anything the application queued after the end goes nowhere
        self.deferred.clear();
    }
}

#[cfg(test)]
mod tests;
