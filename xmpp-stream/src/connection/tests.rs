// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::atomic::AtomicUsize;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use super::*;
use crate::builder::parse_document;
use crate::config::Timeouts;
use crate::error::{NegotiationFailure, ResponseError};
use crate::negotiation::StaticPassword;
use crate::node::stanza::{self, IqType};
use crate::ns;
use crate::transport::{DnsConfig, StreamTransport};

const HEADER_END: &str = "version=\"1.0\">";

const PEER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
    xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='example.org' version='1.0'>";

const SASL_FEATURES: &str = "<stream:features>\
    <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
    </stream:features>";

const BIND_FEATURES: &str = "<stream:features>\
    <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
    </stream:features>";

fn config() -> ConnectionConfig {
    let mut config = ConnectionConfig::new("juliet@example.org/balcony".parse().unwrap())
        .with_endpoint(Endpoint::Tcp {
            dns: DnsConfig::addr("127.0.0.1:5222"),
            security: SecurityMode::Plain,
        })
        .with_timeouts(Timeouts::tight());
    config.sasl.allow_plain_insecure = true;
    config.keepalive = None;
    config
}

fn connection(config: ConnectionConfig) -> (Connection, ConnectionHandle) {
    Connection::new(config, Box::new(StaticPassword("r0m30".to_owned())))
}

/// The server side of a duplex pipe, consuming what the client sent
/// piece by piece.
struct Server {
    io: DuplexStream,
    buf: Vec<u8>,
}

impl Server {
    fn new(io: DuplexStream) -> Server {
        Server {
            io,
            buf: Vec::new(),
        }
    }

    /// Read until `needle` was sent; return everything up to and
    /// including it.
    async fn expect(&mut self, needle: &str) -> String {
        loop {
            if let Some(pos) = self
                .buf
                .windows(needle.len())
                .position(|w| w == needle.as_bytes())
            {
                let head: Vec<u8> = self.buf.drain(..pos + needle.len()).collect();
                return String::from_utf8(head).unwrap();
            }
            let mut chunk = [0u8; 4096];
            let n = self.io.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client went away while waiting for {:?}", needle);
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn send(&mut self, data: &str) {
        self.io.write_all(data.as_bytes()).await.unwrap();
    }

    /// Play the server part of a PLAIN login with resource binding.
    async fn login(&mut self) {
        self.expect(HEADER_END).await;
        self.send(PEER_HEADER).await;
        self.send(SASL_FEATURES).await;
        let auth = self.expect("</auth>").await;
        assert!(auth.contains("mechanism=\"PLAIN\""), "{}", auth);
        self.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;

        self.expect(HEADER_END).await;
        self.send(PEER_HEADER).await;
        self.send(BIND_FEATURES).await;
        let iq = self.expect("</iq>").await;
        let iq = parse_document(iq.as_bytes()).unwrap();
        assert_eq!(iq.stanza_type(), Some("set"));
        let resource = iq
            .get_child("bind", ns::BIND)
            .and_then(|bind| bind.get_child("resource", ns::BIND))
            .map(Node::text);
        assert_eq!(resource.as_deref(), Some("balcony"));
        self.send(&format!(
            "<iq type='result' id='{}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <jid>juliet@example.org/balcony</jid></bind></iq>",
            iq.id().unwrap()
        ))
        .await;
    }
}

fn start(connection: Connection) -> (tokio::task::JoinHandle<Arc<DisconnectReason>>, Server) {
    let (client, server) = duplex(65536);
    let transport = StreamTransport::new(Box::new(client), false);
    (tokio::spawn(connection.run_on(transport)), Server::new(server))
}

#[tokio::test]
async fn login_then_deferred_send() {
    let (connection, handle) = connection(config());
    let id = handle
        .send(stanza::message("romeo@example.net", Some("chat"), Some("hi")))
        .unwrap();
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    let (task, mut server) = start(connection);

    server.login().await;
    let jid = handle.wait_established().await.unwrap();
    assert_eq!(jid, "juliet@example.org/balcony".parse::<Jid>().unwrap());
    assert_eq!(handle.state(), ConnectionState::Established);
    assert_eq!(handle.status().jid, Some(jid));

    let message = server.expect("</message>").await;
    assert!(message.starts_with("<message"), "{}", message);
    assert!(message.contains(&format!("id=\"{}\"", id)));
    assert!(message.contains("<body>hi</body>"));

    handle.close().unwrap();
    server.expect("</stream:stream>").await;
    let reason = task.await.unwrap();
    assert!(matches!(*reason, DisconnectReason::Requested));
    let status = handle.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.jid, None);
    assert_eq!(status.reason.unwrap().subcode(), "requested");
}

#[tokio::test]
async fn stream_error_reported_once() {
    let (mut connection, handle) = connection(config());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    connection.on_disconnect(move |reason| {
        assert_eq!(reason.subcode(), "stream-error");
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let (task, mut server) = start(connection);

    server.expect(HEADER_END).await;
    server.send(PEER_HEADER).await;
    server
        .send(
            "<stream:error><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
             <text xmlns='urn:ietf:params:xml:ns:xmpp-streams'>no such host</text>\
             </stream:error>",
        )
        .await;

    let reason = task.await.unwrap();
    match &*reason {
        DisconnectReason::StreamError { condition, text } => {
            assert_eq!(condition, "host-unknown");
            assert_eq!(text.as_deref(), Some("no such host"));
        }
        other => panic!("unexpected reason {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let reason = handle.wait_established().await.unwrap_err();
    assert_eq!(reason.subcode(), "stream-error");
    // our side still closes its stream
    server.expect("</stream:stream>").await;
}

#[tokio::test]
async fn responses_and_lost_responses() {
    let (connection, handle) = connection(config());
    let (task, mut server) = start(connection);
    server.login().await;
    handle.wait_established().await.unwrap();

    let ping = || {
        stanza::iq(
            IqType::Get,
            Some("example.org"),
            Some(Node::new("ping", "urn:xmpp:ping")),
        )
    };
    let answered = handle.send_with_response(ping(), None).unwrap();
    let iq = server.expect("</iq>").await;
    let iq = parse_document(iq.as_bytes()).unwrap();
    server
        .send(&format!(
            "<iq type='result' id='{}' from='example.org'/>",
            iq.id().unwrap()
        ))
        .await;
    let reply = answered.await.unwrap();
    assert_eq!(reply.stanza_type(), Some("result"));

    let lost = handle.send_with_response(ping(), None).unwrap();
    server.expect("</iq>").await;
    handle.close().unwrap();
    assert_eq!(lost.await.unwrap_err(), ResponseError::ConnectionLost);
    task.await.unwrap();
}

#[tokio::test]
async fn handlers_and_fallback() {
    let (connection, handle) = connection(config());
    let (task, mut server) = start(connection);
    server.login().await;
    handle.wait_established().await.unwrap();

    let id = handle
        .register_handler(
            "",
            "message",
            Matcher::ByType("chat".to_owned()),
            Priority::Normal,
            |ctx: &mut StanzaContext<'_>, node: &Node| {
                let from = node.attr("from").unwrap_or_default().to_owned();
                let _ = ctx.send(stanza::message(&from, Some("chat"), Some("pong")));
                ControlFlow::Break(())
            },
        )
        .await
        .unwrap();
    server
        .send("<message from='romeo@example.net/orchard' type='chat' id='m1'><body>ping</body></message>")
        .await;
    let reply = server.expect("</message>").await;
    assert!(reply.contains("to=\"romeo@example.net/orchard\""), "{}", reply);
    assert!(reply.contains("<body>pong</body>"));

    server
        .send("<iq type='get' id='v1' from='example.org'><query xmlns='jabber:iq:version'/></iq>")
        .await;
    let error = server.expect("</iq>").await;
    assert!(error.contains("feature-not-implemented"), "{}", error);
    assert!(error.contains("id=\"v1\""));

    assert!(handle.unregister_handler(id).await.unwrap());
    assert!(!handle.unregister_handler(id).await.unwrap());

    handle.close().unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn peer_closes_stream() {
    let (connection, handle) = connection(config());
    let (task, mut server) = start(connection);
    server.login().await;
    handle.wait_established().await.unwrap();

    server.send("</stream:stream>").await;
    server.expect("</stream:stream>").await;
    let reason = task.await.unwrap();
    assert!(matches!(*reason, DisconnectReason::RemoteClosed));
}

#[tokio::test]
async fn dropping_handles_closes() {
    let (connection, handle) = connection(config());
    let (task, mut server) = start(connection);
    server.login().await;
    handle.wait_established().await.unwrap();

    drop(handle);
    server.expect("</stream:stream>").await;
    let reason = task.await.unwrap();
    assert!(matches!(*reason, DisconnectReason::Requested));
}

#[tokio::test]
async fn garbage_is_a_parse_error() {
    let (connection, _handle) = connection(config());
    let (task, mut server) = start(connection);
    server.expect(HEADER_END).await;
    server.send(PEER_HEADER).await;
    server.send("<stream:features></oops>").await;
    let reason = task.await.unwrap();
    assert_eq!(reason.subcode(), "parse-error");
}

#[tokio::test]
async fn rejected_header_stops_negotiation() {
    let (connection, _handle) = connection(config());
    let (task, mut server) = start(connection);
    server.expect(HEADER_END).await;
    let old_header = PEER_HEADER.replace(
        "from='example.org' version='1.0'",
        "from='example.org' version='0.9'",
    );
    server.send(&format!("{}{}", old_header, SASL_FEATURES)).await;
    let sent = server.expect("</stream:stream>").await;
    assert!(!sent.contains("<auth"), "{}", sent);
    let reason = task.await.unwrap();
    assert_eq!(reason.subcode(), "protocol-violation");
}

#[cfg(feature = "tls-rust")]
#[tokio::test]
async fn plaintext_after_proceed_rejected() {
    let mut config = config();
    config.endpoint = Endpoint::Tcp {
        dns: DnsConfig::addr("127.0.0.1:5222"),
        security: SecurityMode::StartTlsRequired,
    };
    let (connection, _handle) = connection(config);
    let (task, mut server) = start(connection);
    server.expect(HEADER_END).await;
    server.send(PEER_HEADER).await;
    server
        .send(
            "<stream:features>\
             <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
             </stream:features>",
        )
        .await;
    server.expect("<starttls").await;
    server
        .send("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/><stream:features>")
        .await;
    let reason = task.await.unwrap();
    assert!(matches!(
        &*reason,
        DisconnectReason::Protocol(ProtocolError::DataAfterProceed)
    ));
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out() {
    let (connection, handle) = connection(config());
    let (task, mut server) = start(connection);
    server.expect(HEADER_END).await;
    server.send(PEER_HEADER).await;
    assert!(matches!(
        handle.state(),
        ConnectionState::Negotiating(NegotiationState::AwaitingFeatures)
    ));

    let reason = task.await.unwrap();
    assert!(matches!(
        *reason,
        DisconnectReason::Negotiation(NegotiationFailure::Timeout)
    ));
}

#[tokio::test(start_paused = true)]
async fn whitespace_keepalive() {
    let mut config = config();
    config.keepalive = Some(Duration::from_secs(60));
    let (connection, handle) = connection(config);
    let (task, mut server) = start(connection);
    server.login().await;
    handle.wait_established().await.unwrap();

    let before = Instant::now();
    assert_eq!(server.expect(" ").await, " ");
    assert!(Instant::now() - before >= Duration::from_secs(59));

    handle.close().unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn connect_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = config().with_endpoint(Endpoint::Tcp {
        dns: DnsConfig::addr(&addr.to_string()),
        security: SecurityMode::Plain,
    });
    let (connection, handle) = connection(config);
    let pending = handle
        .send_with_response(stanza::presence(None, None), None)
        .unwrap();
    let reason = connection.run().await;
    assert!(matches!(*reason, DisconnectReason::ConnectFailed(_)));
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert_eq!(pending.await.unwrap_err(), ResponseError::ConnectionLost);
}
