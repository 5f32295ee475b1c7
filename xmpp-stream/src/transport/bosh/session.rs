// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! BOSH session bookkeeping (XEP-0124, XEP-0206), without any I/O.
//!
//! [`BoshSession`] decides which `<body/>` to send next, numbers requests,
//! and turns responses, which may complete in any order, back into an
//! in-order XML byte stream for the stanza builder. That stream starts
//! with a synthetic `<stream:stream>` header on session creation and on
//! every restart, since BOSH carries no real stream root.

use core::time::Duration;
use std::collections::{BTreeMap, VecDeque};

use bytes::{BufMut, Bytes, BytesMut};
use rand::{thread_rng, Rng};
use tokio::time::Instant;

use crate::builder::parse_document;
use crate::config::BoshConfig;
use crate::error::BoshError;
use crate::node::{escape_attr, Node};
use crate::ns;
use crate::session::{OpenStream, STREAM_FOOTER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Creating,
    Active,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Create,
    Restart,
    Data,
    Poll,
    Terminate,
}

/// State of one BOSH session.
pub struct BoshSession {
    config: BoshConfig,
    to: String,
    lang: Option<String>,
    default_ns: String,
    phase: Phase,

    sid: Option<String>,
    authid: Option<String>,
    version: String,
    requests: usize,
    inactivity: Option<Duration>,
    polling: Option<Duration>,

    next_rid: u64,
    // rid whose response is handed out next
    next_release: u64,
    inflight: BTreeMap<u64, RequestKind>,
    arrived: BTreeMap<u64, (RequestKind, Node)>,

    create_sent: bool,
    restart_pending: bool,
    terminate_pending: bool,
    // reported once everything released before it was taken
    failure: Option<BoshError>,
    outgoing: BytesMut,
    inbound: VecDeque<Bytes>,
    poll_not_before: Option<Instant>,
}

fn put_attr(out: &mut BytesMut, name: &str, value: &str) {
    out.put_u8(b' ');
    out.put_slice(name.as_bytes());
    out.put_slice(b"=\"");
    escape_attr(out, value);
    out.put_u8(b'"');
}

fn parse_attr<T: core::str::FromStr>(body: &Node, name: &str) -> Result<Option<T>, BoshError> {
    body.attr(name)
        .map(|value| {
            value
                .parse()
                .map_err(|_| BoshError::InvalidBody(format!("bad {} attribute {:?}", name, value)))
        })
        .transpose()
}

// The error a response ends the session with, if any. A plain terminate
// answering our own terminate request is the normal end.
fn failure_of(kind: RequestKind, body: &Node) -> Option<BoshError> {
    if !matches!(body.attr("type"), Some("terminate") | Some("error")) {
        return None;
    }
    let condition = body.attr("condition").map(str::to_owned);
    if kind == RequestKind::Terminate && condition.is_none() {
        return None;
    }
    Some(BoshError::Terminated { condition })
}

// Stanzas are sent without a namespace of their own and inherit the
// httpbind namespace from <body/>.
fn requalify(node: &mut Node, default_ns: &str) {
    if node.ns() == ns::HTTPBIND {
        node.set_ns(default_ns);
    }
    for child in node.children_mut() {
        requalify(child, default_ns);
    }
}

impl BoshSession {
    /// A session to be created with the connection manager at
    /// `config.url`.
    pub fn new(config: BoshConfig) -> BoshSession {
        // 2^20 <= rid < 2^50 leaves room for a lifetime of requests
        // below 2^53
        let rid = thread_rng().gen_range((1u64 << 20)..(1u64 << 50));
        BoshSession::with_rid(config, rid)
    }

    fn with_rid(config: BoshConfig, rid: u64) -> BoshSession {
        let requests = config.requests.max(1) as usize;
        BoshSession {
            config,
            to: String::new(),
            lang: None,
            default_ns: ns::JABBER_CLIENT.to_owned(),
            phase: Phase::Idle,
            sid: None,
            authid: None,
            version: "1.0".to_owned(),
            requests,
            inactivity: None,
            polling: None,
            next_rid: rid,
            next_release: rid,
            inflight: BTreeMap::new(),
            arrived: BTreeMap::new(),
            create_sent: false,
            restart_pending: false,
            terminate_pending: false,
            failure: None,
            outgoing: BytesMut::new(),
            inbound: VecDeque::new(),
            poll_not_before: None,
        }
    }

    /// Session id assigned by the connection manager.
    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    /// Longest time the connection manager holds a request.
    pub fn wait(&self) -> Duration {
        self.config.wait
    }

    /// Time after which an outstanding request is considered lost.
    pub fn request_timeout(&self) -> Duration {
        self.config.wait + self.config.grace
    }

    /// Number of simultaneous requests allowed.
    pub fn max_requests(&self) -> usize {
        self.requests
    }

    /// Longest allowed silence, as announced by the server.
    pub fn inactivity(&self) -> Option<Duration> {
        self.inactivity
    }

    /// Number of requests awaiting a response.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// No empty poll may be sent before this instant.
    pub fn poll_not_before(&self) -> Option<Instant> {
        self.poll_not_before
    }

    /// Whether the session has ended and all received data was taken.
    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Terminated && self.inbound.is_empty()
    }

    /// Start the session, or restart the stream inside it.
    pub fn open(&mut self, header: &OpenStream) {
        match self.phase {
            Phase::Idle => {
                self.to = header.to.clone();
                self.lang = header.lang.clone();
                self.default_ns = header.default_ns.clone();
                self.phase = Phase::Creating;
            }
            Phase::Creating | Phase::Active => self.restart_pending = true,
            Phase::Terminating | Phase::Terminated => (),
        }
    }

    /// Queue serialized stanzas.
    pub fn queue(&mut self, data: &[u8]) -> Result<(), BoshError> {
        if matches!(self.phase, Phase::Terminating | Phase::Terminated) {
            return Err(BoshError::Terminated { condition: None });
        }
        if self.outgoing.len() + data.len() > self.config.max_pending {
            return Err(BoshError::Overflow);
        }
        self.outgoing.extend_from_slice(data);
        Ok(())
    }

    /// End the session; queued stanzas go out with the terminating body.
    pub fn terminate(&mut self) {
        match self.phase {
            Phase::Idle => self.phase = Phase::Terminated,
            Phase::Creating | Phase::Active => self.terminate_pending = true,
            Phase::Terminating | Phase::Terminated => (),
        }
    }

    /// The next request to send, if the request policy allows one now.
    ///
    /// Data goes out as soon as a request slot is free. When nothing is
    /// outstanding an empty request is sent so the server always holds one
    /// to answer with pushed data.
    pub fn next_request(&mut self, now: Instant) -> Option<(u64, Bytes)> {
        let (kind, payload) = match self.phase {
            Phase::Idle | Phase::Terminating | Phase::Terminated => return None,
            Phase::Creating => {
                if self.create_sent {
                    return None;
                }
                self.create_sent = true;
                (RequestKind::Create, Bytes::new())
            }
            Phase::Active => {
                if self.inflight.len() >= self.requests {
                    return None;
                }
                if self.restart_pending {
                    self.restart_pending = false;
                    (RequestKind::Restart, Bytes::new())
                } else if self.terminate_pending {
                    self.phase = Phase::Terminating;
                    (RequestKind::Terminate, self.outgoing.split().freeze())
                } else if !self.outgoing.is_empty() {
                    (RequestKind::Data, self.outgoing.split().freeze())
                } else if self.inflight.is_empty()
                    && self.poll_not_before.map_or(true, |t| now >= t)
                {
                    (RequestKind::Poll, Bytes::new())
                } else {
                    return None;
                }
            }
        };
        let rid = self.next_rid;
        self.next_rid += 1;
        self.inflight.insert(rid, kind);
        Some((rid, self.body(kind, rid, &payload)))
    }

    fn body(&self, kind: RequestKind, rid: u64, payload: &[u8]) -> Bytes {
        let mut out = BytesMut::new();
        out.put_slice(b"<body");
        put_attr(&mut out, "xmlns", ns::HTTPBIND);
        put_attr(&mut out, "rid", &rid.to_string());
        match kind {
            RequestKind::Create => {
                put_attr(&mut out, "content", &self.config.content_type);
                put_attr(&mut out, "hold", &self.config.hold.to_string());
                put_attr(&mut out, "to", &self.to);
                put_attr(&mut out, "wait", &self.config.wait.as_secs().to_string());
                put_attr(&mut out, "ver", &self.config.ver);
                if let Some(route) = self.config.route.as_ref() {
                    put_attr(&mut out, "route", route);
                }
                if let Some(lang) = self.lang.as_ref() {
                    put_attr(&mut out, "xml:lang", lang);
                }
                put_attr(&mut out, "xmlns:xmpp", ns::XBOSH);
                put_attr(&mut out, "xmpp:version", "1.0");
            }
            _ => {
                if let Some(sid) = self.sid.as_ref() {
                    put_attr(&mut out, "sid", sid);
                }
                // acknowledge when earlier requests are still unanswered
                if self.next_release < rid {
                    put_attr(&mut out, "ack", &(self.next_release - 1).to_string());
                }
                match kind {
                    RequestKind::Restart => {
                        put_attr(&mut out, "to", &self.to);
                        if let Some(lang) = self.lang.as_ref() {
                            put_attr(&mut out, "xml:lang", lang);
                        }
                        put_attr(&mut out, "xmlns:xmpp", ns::XBOSH);
                        put_attr(&mut out, "xmpp:restart", "true");
                    }
                    RequestKind::Terminate => put_attr(&mut out, "type", "terminate"),
                    _ => (),
                }
            }
        }
        if payload.is_empty() {
            out.put_slice(b"/>");
        } else {
            out.put_u8(b'>');
            out.put_slice(payload);
            out.put_slice(b"</body>");
        }
        out.freeze()
    }

    /// Handle the HTTP response body for request `rid`.
    ///
    /// Responses are released to [`Self::take_inbound`] in rid order, so
    /// data from a later request waits for all earlier ones. This holds
    /// for a body ending the session too: its error is only handed out by
    /// [`Self::take_failure`] once everything before it was released.
    pub fn on_response(&mut self, rid: u64, data: &[u8], now: Instant) -> Result<(), BoshError> {
        let kind = self
            .inflight
            .remove(&rid)
            .ok_or(BoshError::UnexpectedRid(rid))?;
        let body = parse_document(data).map_err(|e| BoshError::InvalidBody(e.to_string()))?;
        if !body.is("body", ns::HTTPBIND) {
            return Err(BoshError::InvalidBody(format!(
                "unexpected root element {}",
                body.qualified_name()
            )));
        }
        if failure_of(kind, &body).is_some() {
            // the server is done with us, only earlier responses may follow
            self.phase = Phase::Terminating;
        } else if kind == RequestKind::Poll && body.is_empty() && self.config.hold == 0 {
            if let Some(delay) = self.poll_delay() {
                self.poll_not_before = Some(now + delay);
            }
        }

        self.arrived.insert(rid, (kind, body));
        while let Some((kind, body)) = self.arrived.remove(&self.next_release) {
            self.next_release += 1;
            self.release(kind, body)?;
        }
        Ok(())
    }

    // Polling sessions (hold=0) must space out their empty requests, but
    // not so far that the server gives up on an idle client.
    fn poll_delay(&self) -> Option<Duration> {
        match (self.polling, self.inactivity) {
            (Some(polling), Some(inactivity)) => Some(polling.min(inactivity / 2)),
            (polling, _) => polling,
        }
    }

    fn release(&mut self, kind: RequestKind, mut body: Node) -> Result<(), BoshError> {
        let failure = failure_of(kind, &body);
        let mut out = BytesMut::new();
        match (kind, &failure) {
            (RequestKind::Create, None) => {
                self.accept_session(&body)?;
                self.write_header(&mut out);
            }
            (RequestKind::Restart, None) => self.write_header(&mut out),
            _ => (),
        }
        for child in body.children_mut() {
            requalify(child, &self.default_ns);
            child.write_to(&mut out, &self.default_ns);
        }
        if !out.is_empty() {
            self.inbound.push_back(out.freeze());
        }
        if let Some(failure) = failure {
            log::debug!("BOSH session {:?} ended by the server: {}", self.sid, failure);
            self.phase = Phase::Terminated;
            self.inflight.clear();
            self.arrived.clear();
            self.failure = Some(failure);
        } else if kind == RequestKind::Terminate {
            self.finish();
        }
        Ok(())
    }

    fn finish(&mut self) {
        log::debug!("BOSH session {:?} terminated", self.sid);
        self.phase = Phase::Terminated;
        self.inbound.push_back(Bytes::from_static(STREAM_FOOTER));
    }

    fn accept_session(&mut self, body: &Node) -> Result<(), BoshError> {
        let sid = body.attr("sid").ok_or_else(|| {
            BoshError::InvalidBody("session creation response without sid".to_owned())
        })?;
        self.sid = Some(sid.to_owned());
        self.authid = body.attr("authid").map(str::to_owned);
        if let Some(version) = body.attr(&format!("{} version", ns::XBOSH)) {
            self.version = version.to_owned();
        }
        if let Some(requests) = parse_attr::<usize>(body, "requests")? {
            self.requests = requests.max(1);
        }
        if let Some(wait) = parse_attr::<u64>(body, "wait")? {
            self.config.wait = Duration::from_secs(wait);
        }
        if let Some(hold) = parse_attr::<u32>(body, "hold")? {
            self.config.hold = hold;
        }
        self.inactivity = parse_attr::<u64>(body, "inactivity")?.map(Duration::from_secs);
        self.polling = parse_attr::<u64>(body, "polling")?.map(Duration::from_secs);
        log::debug!(
            "BOSH session {} created: requests={} wait={:?} hold={}",
            sid,
            self.requests,
            self.config.wait,
            self.config.hold
        );
        self.phase = Phase::Active;
        Ok(())
    }

    fn write_header(&self, out: &mut BytesMut) {
        out.put_slice(b"<stream:stream");
        put_attr(out, "xmlns", &self.default_ns);
        put_attr(out, "xmlns:stream", ns::STREAM);
        put_attr(out, "from", &self.to);
        if let Some(id) = self.authid.as_ref().or(self.sid.as_ref()) {
            put_attr(out, "id", id);
        }
        put_attr(out, "version", &self.version);
        out.put_u8(b'>');
    }

    /// Take the next chunk of in-order inbound XML.
    pub fn take_inbound(&mut self) -> Option<Bytes> {
        self.inbound.pop_front()
    }

    /// Take the error the server ended the session with, once all data
    /// received before it was taken.
    pub fn take_failure(&mut self) -> Option<BoshError> {
        if !self.inbound.is_empty() {
            return None;
        }
        self.failure.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{StanzaBuilder, StreamItem};

    const RID: u64 = 1_000_000;

    fn header() -> OpenStream {
        OpenStream {
            to: "example.org".to_owned(),
            default_ns: ns::JABBER_CLIENT.to_owned(),
            id: None,
            lang: Some("en".to_owned()),
            restart: false,
        }
    }

    fn created_with_hold(hold: u32) -> BoshSession {
        let mut session =
            BoshSession::with_rid(BoshConfig::new("https://example.org/http-bind"), RID);
        session.open(&header());
        let now = Instant::now();
        let (rid, _) = session.next_request(now).unwrap();
        let response = format!(
            "<body xmlns='http://jabber.org/protocol/httpbind' sid='s1' \
             authid='a1' requests='2' wait='30' hold='{}' polling='5' inactivity='60' \
             xmlns:xmpp='urn:xmpp:xbosh' xmpp:version='1.0'>\
             <stream:features xmlns:stream='http://etherx.jabber.org/streams'/></body>",
            hold
        );
        session.on_response(rid, response.as_bytes(), now).unwrap();
        session
    }

    fn created() -> BoshSession {
        created_with_hold(1)
    }

    fn stanzas(session: &mut BoshSession, builder: &mut StanzaBuilder) -> Vec<StreamItem> {
        let mut items = Vec::new();
        while let Some(data) = session.take_inbound() {
            builder.feed(&data, &mut items).unwrap();
        }
        items
    }

    #[test]
    fn creation_body() {
        let mut session =
            BoshSession::with_rid(BoshConfig::new("https://example.org/http-bind"), RID);
        assert!(session.next_request(Instant::now()).is_none());
        session.open(&header());
        let (rid, body) = session.next_request(Instant::now()).unwrap();
        assert_eq!(rid, RID);
        let body = parse_document(&body).unwrap();
        assert!(body.is("body", ns::HTTPBIND));
        assert_eq!(body.attr("rid"), Some("1000000"));
        assert_eq!(body.attr("to"), Some("example.org"));
        assert_eq!(body.attr("wait"), Some("60"));
        assert_eq!(body.attr("hold"), Some("1"));
        assert_eq!(body.attr("ver"), Some("1.6"));
        assert_eq!(body.attr("urn:xmpp:xbosh version"), Some("1.0"));
        assert_eq!(body.attr("xml:lang"), Some("en"));
        assert_eq!(body.attr("sid"), None);
        // nothing else until the session exists
        session.queue(b"<presence/>").unwrap();
        assert!(session.next_request(Instant::now()).is_none());
    }

    #[test]
    fn creation_response_opens_stream() {
        let mut session = created();
        assert_eq!(session.sid(), Some("s1"));
        assert_eq!(session.wait(), Duration::from_secs(30));
        assert_eq!(session.inactivity(), Some(Duration::from_secs(60)));

        let mut builder = StanzaBuilder::default();
        let items = stanzas(&mut session, &mut builder);
        match &items[..] {
            [StreamItem::Header(header), StreamItem::Stanza(features)] => {
                assert_eq!(header.id(), Some("a1"));
                assert_eq!(header.version(), Some("1.0"));
                assert!(features.is("features", ns::STREAM));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn data_and_polls_respect_request_limit() {
        let mut session = created();
        let now = Instant::now();
        // one empty request is kept outstanding
        let (poll, body) = session.next_request(now).unwrap();
        assert_eq!(
            &body[..],
            &b"<body xmlns=\"http://jabber.org/protocol/httpbind\" rid=\"1000001\" sid=\"s1\"/>"[..]
        );
        assert!(session.next_request(now).is_none());

        session.queue(b"<message to='a@b'/>").unwrap();
        let (data, body) = session.next_request(now).unwrap();
        assert_eq!(data, poll + 1);
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("ack=\"1000000\""));
        assert!(text.ends_with("><message to='a@b'/></body>"));

        // both slots taken
        session.queue(b"<presence/>").unwrap();
        assert!(session.next_request(now).is_none());
        session
            .on_response(data, b"<body xmlns='http://jabber.org/protocol/httpbind'/>", now)
            .unwrap();
        assert!(session.next_request(now).is_some());
    }

    #[test]
    fn responses_released_in_rid_order() {
        let mut session = created();
        let mut builder = StanzaBuilder::default();
        stanzas(&mut session, &mut builder);

        let now = Instant::now();
        let (first, _) = session.next_request(now).unwrap();
        session.queue(b"<presence/>").unwrap();
        let (second, _) = session.next_request(now).unwrap();

        session
            .on_response(
                second,
                b"<body xmlns='http://jabber.org/protocol/httpbind'><message id='2'/></body>",
                now,
            )
            .unwrap();
        assert!(session.take_inbound().is_none());
        session
            .on_response(
                first,
                b"<body xmlns='http://jabber.org/protocol/httpbind'><message id='1'/></body>",
                now,
            )
            .unwrap();

        let ids: Vec<_> = stanzas(&mut session, &mut builder)
            .into_iter()
            .filter_map(|item| match item {
                StreamItem::Stanza(node) => {
                    // inherited from <body/> but delivered in the stream namespace
                    assert_eq!(node.ns(), ns::JABBER_CLIENT);
                    node.id().map(str::to_owned)
                }
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn restart_injects_new_header() {
        let mut session = created();
        let mut builder = StanzaBuilder::default();
        stanzas(&mut session, &mut builder);
        let now = Instant::now();

        session.open(&OpenStream {
            restart: true,
            ..header()
        });
        let (rid, body) = session.next_request(now).unwrap();
        let body = parse_document(&body).unwrap();
        assert_eq!(body.attr("urn:xmpp:xbosh restart"), Some("true"));
        assert_eq!(body.attr("sid"), Some("s1"));

        session
            .on_response(
                rid,
                b"<body xmlns='http://jabber.org/protocol/httpbind'>\
                  <stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
                  <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features></body>",
                now,
            )
            .unwrap();
        let mut builder = StanzaBuilder::default();
        let items = stanzas(&mut session, &mut builder);
        assert!(matches!(items[0], StreamItem::Header(_)));
        match &items[1] {
            StreamItem::Stanza(features) => assert!(features.has_child("bind", ns::BIND)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn server_termination() {
        let mut session = created();
        let now = Instant::now();
        while session.take_inbound().is_some() {}
        let (rid, _) = session.next_request(now).unwrap();
        session
            .on_response(
                rid,
                b"<body xmlns='http://jabber.org/protocol/httpbind' type='terminate' \
                  condition='remote-connection-failed'/>",
                now,
            )
            .unwrap();
        assert_eq!(
            session.take_failure(),
            Some(BoshError::Terminated {
                condition: Some("remote-connection-failed".to_owned())
            })
        );
        assert_eq!(session.take_failure(), None);
        assert!(session.next_request(now).is_none());
        assert!(session.is_closed());
    }

    #[test]
    fn termination_waits_for_earlier_responses() {
        let mut session = created();
        let mut builder = StanzaBuilder::default();
        stanzas(&mut session, &mut builder);

        let now = Instant::now();
        let (first, _) = session.next_request(now).unwrap();
        session.queue(b"<presence/>").unwrap();
        let (second, _) = session.next_request(now).unwrap();

        session
            .on_response(
                second,
                b"<body xmlns='http://jabber.org/protocol/httpbind' type='terminate' \
                  condition='system-shutdown'/>",
                now,
            )
            .unwrap();
        // nothing new goes out, and the failure waits for the first response
        session.queue(b"<message/>").unwrap_err();
        assert!(session.next_request(now).is_none());
        assert_eq!(session.take_failure(), None);
        assert!(!session.is_closed());

        session
            .on_response(
                first,
                b"<body xmlns='http://jabber.org/protocol/httpbind'><message id='last'/></body>",
                now,
            )
            .unwrap();
        assert_eq!(session.take_failure(), None);
        let ids: Vec<_> = stanzas(&mut session, &mut builder)
            .into_iter()
            .filter_map(|item| match item {
                StreamItem::Stanza(node) => node.id().map(str::to_owned),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["last"]);
        assert_eq!(
            session.take_failure(),
            Some(BoshError::Terminated {
                condition: Some("system-shutdown".to_owned())
            })
        );
        assert!(session.is_closed());
    }

    #[test]
    fn local_termination() {
        let mut session = created();
        let now = Instant::now();
        session.queue(b"<presence type='unavailable'/>").unwrap();
        session.terminate();
        let (rid, body) = session.next_request(now).unwrap();
        let body = parse_document(&body).unwrap();
        assert_eq!(body.attr("type"), Some("terminate"));
        assert!(body.has_child("presence", ns::HTTPBIND));
        assert!(session.next_request(now).is_none());

        session
            .on_response(
                rid,
                b"<body xmlns='http://jabber.org/protocol/httpbind' type='terminate'/>",
                now,
            )
            .unwrap();
        while session.take_inbound().is_some() {}
        assert!(session.is_closed());
    }

    #[test]
    fn unknown_rid_and_overflow() {
        let mut config = BoshConfig::new("https://example.org/http-bind");
        config.max_pending = 8;
        let mut session = BoshSession::with_rid(config, RID);
        let empty = b"<body xmlns='http://jabber.org/protocol/httpbind'/>";
        assert_eq!(
            session.on_response(42, empty, Instant::now()),
            Err(BoshError::UnexpectedRid(42))
        );
        session.queue(b"<a/>").unwrap();
        assert_eq!(session.queue(b"<b></b>"), Err(BoshError::Overflow));
    }

    #[test]
    fn polling_interval_delays_empty_requests() {
        let mut session = created_with_hold(0);
        let now = Instant::now();
        let (rid, _) = session.next_request(now).unwrap();
        session
            .on_response(rid, b"<body xmlns='http://jabber.org/protocol/httpbind'/>", now)
            .unwrap();
        assert!(session.next_request(now).is_none());
        assert_eq!(session.poll_not_before(), Some(now + Duration::from_secs(5)));
        assert!(session.next_request(now + Duration::from_secs(5)).is_some());
    }

    #[test]
    fn inactivity_bounds_polling_interval() {
        let mut session =
            BoshSession::with_rid(BoshConfig::new("https://example.org/http-bind"), RID);
        session.open(&header());
        let now = Instant::now();
        let (rid, _) = session.next_request(now).unwrap();
        session
            .on_response(
                rid,
                b"<body xmlns='http://jabber.org/protocol/httpbind' sid='s1' \
                  requests='2' hold='0' polling='20' inactivity='30'/>",
                now,
            )
            .unwrap();
        let (poll, _) = session.next_request(now).unwrap();
        session
            .on_response(poll, b"<body xmlns='http://jabber.org/protocol/httpbind'/>", now)
            .unwrap();
        assert_eq!(session.poll_not_before(), Some(now + Duration::from_secs(15)));
    }
}
