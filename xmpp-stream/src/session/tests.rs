// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::{Arc, Mutex};

use super::*;
use crate::builder::parse_document;
use crate::node::stanza::{self, IqType};

const PEER_HEADER: &[u8] = b"<stream:stream xmlns='jabber:client' \
    xmlns:stream='http://etherx.jabber.org/streams' from='example.org' id='s-1' version='1.0'>";

fn open_session() -> StreamSession {
    let mut session = StreamSession::new();
    session.open("example.org", ns::JABBER_CLIENT, None);
    let mut items = Vec::new();
    session.feed(PEER_HEADER, &mut items).unwrap();
    assert_eq!(session.state(), StreamState::Open);
    // drop our own header
    assert!(matches!(session.take_outbound(), Some(Outbound::Header(_))));
    session
}

fn deliver(session: &mut StreamSession, data: &[u8]) -> Vec<Dispatched> {
    let mut items = Vec::new();
    session.feed(data, &mut items).unwrap();
    items
        .into_iter()
        .filter_map(|item| match item {
            StreamItem::Stanza(node) => Some(session.dispatch(node)),
            _ => None,
        })
        .collect()
}

fn sent_stanzas(session: &mut StreamSession) -> Vec<Node> {
    let mut result = Vec::new();
    while let Some(outbound) = session.take_outbound() {
        if let Outbound::Data(bytes) = outbound {
            result.push(parse_document(&bytes).unwrap());
        }
    }
    result
}

type Log = Arc<Mutex<Vec<&'static str>>>;

fn recorder(log: &Log, label: &'static str, result: ControlFlow<()>) -> Handler {
    let log = Arc::clone(log);
    Box::new(move |_ctx: &mut StanzaContext<'_>, _node: &Node| {
        log.lock().unwrap().push(label);
        result
    })
}

#[test]
fn header_serialization() {
    let header = OpenStream {
        to: "example.org".to_owned(),
        default_ns: ns::JABBER_CLIENT.to_owned(),
        id: None,
        lang: Some("en".to_owned()),
        restart: false,
    };
    let bytes = header.to_bytes();
    let text = std::str::from_utf8(&bytes).unwrap();
    assert!(text.starts_with("<?xml version='1.0'?><stream:stream "));
    assert!(text.contains("xmlns=\"jabber:client\""));
    assert!(text.contains("to=\"example.org\""));
    assert!(text.contains("xml:lang=\"en\""));
    assert!(text.ends_with('>'));
    assert!(!text.ends_with("/>"));
}

#[test]
fn peer_header_recorded() {
    let session = open_session();
    assert_eq!(session.stream_id(), Some("s-1"));
    assert_eq!(session.peer_header().unwrap().from(), Some("example.org"));
}

#[test]
fn invalid_root_rejected() {
    let mut session = StreamSession::new();
    session.open("example.org", ns::JABBER_CLIENT, None);
    let mut items = Vec::new();
    let err = session
        .feed(b"<html xmlns='http://www.w3.org/1999/xhtml'>", &mut items)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::InvalidStreamStart(_))
    ));
}

#[test]
fn old_stream_version_rejected() {
    let mut session = StreamSession::new();
    session.open("example.org", ns::JABBER_CLIENT, None);
    let mut items = Vec::new();
    let err = session
        .feed(
            b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
            &mut items,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::UnsupportedVersion(_))
    ));
}

#[test]
fn items_after_rejected_header_dropped() {
    let mut session = StreamSession::new();
    session.open("example.org", ns::JABBER_CLIENT, None);
    let mut items = Vec::new();
    let err = session
        .feed(
            b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' \
              version='0.9'><stream:features/></stream:stream>",
            &mut items,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::UnsupportedVersion(_))
    ));
    assert!(items.is_empty());
    assert!(session.peer_header().is_none());
    assert!(!session.remote_closed());
}

#[test]
fn pending_input_ignores_whitespace() {
    let mut session = open_session();
    deliver(&mut session, b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>\n ");
    assert!(!session.has_pending_input());
    deliver(&mut session, b"<stream:features");
    assert!(session.has_pending_input());

    let mut session = open_session();
    deliver(&mut session, b"<message><body>hi");
    assert!(session.has_pending_input());
}

#[test]
fn generated_ids_are_unique() {
    let mut session = open_session();
    let mut ids = std::collections::HashSet::new();
    for _ in 0..100 {
        let (id, _token) = session
            .request(stanza::iq(IqType::Get, None, None), None)
            .unwrap();
        assert!(ids.insert(id));
    }
    assert_eq!(session.pending_responses(), 100);
}

#[test]
fn explicit_id_kept_and_duplicates_refused() {
    let mut session = open_session();
    let mut iq = stanza::iq(IqType::Get, Some("example.org"), None);
    iq.set_id("abc");
    let (id, _token) = session.request(iq.clone(), None).unwrap();
    assert_eq!(id, "abc");
    match session.request(iq, None) {
        Err(Error::DuplicateId(id)) => assert_eq!(id, "abc"),
        other => panic!("unexpected {:?}", other.map(|(id, _)| id)),
    }
    assert_eq!(session.pending_responses(), 1);
}

#[tokio::test]
async fn reply_resolves_token() {
    let mut session = open_session();
    let mut iq = stanza::iq(IqType::Get, Some("example.org"), None);
    iq.set_id("abc");
    let (_, token) = session.request(iq, None).unwrap();

    let sent = sent_stanzas(&mut session);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id(), Some("abc"));

    let outcome = deliver(&mut session, b"<iq type='result' id='abc' from='example.org'/>");
    assert_eq!(outcome, vec![Dispatched::Response]);
    let reply = token.await.unwrap();
    assert_eq!(reply.stanza_type(), Some("result"));
    assert_eq!(session.pending_responses(), 0);
}

#[test]
fn second_reply_falls_through_to_handlers() {
    let mut session = open_session();
    let log: Log = Default::default();
    session.register_boxed_handler(
        "",
        "iq",
        Matcher::Any,
        Priority::Normal,
        recorder(&log, "iq", ControlFlow::Break(())),
    );
    let results: Arc<Mutex<Vec<ResponseResult>>> = Default::default();
    let sink = {
        let results = Arc::clone(&results);
        ResponseSink::callback(move |_ctx, result| results.lock().unwrap().push(result))
    };
    let mut iq = stanza::iq(IqType::Get, None, None);
    iq.set_id("q1");
    session.send_with_response(iq, None, sink).unwrap();

    let outcome = deliver(
        &mut session,
        b"<iq type='result' id='q1'/><iq type='result' id='q1'/>",
    );
    assert_eq!(outcome, vec![Dispatched::Response, Dispatched::Handled]);
    assert_eq!(results.lock().unwrap().len(), 1);
    assert_eq!(*log.lock().unwrap(), vec!["iq"]);
}

#[test]
fn iq_reply_needs_result_or_error_type() {
    let mut session = open_session();
    let mut iq = stanza::iq(IqType::Get, None, None);
    iq.set_id("q1");
    let (_, _token) = session.request(iq, None).unwrap();
    sent_stanzas(&mut session);

    // same id, but a request: answered by the fallback, entry kept
    let outcome = deliver(&mut session, b"<iq type='get' id='q1'/><message id='q1'/>");
    assert_eq!(outcome, vec![Dispatched::Fallback, Dispatched::Fallback]);
    assert_eq!(session.pending_responses(), 1);
}

#[test]
fn non_iq_reply_matches_on_id() {
    let mut session = open_session();
    let mut message = stanza::message("room@muc.example.org", Some("groupchat"), Some("hi"));
    message.set_id("m1");
    let (_, _token) = session.request(message, None).unwrap();
    let outcome = deliver(&mut session, b"<message type='groupchat' id='m1'><body>hi</body></message>");
    assert_eq!(outcome, vec![Dispatched::Response]);
}

#[test]
fn handler_order() {
    let mut session = open_session();
    let log: Log = Default::default();
    let go_on = ControlFlow::Continue(());
    session.register_boxed_handler(
        "",
        "message",
        Matcher::Any,
        Priority::Normal,
        recorder(&log, "any", go_on),
    );
    session.register_boxed_handler(
        "",
        "message",
        Matcher::ByProperty("urn:example:receipts".to_owned()),
        Priority::Normal,
        recorder(&log, "property", go_on),
    );
    session.register_boxed_handler(
        "",
        "message",
        Matcher::ByType("chat".to_owned()),
        Priority::Normal,
        recorder(&log, "type", go_on),
    );
    session.register_boxed_handler(
        "",
        "message",
        Matcher::ByType("chat".to_owned()),
        Priority::First,
        recorder(&log, "type-first", go_on),
    );
    session.register_boxed_handler(
        "",
        "message",
        Matcher::ByType("headline".to_owned()),
        Priority::Normal,
        recorder(&log, "headline", go_on),
    );

    let outcome = deliver(
        &mut session,
        b"<message type='chat'><body>x</body><request xmlns='urn:example:receipts'/></message>",
    );
    assert_eq!(outcome, vec![Dispatched::Fallback]);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["type-first", "type", "property", "any"]
    );
}

#[test]
fn break_stops_dispatch() {
    let mut session = open_session();
    let log: Log = Default::default();
    session.register_boxed_handler(
        "",
        "presence",
        Matcher::Any,
        Priority::Normal,
        recorder(&log, "first", ControlFlow::Break(())),
    );
    session.register_boxed_handler(
        "",
        "presence",
        Matcher::Any,
        Priority::Normal,
        recorder(&log, "second", ControlFlow::Continue(())),
    );
    let outcome = deliver(&mut session, b"<presence/>");
    assert_eq!(outcome, vec![Dispatched::Handled]);
    assert_eq!(*log.lock().unwrap(), vec!["first"]);
}

#[test]
fn unregistered_handler_not_invoked() {
    let mut session = open_session();
    let log: Log = Default::default();
    let id = session.register_boxed_handler(
        "",
        "presence",
        Matcher::Any,
        Priority::Normal,
        recorder(&log, "gone", ControlFlow::Break(())),
    );
    assert!(session.unregister_handler(id));
    assert!(!session.unregister_handler(id));
    assert_eq!(deliver(&mut session, b"<presence/>"), vec![Dispatched::Fallback]);
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn unknown_namespace_uses_default() {
    let mut session = open_session();
    let log: Log = Default::default();
    session.register_boxed_handler(
        "",
        "message",
        Matcher::Any,
        Priority::Normal,
        recorder(&log, "message", ControlFlow::Break(())),
    );
    let outcome = deliver(&mut session, b"<message xmlns='urn:example:odd'/>");
    assert_eq!(outcome, vec![Dispatched::Handled]);
}

#[test]
fn unhandled_iq_request_gets_error_reply() {
    let mut session = open_session();
    let outcome = deliver(
        &mut session,
        b"<iq type='get' id='v1' from='peer@example.org/x'><query xmlns='jabber:iq:version'/></iq>\
          <message from='peer@example.org/x'><body>hello</body></message>",
    );
    assert_eq!(outcome, vec![Dispatched::Fallback, Dispatched::Fallback]);
    let sent = sent_stanzas(&mut session);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id(), Some("v1"));
    assert_eq!(sent[0].stanza_type(), Some("error"));
    assert_eq!(sent[0].attr("to"), Some("peer@example.org/x"));
    assert_eq!(
        stanza::error_condition(&sent[0]),
        Some("feature-not-implemented")
    );
}

#[test]
fn replaced_fallback() {
    let mut session = open_session();
    let log: Log = Default::default();
    session.set_fallback_handler(recorder(&log, "fallback", ControlFlow::Continue(())));
    deliver(&mut session, b"<iq type='get' id='v1'/>");
    assert_eq!(*log.lock().unwrap(), vec!["fallback"]);
    assert!(sent_stanzas(&mut session).is_empty());

    session.reset_fallback_handler();
    deliver(&mut session, b"<iq type='get' id='v2'/>");
    assert_eq!(sent_stanzas(&mut session).len(), 1);
}

#[test]
fn handler_can_send() {
    let mut session = open_session();
    session.register_handler(
        "",
        "iq",
        Matcher::ByProperty("urn:xmpp:ping".to_owned()),
        Priority::Normal,
        |ctx, node| {
            ctx.send(stanza::result_reply(node, None)).unwrap();
            ControlFlow::Break(())
        },
    );
    deliver(
        &mut session,
        b"<iq type='get' id='p1' from='example.org'><ping xmlns='urn:xmpp:ping'/></iq>",
    );
    let sent = sent_stanzas(&mut session);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].stanza_type(), Some("result"));
    assert_eq!(sent[0].id(), Some("p1"));
    assert_eq!(sent[0].attr("to"), Some("example.org"));
}

#[tokio::test]
async fn close_resolves_pending_and_is_idempotent() {
    let mut session = open_session();
    let (_, first) = session
        .request(stanza::iq(IqType::Get, None, None), None)
        .unwrap();
    let (_, second) = session
        .request(stanza::iq(IqType::Set, None, None), None)
        .unwrap();
    sent_stanzas(&mut session);

    session.close();
    session.close();
    assert_eq!(session.state(), StreamState::Closing);
    assert_eq!(session.take_outbound(), Some(Outbound::Footer));
    assert_eq!(session.take_outbound(), None);
    assert_eq!(first.await, Err(ResponseError::ConnectionLost));
    assert_eq!(second.await, Err(ResponseError::ConnectionLost));

    assert!(matches!(
        session.send(stanza::presence(None, None)),
        Err(Error::Disconnected)
    ));
}

#[test]
fn disconnect_resolves_every_pending_response_once() {
    let mut session = open_session();
    let results: Arc<Mutex<Vec<ResponseResult>>> = Default::default();
    for _ in 0..3 {
        let results = Arc::clone(&results);
        session
            .send_with_response(
                stanza::iq(IqType::Get, None, None),
                None,
                ResponseSink::callback(move |_ctx, result| results.lock().unwrap().push(result)),
            )
            .unwrap();
    }
    assert_eq!(session.on_disconnect(), 3);
    assert_eq!(session.on_disconnect(), 0);
    let results = results.lock().unwrap();
    assert_eq!(results.len(), 3);
    assert!(results
        .iter()
        .all(|r| *r == Err(ResponseError::ConnectionLost)));
    assert!(!session.has_outbound());
}

#[tokio::test]
async fn expired_responses_time_out() {
    let mut session = open_session();
    let (_, short) = session
        .request(
            stanza::iq(IqType::Get, None, None),
            Some(Duration::from_secs(1)),
        )
        .unwrap();
    let (long_id, _long) = session
        .request(
            stanza::iq(IqType::Get, None, None),
            Some(Duration::from_secs(60)),
        )
        .unwrap();
    assert!(session.next_deadline().is_some());

    assert_eq!(session.expire(Instant::now() + Duration::from_secs(2)), 1);
    assert_eq!(short.await, Err(ResponseError::Timeout));
    assert_eq!(session.pending_responses(), 1);

    // the other request is still answered
    let reply = format!("<iq type='result' id='{}'/>", long_id);
    assert_eq!(deliver(&mut session, reply.as_bytes()), vec![Dispatched::Response]);
}

#[test]
fn default_timeout_applies() {
    let mut session = open_session();
    session.request(stanza::iq(IqType::Get, None, None), None).unwrap();
    assert!(session.next_deadline().is_none());
    session.set_default_response_timeout(Some(Duration::from_secs(25)));
    session.request(stanza::iq(IqType::Get, None, None), None).unwrap();
    assert!(session.next_deadline().is_some());
}

#[test]
fn restart_keeps_handlers_and_pending() {
    let mut session = open_session();
    let log: Log = Default::default();
    session.register_boxed_handler(
        "",
        "message",
        Matcher::Any,
        Priority::Normal,
        recorder(&log, "message", ControlFlow::Break(())),
    );
    let (_, _token) = session
        .request(stanza::iq(IqType::Get, None, None), None)
        .unwrap();
    sent_stanzas(&mut session);

    session.restart();
    assert_eq!(session.state(), StreamState::Opening);
    assert_eq!(session.stream_id(), None);
    match session.take_outbound() {
        Some(Outbound::Header(header)) => assert!(header.restart),
        other => panic!("unexpected {:?}", other),
    }
    let mut items = Vec::new();
    session
        .feed(
            b"<stream:stream xmlns='jabber:client' \
              xmlns:stream='http://etherx.jabber.org/streams' id='s-2' version='1.0'>",
            &mut items,
        )
        .unwrap();
    assert_eq!(session.stream_id(), Some("s-2"));
    assert_eq!(session.pending_responses(), 1);
    assert_eq!(deliver(&mut session, b"<message/>"), vec![Dispatched::Handled]);
}

#[test]
fn footer_marks_remote_closed() {
    let mut session = open_session();
    deliver(&mut session, b"</stream:stream>");
    assert!(session.remote_closed());
}

#[test]
fn stream_error_extraction() {
    let node = parse_document(
        b"<stream:error xmlns:stream='http://etherx.jabber.org/streams'>\
          <conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
          <text xmlns='urn:ietf:params:xml:ns:xmpp-streams'>Replaced by new connection</text>\
          </stream:error>",
    )
    .unwrap();
    let (condition, text) = stream_error(&node).unwrap();
    assert_eq!(condition, "conflict");
    assert_eq!(text.as_deref(), Some("Replaced by new connection"));
    assert!(stream_error(&stanza::presence(None, None)).is_none());
}

#[test]
fn send_before_open_refused() {
    let mut session = StreamSession::new();
    assert!(matches!(
        session.send(stanza::presence(None, None)),
        Err(Error::Disconnected)
    ));
}

#[test]
fn qualified_stanzas_declare_namespace() {
    let mut session = open_session();
    session.send(stanza::presence(None, None)).unwrap();
    session.set_qualified_stanzas(true);
    session.send(stanza::presence(None, None)).unwrap();
    let mut sent = Vec::new();
    while let Some(Outbound::Data(bytes)) = session.take_outbound() {
        sent.push(String::from_utf8(bytes.to_vec()).unwrap());
    }
    assert!(!sent[0].contains("xmlns"));
    assert!(sent[1].starts_with("<presence xmlns=\"jabber:client\""));
}
