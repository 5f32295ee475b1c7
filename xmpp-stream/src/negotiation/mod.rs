// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Stream negotiation
//!
//! [`NegotiationPipeline`] takes a freshly opened client stream through
//! STARTTLS, SASL, resource binding and, if the server insists, legacy
//! session establishment. It is a plain state machine: the connection
//! driver hands it every stanza received before the stream is
//! established, and it answers through the [`StreamSession`] it is given.
//! The TLS handshake itself is left to the driver, which is told to
//! perform it by [`Step::StartTls`].

use core::time::Duration;

use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use jid::Jid;
use tokio::time::Instant;

use crate::config::{SaslConfig, SecurityMode};
use crate::error::{Error, NegotiationFailure, ProtocolError};
use crate::node::{stanza, Node};
use crate::ns;
use crate::session::StreamSession;

mod digest_md5;
mod mechanism;


pub use mechanism::{PasswordProvider, StaticPassword};

use mechanism::{candidates, Mechanism, PasswordCache};

/// Where the negotiation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Waiting for `<stream:features/>`
    AwaitingFeatures,
    /// `<starttls/>` sent, or the handshake is under way
    TlsNegotiating,
    /// A SASL exchange is under way
    SaslNegotiating,
    /// Authenticated, waiting for the features of the restarted stream
    StreamRestarted,
    /// Waiting for the bind result
    BindNegotiating,
    /// Waiting for the legacy session result
    SessionNegotiating,
    /// Ready for application stanzas
    Established,
    /// Authentication, binding or session establishment failed
    AuthFailed,
    /// TLS could not be established
    TlsFailed,
}

/// What the driver has to do after a stanza was processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Nothing beyond sending what the session has queued
    Continue,
    /// Flush, perform the TLS handshake, then call
    /// [`NegotiationPipeline::tls_established`]
    StartTls,
    /// The stream is established with this address
    Established(Jid),
}

/// TLS related situation of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsPolicy {
    /// What the configuration asks for
    pub mode: SecurityMode,
    /// The channel is already confidential (direct TLS, HTTPS)
    pub secure: bool,
    /// The transport can be upgraded in place
    pub starttls_supported: bool,
}

/// Drives one stream from its first features to an established session.
pub struct NegotiationPipeline {
    state: NegotiationState,
    jid: Jid,
    sasl: SaslConfig,
    tls: TlsPolicy,
    password: PasswordCache,
    candidates: Vec<String>,
    mechanism: Option<Mechanism>,
    last_failure: Option<NegotiationFailure>,
    bind_id: Option<String>,
    session_id: Option<String>,
    session_required: bool,
    bound: Option<Jid>,
    step_timeout: Duration,
    deadline: Option<Instant>,
}

fn failure_condition(node: &Node) -> (String, Option<String>) {
    let condition = node
        .children()
        .find(|c| c.name() != "text")
        .map(|c| c.name().to_owned())
        .unwrap_or_else(|| "not-authorized".to_owned());
    let text = node.children().find(|c| c.name() == "text").map(Node::text);
    (condition, text)
}

fn decode(node: &Node) -> Result<Vec<u8>, NegotiationFailure> {
    let text = node.text();
    let text = text.trim();
    // a lone '=' stands for empty data
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    Base64
        .decode(text)
        .map_err(|e| NegotiationFailure::Sasl(format!("invalid base64: {}", e)))
}

fn encode(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_owned()
    } else {
        Base64.encode(data)
    }
}

impl NegotiationPipeline {
    /// Create a pipeline for logging in as `jid`.
    pub fn new(
        jid: Jid,
        sasl: SaslConfig,
        tls: TlsPolicy,
        password: Box<dyn PasswordProvider>,
    ) -> NegotiationPipeline {
        NegotiationPipeline {
            state: NegotiationState::AwaitingFeatures,
            jid,
            sasl,
            tls,
            password: PasswordCache::new(password),
            candidates: Vec::new(),
            mechanism: None,
            last_failure: None,
            bind_id: None,
            session_id: None,
            session_required: false,
            bound: None,
            step_timeout: Duration::from_secs(25),
            deadline: None,
        }
    }

    /// Limit the time each step may take. The clock starts with
    /// [`Self::start`] and is reset on every state change.
    pub fn set_step_timeout(&mut self, timeout: Duration) {
        self.step_timeout = timeout;
    }

    /// Current state.
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// The deadline of the current step.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether TLS is in effect.
    pub fn is_secure(&self) -> bool {
        self.tls.secure
    }

    /// Start the clock for the first features.
    pub fn start(&mut self) {
        self.enter(NegotiationState::AwaitingFeatures);
    }

    fn enter(&mut self, state: NegotiationState) {
        log::debug!("Negotiation: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.deadline = match state {
            NegotiationState::Established
            | NegotiationState::AuthFailed
            | NegotiationState::TlsFailed => None,
            _ => Some(Instant::now() + self.step_timeout),
        };
    }

    fn fail(&mut self, failure: NegotiationFailure) -> NegotiationFailure {
        let state = match failure {
            NegotiationFailure::TlsRefused
            | NegotiationFailure::TlsRequired
            | NegotiationFailure::TlsUnavailable
            | NegotiationFailure::TlsHandshake(_) => NegotiationState::TlsFailed,
            _ => NegotiationState::AuthFailed,
        };
        log::debug!("Negotiation failed: {}", failure);
        self.enter(state);
        failure
    }

    /// Fail with [`NegotiationFailure::Timeout`] if the current step has
    /// exceeded its deadline.
    pub fn check_deadline(&mut self, now: Instant) -> Result<(), NegotiationFailure> {
        match self.deadline {
            Some(deadline) if deadline <= now => Err(self.fail(NegotiationFailure::Timeout)),
            _ => Ok(()),
        }
    }

    /// The driver finished the TLS handshake: restart the stream.
    pub fn tls_established(&mut self, session: &mut StreamSession) {
        self.tls.secure = true;
        session.restart();
        self.enter(NegotiationState::AwaitingFeatures);
    }

    /// The driver could not finish the TLS handshake.
    pub fn tls_failed(&mut self, reason: String) -> NegotiationFailure {
        self.fail(NegotiationFailure::TlsHandshake(reason))
    }

    /// Process one stanza received before the stream is established.
    ///
    /// Stream errors must be checked by the caller beforehand.
    pub fn handle(&mut self, session: &mut StreamSession, node: &Node) -> Result<Step, Error> {
        let result = match self.state {
            NegotiationState::AwaitingFeatures | NegotiationState::StreamRestarted
                if node.is("features", ns::STREAM) =>
            {
                self.on_features(session, node)
            }
            NegotiationState::TlsNegotiating if node.ns() == ns::TLS => self.on_tls(node),
            NegotiationState::SaslNegotiating if node.ns() == ns::SASL => {
                self.on_sasl(session, node)
            }
            NegotiationState::BindNegotiating | NegotiationState::SessionNegotiating
                if node.name() == "iq" =>
            {
                self.on_iq(session, node)
            }
            NegotiationState::Established => {
                return Err(ProtocolError::UnexpectedElement(node.qualified_name()).into())
            }
            state => {
                if stanza::is_iq_request(node) {
                    return refuse_request(session, node);
                }
                log::warn!(
                    "Ignoring {} while in negotiation state {:?}",
                    node.qualified_name(),
                    state
                );
                return Ok(Step::Continue);
            }
        };
        result.map_err(|e| match e {
            Error::Negotiation(failure) if !self.is_terminal() => {
                Error::Negotiation(self.fail(failure))
            }
            e => e,
        })
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            NegotiationState::AuthFailed | NegotiationState::TlsFailed
        )
    }

    fn on_features(
        &mut self,
        session: &mut StreamSession,
        features: &Node,
    ) -> Result<Step, Error> {
        if self.state == NegotiationState::StreamRestarted {
            return self.start_bind(session, features);
        }

        if !self.tls.secure {
            let offered = features.get_child("starttls", ns::TLS);
            match (self.tls.mode, offered) {
                (SecurityMode::Plain, _) => (),
                (SecurityMode::StartTlsOptional, Some(_)) if !self.tls.starttls_supported => {
                    log::debug!("STARTTLS offered but not supported by this transport");
                }
                (SecurityMode::StartTlsOptional, Some(_))
                | (SecurityMode::StartTlsRequired, Some(_)) => {
                    if !self.tls.starttls_supported {
                        return Err(NegotiationFailure::TlsUnavailable.into());
                    }
                    session.send_element(&Node::new("starttls", ns::TLS))?;
                    self.enter(NegotiationState::TlsNegotiating);
                    return Ok(Step::Continue);
                }
                (SecurityMode::StartTlsRequired, None) | (SecurityMode::DirectTls, _) => {
                    return Err(NegotiationFailure::TlsRequired.into());
                }
                (SecurityMode::StartTlsOptional, None) => (),
            }
        }

        let Some(mechanisms) = features.get_child("mechanisms", ns::SASL) else {
            return Err(NegotiationFailure::NoMechanism.into());
        };
        let offered: Vec<String> = mechanisms
            .children()
            .filter(|c| c.name() == "mechanism")
            .map(|c| c.text().trim().to_owned())
            .collect();
        log::debug!("Server offers SASL mechanisms {:?}", offered);
        self.candidates = candidates(
            &self.sasl,
            &offered,
            self.jid.node().is_some(),
            self.tls.secure,
        );
        // tried back to front
        self.candidates.reverse();
        self.start_next_mechanism(session)
    }

    fn start_next_mechanism(&mut self, session: &mut StreamSession) -> Result<Step, Error> {
        let Some(name) = self.candidates.pop() else {
            return Err(self
                .last_failure
                .take()
                .unwrap_or(NegotiationFailure::NoMechanism)
                .into());
        };
        let username = self.jid.node().map(|node| node.as_str().to_owned());
        let host = self.jid.domain().as_str().to_owned();
        let mut mechanism =
            Mechanism::create(&name, username.as_deref(), &host, &mut self.password)?;
        log::debug!("Authenticating with {}", mechanism.name());
        let initial = mechanism.initial();
        let mut auth = Node::builder("auth", ns::SASL)
            .attr("mechanism", mechanism.name())
            .build();
        auth.append_text(&encode(&initial));
        session.send_element(&auth)?;
        self.mechanism = Some(mechanism);
        self.enter(NegotiationState::SaslNegotiating);
        Ok(Step::Continue)
    }

    fn on_tls(&mut self, node: &Node) -> Result<Step, Error> {
        match node.name() {
            "proceed" => Ok(Step::StartTls),
            "failure" => Err(NegotiationFailure::TlsRefused.into()),
            _ => Err(ProtocolError::UnexpectedElement(node.qualified_name()).into()),
        }
    }

    fn on_sasl(&mut self, session: &mut StreamSession, node: &Node) -> Result<Step, Error> {
        let Some(mut mechanism) = self.mechanism.take() else {
            return Err(Error::InvalidState);
        };
        match node.name() {
            "challenge" => {
                let challenge = decode(node)?;
                let response = mechanism.response(&challenge, &mut self.password)?;
                let mut reply = Node::new("response", ns::SASL);
                if !response.is_empty() {
                    reply.append_text(&Base64.encode(&response));
                }
                session.send_element(&reply)?;
                self.mechanism = Some(mechanism);
                Ok(Step::Continue)
            }
            "success" => {
                mechanism.success(&decode(node)?)?;
                log::debug!("Authenticated with {}", mechanism.name());
                self.candidates.clear();
                session.restart();
                self.enter(NegotiationState::StreamRestarted);
                Ok(Step::Continue)
            }
            "failure" => {
                let (condition, text) = failure_condition(node);
                log::debug!("{} rejected: {} {:?}", mechanism.name(), condition, text);
                self.last_failure = Some(NegotiationFailure::SaslFailed { condition, text });
                self.start_next_mechanism(session)
            }
            _ => Err(ProtocolError::UnexpectedElement(node.qualified_name()).into()),
        }
    }

    fn start_bind(&mut self, session: &mut StreamSession, features: &Node) -> Result<Step, Error> {
        self.session_required = features
            .get_child("session", ns::SESSION)
            .is_some_and(|s| !s.has_child("optional", ns::SESSION));
        if !features.has_child("bind", ns::BIND) {
            log::debug!("Server does not offer resource binding");
            self.bound = Some(self.jid.clone());
            return self.after_bind(session);
        }
        let mut bind = Node::new("bind", ns::BIND);
        if let Some(resource) = self.jid.resource() {
            bind.append_child(
                Node::builder("resource", ns::BIND)
                    .append_text(resource.as_str())
                    .build(),
            );
        }
        let id = session.send(stanza::iq(stanza::IqType::Set, None, Some(bind)))?;
        self.bind_id = Some(id);
        self.enter(NegotiationState::BindNegotiating);
        Ok(Step::Continue)
    }

    fn after_bind(&mut self, session: &mut StreamSession) -> Result<Step, Error> {
        if self.session_required {
            let session_iq = stanza::iq(
                stanza::IqType::Set,
                None,
                Some(Node::new("session", ns::SESSION)),
            );
            self.session_id = Some(session.send(session_iq)?);
            self.enter(NegotiationState::SessionNegotiating);
            return Ok(Step::Continue);
        }
        self.establish()
    }

    fn establish(&mut self) -> Result<Step, Error> {
        let jid = self.bound.clone().ok_or(Error::InvalidState)?;
        self.enter(NegotiationState::Established);
        Ok(Step::Established(jid))
    }

    fn on_iq(&mut self, session: &mut StreamSession, iq: &Node) -> Result<Step, Error> {
        let expected = match self.state {
            NegotiationState::BindNegotiating => self.bind_id.as_deref(),
            _ => self.session_id.as_deref(),
        };
        if stanza::is_iq_request(iq) {
            return refuse_request(session, iq);
        }
        if iq.id().is_none() || iq.id() != expected || !stanza::is_iq_response(iq) {
            log::warn!("Ignoring unrelated iq {:?} during negotiation", iq.id());
            return Ok(Step::Continue);
        }
        let rejected = iq.stanza_type() == Some("error");
        let condition = stanza::error_condition(iq).map(str::to_owned);

        if self.state == NegotiationState::SessionNegotiating {
            if rejected {
                return Err(NegotiationFailure::SessionRejected(condition).into());
            }
            return self.establish();
        }

        if rejected {
            return Err(NegotiationFailure::BindRejected(condition).into());
        }
        let jid = iq
            .get_child("bind", ns::BIND)
            .and_then(|bind| bind.get_child("jid", ns::BIND))
            .map(Node::text)
            .ok_or(NegotiationFailure::InvalidBindResponse)?;
        let jid: Jid = jid
            .trim()
            .parse()
            .map_err(|_| NegotiationFailure::InvalidBindResponse)?;
        log::debug!("Bound to {}", jid);
        self.bound = Some(jid);
        self.after_bind(session)
    }
}

// iq requests must be answered even before the stream is up.
fn refuse_request(session: &mut StreamSession, iq: &Node) -> Result<Step, Error> {
    log::debug!("Refusing iq {:?} during negotiation", iq.id());
    let reply = stanza::error_reply(iq, stanza::DefinedCondition::ServiceUnavailable, None);
    session.send(reply)?;
    Ok(Step::Continue)
}
