// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#[cfg(feature = "dns")]
use hickory_resolver::{
    error::ResolveError as DnsResolveError, proto::error::ProtoError as DnsProtoError,
};
use std::error::Error as StdError;
use std::fmt;
use std::io::{self, Error as IoError};
use std::net::AddrParseError;

pub use crate::parser::{ParseError, ParseErrorKind};

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(IoError),
    /// Error parsing Jabber-Id
    JidParse(jid::Error),
    /// Establishing the transport failed
    Connect(ConnectError),
    /// The transport failed after it was established
    Transport(TransportError),
    /// Malformed XML received
    Parse(ParseError),
    /// Stream-level protocol violation
    Protocol(ProtocolError),
    /// TLS, SASL or bind negotiation failed
    Negotiation(NegotiationFailure),
    /// An awaited response did not arrive
    Response(ResponseError),
    /// A response is already awaited for this stanza id
    DuplicateId(String),
    /// Connection closed
    Disconnected,
    /// Should never happen
    InvalidState,
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Connect(e) => write!(fmt, "connect error: {}", e),
            Error::Transport(e) => write!(fmt, "transport error: {}", e),
            Error::Parse(e) => write!(fmt, "XML parse error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Negotiation(e) => write!(fmt, "negotiation error: {}", e),
            Error::Response(e) => write!(fmt, "response error: {}", e),
            Error::DuplicateId(id) => write!(fmt, "a response to id {} is already pending", id),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::InvalidState => write!(fmt, "invalid state"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::JidParse(e) => Some(e),
            Error::Connect(e) => Some(e),
            Error::Transport(e) => Some(e),
            Error::Parse(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Negotiation(e) => Some(e),
            Error::Response(e) => Some(e),
            Error::DuplicateId(_) | Error::Disconnected | Error::InvalidState => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<ConnectError> for Error {
    fn from(e: ConnectError) -> Self {
        Error::Connect(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::Parse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<NegotiationFailure> for Error {
    fn from(e: NegotiationFailure) -> Self {
        Error::Negotiation(e)
    }
}

impl From<ResponseError> for Error {
    fn from(e: ResponseError) -> Self {
        Error::Response(e)
    }
}

/// Failure to establish a transport
#[derive(Debug)]
pub enum ConnectError {
    /// Name resolution failed
    DnsFailure(String),
    /// The peer refused the connection or could not be reached
    RefusedOrUnreachable(IoError),
    /// The TLS handshake failed
    TlsHandshakeFailure(String),
    /// The connection attempt took too long
    Timeout,
    /// The proxy refused to open a tunnel
    Proxy(String),
    /// The endpoint description cannot be used
    InvalidEndpoint(String),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectError::DnsFailure(e) => write!(fmt, "DNS resolution failed: {}", e),
            ConnectError::RefusedOrUnreachable(e) => {
                write!(fmt, "connection refused or unreachable: {}", e)
            }
            ConnectError::TlsHandshakeFailure(e) => write!(fmt, "TLS handshake failed: {}", e),
            ConnectError::Timeout => write!(fmt, "connection attempt timed out"),
            ConnectError::Proxy(e) => write!(fmt, "proxy error: {}", e),
            ConnectError::InvalidEndpoint(e) => write!(fmt, "invalid endpoint: {}", e),
        }
    }
}

impl StdError for ConnectError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConnectError::RefusedOrUnreachable(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for ConnectError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => ConnectError::Timeout,
            _ => ConnectError::RefusedOrUnreachable(e),
        }
    }
}

impl From<AddrParseError> for ConnectError {
    fn from(e: AddrParseError) -> Self {
        ConnectError::InvalidEndpoint(format!("wrong network address: {e}"))
    }
}

#[cfg(feature = "dns")]
impl From<idna::Errors> for ConnectError {
    fn from(_e: idna::Errors) -> Self {
        ConnectError::DnsFailure("IDNA error".to_owned())
    }
}

#[cfg(feature = "dns")]
impl From<DnsResolveError> for ConnectError {
    fn from(e: DnsResolveError) -> Self {
        ConnectError::DnsFailure(e.to_string())
    }
}

#[cfg(feature = "dns")]
impl From<DnsProtoError> for ConnectError {
    fn from(e: DnsProtoError) -> Self {
        ConnectError::DnsFailure(e.to_string())
    }
}

/// BOSH session failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoshError {
    /// The connection manager ended the session
    Terminated {
        /// The `condition` attribute, if any
        condition: Option<String>,
    },
    /// The HTTP response had a non-success status
    HttpStatus(u16),
    /// The response body was not a valid `<body/>`
    InvalidBody(String),
    /// A response arrived for a request that was never sent
    UnexpectedRid(u64),
    /// A request was outstanding longer than `wait` plus the grace period
    Timeout,
    /// Too much data is queued while no request slot is free
    Overflow,
}

impl fmt::Display for BoshError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BoshError::Terminated {
                condition: Some(condition),
            } => write!(fmt, "session terminated: {}", condition),
            BoshError::Terminated { condition: None } => write!(fmt, "session terminated"),
            BoshError::HttpStatus(status) => write!(fmt, "HTTP status {}", status),
            BoshError::InvalidBody(e) => write!(fmt, "invalid body: {}", e),
            BoshError::UnexpectedRid(rid) => write!(fmt, "response for unknown rid {}", rid),
            BoshError::Timeout => write!(fmt, "request timed out"),
            BoshError::Overflow => write!(fmt, "outgoing buffer overflow"),
        }
    }
}

impl StdError for BoshError {}

/// Failure of an established transport
#[derive(Debug)]
pub enum TransportError {
    /// Socket error
    Io(IoError),
    /// HTTP client error
    #[cfg(feature = "bosh")]
    Http(reqwest::Error),
    /// BOSH session error
    Bosh(BoshError),
    /// The transport was already shut down
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(fmt, "IO error: {}", e),
            #[cfg(feature = "bosh")]
            TransportError::Http(e) => write!(fmt, "HTTP error: {}", e),
            TransportError::Bosh(e) => write!(fmt, "BOSH error: {}", e),
            TransportError::Closed => write!(fmt, "transport closed"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            #[cfg(feature = "bosh")]
            TransportError::Http(e) => Some(e),
            TransportError::Bosh(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for TransportError {
    fn from(e: IoError) -> Self {
        TransportError::Io(e)
    }
}

impl From<BoshError> for TransportError {
    fn from(e: BoshError) -> Self {
        TransportError::Bosh(e)
    }
}

#[cfg(feature = "bosh")]
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Http(e)
    }
}

/// XMPP protocol-level error at the stream framing level
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The peer's root element is not `<stream:stream/>`
    InvalidStreamStart(String),
    /// The peer announced a stream version we cannot speak
    UnsupportedVersion(String),
    /// An element arrived which the current negotiation step cannot handle
    UnexpectedElement(String),
    /// The peer sent a second stream header without a restart
    UnexpectedHeader,
    /// Bytes followed `<proceed/>` before the TLS handshake
    DataAfterProceed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::InvalidStreamStart(name) => {
                write!(fmt, "unexpected stream root {}", name)
            }
            ProtocolError::UnsupportedVersion(v) => write!(fmt, "unsupported stream version {}", v),
            ProtocolError::UnexpectedElement(name) => {
                write!(fmt, "unexpected element {} during negotiation", name)
            }
            ProtocolError::UnexpectedHeader => write!(fmt, "unexpected stream header"),
            ProtocolError::DataAfterProceed => {
                write!(fmt, "unencrypted data after STARTTLS proceed")
            }
        }
    }
}

impl StdError for ProtocolError {}

/// Failure of one of the negotiation steps preceding an established
/// stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationFailure {
    /// The server answered `<starttls/>` with `<failure/>`
    TlsRefused,
    /// TLS is required by configuration but the server does not offer it
    TlsRequired,
    /// TLS support is not compiled in
    TlsUnavailable,
    /// The TLS handshake after `<proceed/>` failed
    TlsHandshake(String),
    /// No offered SASL mechanism is usable
    NoMechanism,
    /// The server rejected authentication
    SaslFailed {
        /// Defined condition of the `<failure/>`
        condition: String,
        /// Optional human-readable text
        text: Option<String>,
    },
    /// Local SASL mechanism error
    Sasl(String),
    /// The password provider could not supply a password
    PasswordUnavailable,
    /// Resource binding was rejected
    BindRejected(Option<String>),
    /// The bind result did not carry a usable JID
    InvalidBindResponse,
    /// Legacy session establishment was rejected
    SessionRejected(Option<String>),
    /// The server sent no stream features
    MissingFeatures,
    /// A negotiation step did not complete in time
    Timeout,
}

impl NegotiationFailure {
    /// Whether this failure means the credentials were not accepted, as
    /// opposed to a problem with the server or network.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            NegotiationFailure::SaslFailed { .. } | NegotiationFailure::PasswordUnavailable
        )
    }
}

impl fmt::Display for NegotiationFailure {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NegotiationFailure::TlsRefused => write!(fmt, "server refused STARTTLS"),
            NegotiationFailure::TlsRequired => write!(fmt, "server does not offer TLS"),
            NegotiationFailure::TlsUnavailable => write!(fmt, "TLS support not available"),
            NegotiationFailure::TlsHandshake(e) => write!(fmt, "TLS handshake failed: {}", e),
            NegotiationFailure::NoMechanism => {
                write!(fmt, "no matching SASL mechanism available")
            }
            NegotiationFailure::SaslFailed { condition, text } => match text {
                Some(text) => write!(fmt, "authentication failed: {} ({})", condition, text),
                None => write!(fmt, "authentication failed: {}", condition),
            },
            NegotiationFailure::Sasl(e) => write!(fmt, "local SASL implementation error: {}", e),
            NegotiationFailure::PasswordUnavailable => write!(fmt, "no password available"),
            NegotiationFailure::BindRejected(Some(c)) => write!(fmt, "resource binding rejected: {}", c),
            NegotiationFailure::BindRejected(None) => write!(fmt, "resource binding rejected"),
            NegotiationFailure::InvalidBindResponse => {
                write!(fmt, "invalid response to resource binding")
            }
            NegotiationFailure::SessionRejected(Some(c)) => {
                write!(fmt, "session establishment rejected: {}", c)
            }
            NegotiationFailure::SessionRejected(None) => {
                write!(fmt, "session establishment rejected")
            }
            NegotiationFailure::MissingFeatures => write!(fmt, "no stream features received"),
            NegotiationFailure::Timeout => write!(fmt, "negotiation timed out"),
        }
    }
}

impl StdError for NegotiationFailure {}

/// Resolution of a pending response other than a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseError {
    /// The deadline passed before a reply arrived
    Timeout,
    /// The stream went away before a reply arrived
    ConnectionLost,
}

impl fmt::Display for ResponseError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResponseError::Timeout => write!(fmt, "timed out waiting for response"),
            ResponseError::ConnectionLost => write!(fmt, "connection lost before response"),
        }
    }
}

impl StdError for ResponseError {}

/// Why a connection ended. Reported exactly once per connection.
#[derive(Debug)]
pub enum DisconnectReason {
    /// The local side asked for the connection to be closed
    Requested,
    /// The peer closed its stream
    RemoteClosed,
    /// The transport could not be established
    ConnectFailed(ConnectError),
    /// The established transport failed
    Transport(TransportError),
    /// The peer sent malformed XML
    Parse(ParseError),
    /// The peer violated the stream framing
    Protocol(ProtocolError),
    /// The peer sent a stream error
    StreamError {
        /// Defined condition
        condition: String,
        /// Optional human-readable text
        text: Option<String>,
    },
    /// Negotiation failed
    Negotiation(NegotiationFailure),
}

impl DisconnectReason {
    /// A short, stable code for the reason, suitable for matching in
    /// callers which present failures to users.
    pub fn subcode(&self) -> &'static str {
        match self {
            DisconnectReason::Requested => "requested",
            DisconnectReason::RemoteClosed => "remote-closed",
            DisconnectReason::ConnectFailed(ConnectError::DnsFailure(_)) => "dns-failure",
            DisconnectReason::ConnectFailed(ConnectError::RefusedOrUnreachable(_)) => {
                "refused-or-unreachable"
            }
            DisconnectReason::ConnectFailed(ConnectError::TlsHandshakeFailure(_)) => {
                "tls-handshake-failure"
            }
            DisconnectReason::ConnectFailed(ConnectError::Timeout) => "connect-timeout",
            DisconnectReason::ConnectFailed(ConnectError::Proxy(_)) => "proxy-failure",
            DisconnectReason::ConnectFailed(ConnectError::InvalidEndpoint(_)) => "invalid-endpoint",
            DisconnectReason::Transport(TransportError::Bosh(BoshError::Terminated { .. })) => {
                "bosh-terminated"
            }
            DisconnectReason::Transport(_) => "connection-lost",
            DisconnectReason::Parse(_) => "parse-error",
            DisconnectReason::Protocol(_) => "protocol-violation",
            DisconnectReason::StreamError { .. } => "stream-error",
            DisconnectReason::Negotiation(NegotiationFailure::TlsRefused)
            | DisconnectReason::Negotiation(NegotiationFailure::TlsRequired)
            | DisconnectReason::Negotiation(NegotiationFailure::TlsUnavailable)
            | DisconnectReason::Negotiation(NegotiationFailure::TlsHandshake(_)) => "tls-failed",
            DisconnectReason::Negotiation(e) if e.is_auth_failure() => "auth-failed",
            DisconnectReason::Negotiation(_) => "negotiation-failed",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DisconnectReason::Requested => write!(fmt, "closed locally"),
            DisconnectReason::RemoteClosed => write!(fmt, "stream closed by peer"),
            DisconnectReason::ConnectFailed(e) => write!(fmt, "{}", e),
            DisconnectReason::Transport(e) => write!(fmt, "{}", e),
            DisconnectReason::Parse(e) => write!(fmt, "XML parse error: {}", e),
            DisconnectReason::Protocol(e) => write!(fmt, "{}", e),
            DisconnectReason::StreamError { condition, text } => match text {
                Some(text) => write!(fmt, "stream error: {} ({})", condition, text),
                None => write!(fmt, "stream error: {}", condition),
            },
            DisconnectReason::Negotiation(e) => write!(fmt, "{}", e),
        }
    }
}

impl From<ConnectError> for DisconnectReason {
    fn from(e: ConnectError) -> Self {
        DisconnectReason::ConnectFailed(e)
    }
}

impl From<TransportError> for DisconnectReason {
    fn from(e: TransportError) -> Self {
        DisconnectReason::Transport(e)
    }
}

impl From<ParseError> for DisconnectReason {
    fn from(e: ParseError) -> Self {
        DisconnectReason::Parse(e)
    }
}

impl From<ProtocolError> for DisconnectReason {
    fn from(e: ProtocolError) -> Self {
        DisconnectReason::Protocol(e)
    }
}

impl From<NegotiationFailure> for DisconnectReason {
    fn from(e: NegotiationFailure) -> Self {
        DisconnectReason::Negotiation(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcodes_distinguish_credentials_from_network() {
        let auth = DisconnectReason::Negotiation(NegotiationFailure::SaslFailed {
            condition: "not-authorized".to_owned(),
            text: None,
        });
        assert_eq!(auth.subcode(), "auth-failed");
        let network = DisconnectReason::ConnectFailed(ConnectError::RefusedOrUnreachable(
            io::Error::from(io::ErrorKind::ConnectionRefused),
        ));
        assert_eq!(network.subcode(), "refused-or-unreachable");
        let tls = DisconnectReason::Negotiation(NegotiationFailure::TlsRefused);
        assert_eq!(tls.subcode(), "tls-failed");
    }

    #[test]
    fn io_timeout_maps_to_connect_timeout() {
        let e = ConnectError::from(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(e, ConnectError::Timeout));
    }
}
