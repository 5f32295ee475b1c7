// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Connection configuration.

use core::time::Duration;

use jid::Jid;

use crate::ns;
use crate::transport::DnsConfig;

/// Timeouts applied by the connection driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Maximum time to establish the transport, including proxy and
    /// direct TLS handshakes.
    pub connect: Duration,

    /// Default deadline for responses the engine waits for itself
    /// (negotiation steps) and for [`crate::connection::ConnectionHandle::send_with_response`]
    /// calls which do not pass their own.
    pub response: Duration,

    /// Maximum time spent flushing and closing the transport once a
    /// disconnect was decided.
    pub disconnect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::new(30, 0),
            response: Duration::new(25, 0),
            disconnect: Duration::new(5, 0),
        }
    }
}

impl Timeouts {
    /// Tight timeouts suitable for communicating on a fast LAN or localhost.
    pub fn tight() -> Self {
        Self {
            connect: Duration::new(5, 0),
            response: Duration::new(5, 0),
            disconnect: Duration::new(1, 0),
        }
    }
}

/// How the stream is protected on a TCP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    /// Never negotiate TLS.
    Plain,
    /// Negotiate STARTTLS when the server offers it.
    StartTlsOptional,
    /// Require STARTTLS; fail if the server does not offer it.
    #[default]
    StartTlsRequired,
    /// Perform the TLS handshake before the stream header.
    DirectTls,
}

/// Kind of proxy to tunnel the TCP connection through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// RFC 1928 SOCKS version 5
    Socks5,
    /// HTTP `CONNECT` method
    HttpConnect,
}

/// Proxy descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy protocol
    pub kind: ProxyKind,
    /// Proxy host name or address
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Optional username and password
    pub credentials: Option<(String, String)>,
}

/// BOSH (XEP-0124/XEP-0206) connection manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoshConfig {
    /// Connection manager URL
    pub url: String,
    /// Optional `route` attribute (`xmpp:host:port`)
    pub route: Option<String>,
    /// Longest time the connection manager may hold a request
    pub wait: Duration,
    /// Number of requests the connection manager may hold at once
    pub hold: u32,
    /// Number of simultaneous requests before the server tells us its own
    /// limit
    pub requests: u32,
    /// Extra time allowed on top of `wait` before a request is considered
    /// lost
    pub grace: Duration,
    /// `Content-Type` of requests
    pub content_type: String,
    /// XEP-0124 protocol version
    pub ver: String,
    /// Maximum number of outgoing bytes buffered while no request slot is
    /// free
    pub max_pending: usize,
}

impl BoshConfig {
    /// Settings with the customary defaults for the given connection
    /// manager URL.
    pub fn new<S: Into<String>>(url: S) -> BoshConfig {
        BoshConfig {
            url: url.into(),
            route: None,
            wait: Duration::from_secs(60),
            hold: 1,
            requests: 2,
            grace: Duration::from_secs(10),
            content_type: "text/xml; charset=utf-8".to_owned(),
            ver: "1.6".to_owned(),
            max_pending: 1024 * 1024,
        }
    }
}

/// Where to connect to.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// A TCP connection, optionally protected by TLS
    Tcp {
        /// How to find the server
        dns: DnsConfig,
        /// How to protect the connection
        security: SecurityMode,
    },
    /// A BOSH connection manager
    Bosh(BoshConfig),
}

/// SASL preferences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslConfig {
    /// Mechanisms we are willing to use, most preferred first
    pub mechanisms: Vec<String>,
    /// Allow PLAIN on a channel which is not encrypted
    pub allow_plain_insecure: bool,
}

impl Default for SaslConfig {
    fn default() -> Self {
        SaslConfig {
            mechanisms: ["SCRAM-SHA-256", "SCRAM-SHA-1", "DIGEST-MD5", "PLAIN", "ANONYMOUS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allow_plain_insecure: false,
        }
    }
}

/// Everything needed to establish one XMPP client connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Account to log in as; a resource, if present, is requested during
    /// binding
    pub jid: Jid,
    /// Where and how to connect
    pub endpoint: Endpoint,
    /// Optional proxy for TCP endpoints
    pub proxy: Option<ProxyConfig>,
    /// Namespace of stanzas on this stream
    pub default_ns: String,
    /// `xml:lang` of the stream
    pub lang: Option<String>,
    /// Timeouts
    pub timeouts: Timeouts,
    /// SASL preferences
    pub sasl: SaslConfig,
    /// Send a whitespace ping after this much outbound silence
    pub keepalive: Option<Duration>,
    /// Upper bound on one buffered syntactic unit of inbound XML
    pub max_buffer: usize,
}

impl ConnectionConfig {
    /// Configuration for a client connection over TCP with mandatory
    /// STARTTLS, locating the server via the domain of `jid`.
    pub fn new(jid: Jid) -> ConnectionConfig {
        let domain = jid.domain().as_str().to_owned();
        ConnectionConfig {
            jid,
            endpoint: Endpoint::Tcp {
                dns: DnsConfig::default_client(&domain),
                security: SecurityMode::default(),
            },
            proxy: None,
            default_ns: ns::JABBER_CLIENT.to_owned(),
            lang: None,
            timeouts: Timeouts::default(),
            sasl: SaslConfig::default(),
            keepalive: Some(Duration::from_secs(300)),
            max_buffer: crate::parser::DEFAULT_MAX_BUFFER,
        }
    }

    /// Replace the endpoint.
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> ConnectionConfig {
        self.endpoint = endpoint;
        self
    }

    /// Tunnel TCP connections through a proxy.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> ConnectionConfig {
        self.proxy = Some(proxy);
        self
    }

    /// Replace the timeouts.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> ConnectionConfig {
        self.timeouts = timeouts;
        self
    }

    /// Replace the SASL preferences.
    pub fn with_sasl(mut self, sasl: SaslConfig) -> ConnectionConfig {
        self.sasl = sasl;
        self
    }

    /// The domain the stream is addressed to.
    pub fn domain(&self) -> &str {
        self.jid.domain().as_str()
    }
}
