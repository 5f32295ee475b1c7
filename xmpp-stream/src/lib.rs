// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Incremental [XMPP](https://xmpp.org/) stream engine with asynchronous I/O using [tokio](https://tokio.rs/).
//!
//! The crate sits between a raw byte transport and application-level
//! stanza handlers: it parses the never-ending XML document of an XMPP
//! stream as bytes arrive, rebuilds every top-level stanza as a [`Node`],
//! correlates replies with the requests awaiting them, dispatches
//! everything else to registered handlers, and negotiates the stream
//! (STARTTLS, SASL, resource binding) before handing it to the
//! application.
//!
//! # Getting started
//!
//! Create a [`Connection`] from a [`ConnectionConfig`], spawn
//! [`Connection::run`] and talk to it through the returned
//! [`ConnectionHandle`]. A complete example lives in
//! `examples/echo_bot.rs`.
//!
//! The pieces are usable on their own as well: [`parser::XmlParser`] and
//! [`builder::StanzaBuilder`] never do I/O, and [`StreamSession`] only
//! queues what it wants sent, so they can be driven by other event loops.
//!
//! # Features
//!
//! Supported transports:
//! - [x] Plaintext TCP (IPv4/IPv6), optionally through a SOCKS5 or HTTP `CONNECT` proxy
//! - [x] StartTLS TCP (IPv4/IPv6 with [happy eyeballs](https://en.wikipedia.org/wiki/Happy_Eyeballs) support)
//! - [x] Direct TLS
//! - [x] BOSH
//! - [ ] Websockets
//!
//! SASL mechanisms: SCRAM-SHA-256, SCRAM-SHA-1, DIGEST-MD5, PLAIN and
//! ANONYMOUS.
//!
//! Reconnection is left to the application: a connection reports why it
//! ended exactly once and is then done.

#![deny(unsafe_code, missing_docs, bare_trait_objects)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod builder;
pub mod config;
pub mod negotiation;
pub mod node;
pub mod ns;
pub mod parser;
pub mod session;
pub mod traffic;
pub mod transport;

mod connection;
pub use connection::{Connection, ConnectionHandle, ConnectionState, Status};

/// Detailed error types
pub mod error;

#[doc(inline)]
/// Generic xmpp_stream Error
pub use crate::error::Error;

pub use config::ConnectionConfig;
pub use node::Node;
pub use session::StreamSession;

// Re-exports
pub use jid;
