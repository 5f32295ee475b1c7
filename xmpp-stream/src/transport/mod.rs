// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Byte transports
//!
//! A [`ByteTransport`] is a duplex channel of XML bytes which hides how the
//! bytes travel: over TCP, over TLS, or wrapped in BOSH HTTP requests.
//! Writes are only queued; they make progress while [`ByteTransport::read`]
//! is awaited or when [`ByteTransport::flush`] is called, so a driver can
//! wait on a single future per connection.

use core::future::Future;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{ConnectionConfig, Endpoint};
use crate::error::{ConnectError, TransportError};
use crate::session::OpenStream;

#[cfg(feature = "bosh")]
pub mod bosh;
mod dns;
pub mod proxy;
mod stream;
pub mod tls;

#[cfg(feature = "bosh")]
pub use bosh::BoshTransport;
pub use dns::{DnsConfig, DEFAULT_CLIENT_PORT};
pub use stream::{StreamTransport, RECV_BUFSIZE};

/// trait returned wrapped in a `ByteTransport`
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// A duplex byte channel carrying one XMPP stream.
pub trait ByteTransport: Send {
    /// Queue serialized stanzas for sending.
    fn write(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Open the stream, or restart it after TLS or SASL.
    fn open_stream(&mut self, header: &OpenStream) -> Result<(), TransportError>;

    /// Close the stream.
    fn close_stream(&mut self) -> Result<(), TransportError>;

    /// Push everything queued towards the peer.
    fn flush(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait for received bytes while making progress on queued writes.
    /// An empty result means the peer closed the connection.
    ///
    /// Cancel safe: dropping the future loses neither received nor queued
    /// data.
    fn read(&mut self) -> impl Future<Output = Result<Bytes, TransportError>> + Send;

    /// Whether the channel is encrypted.
    fn is_secure(&self) -> bool;

    /// Whether [`Self::starttls`] can succeed.
    fn supports_starttls(&self) -> bool;

    /// Whether whitespace keepalives make sense on this transport.
    fn supports_keepalive(&self) -> bool;

    /// Whether stanzas travel outside the stream root and must declare
    /// their namespace.
    fn qualified_stanzas(&self) -> bool {
        false
    }

    /// Upgrade the channel to TLS once the server sent `<proceed/>`.
    fn starttls(&mut self, domain: &str) -> impl Future<Output = Result<(), ConnectError>> + Send;

    /// Shut the channel down. Idempotent.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

/// The transports selectable through [`Endpoint`].
pub enum Transport {
    /// TCP, optionally with TLS
    Stream(StreamTransport),
    /// BOSH
    #[cfg(feature = "bosh")]
    Bosh(BoshTransport),
}

impl Transport {
    /// Establish the transport described by `config`, giving up after
    /// the connect timeout.
    pub async fn connect(config: &ConnectionConfig) -> Result<Transport, ConnectError> {
        let attempt = async {
            let transport: Result<Transport, ConnectError> = match &config.endpoint {
                Endpoint::Tcp { dns, security } => {
                    let proxy = config.proxy.as_ref();
                    StreamTransport::connect(dns, proxy, *security, config.domain())
                        .await
                        .map(Transport::Stream)
                }
                #[cfg(feature = "bosh")]
                Endpoint::Bosh(bosh) => {
                    BoshTransport::new(bosh.clone(), config.proxy.as_ref()).map(Transport::Bosh)
                }
                #[cfg(not(feature = "bosh"))]
                Endpoint::Bosh(_) => Err(ConnectError::InvalidEndpoint(
                    "BOSH support not compiled in".to_owned(),
                )),
            };
            transport
        };
        tokio::time::timeout(config.timeouts.connect, attempt)
            .await
            .map_err(|_| ConnectError::Timeout)?
    }
}

macro_rules! delegate {
    ($self:ident, $t:ident => $e:expr) => {
        match $self {
            Transport::Stream($t) => $e,
            #[cfg(feature = "bosh")]
            Transport::Bosh($t) => $e,
        }
    };
}

impl ByteTransport for Transport {
    fn write(&mut self, data: Bytes) -> Result<(), TransportError> {
        delegate!(self, t => t.write(data))
    }

    fn open_stream(&mut self, header: &OpenStream) -> Result<(), TransportError> {
        delegate!(self, t => t.open_stream(header))
    }

    fn close_stream(&mut self) -> Result<(), TransportError> {
        delegate!(self, t => t.close_stream())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        delegate!(self, t => t.flush().await)
    }

    async fn read(&mut self) -> Result<Bytes, TransportError> {
        delegate!(self, t => t.read().await)
    }

    fn is_secure(&self) -> bool {
        delegate!(self, t => t.is_secure())
    }

    fn supports_starttls(&self) -> bool {
        delegate!(self, t => t.supports_starttls())
    }

    fn supports_keepalive(&self) -> bool {
        delegate!(self, t => t.supports_keepalive())
    }

    fn qualified_stanzas(&self) -> bool {
        delegate!(self, t => t.qualified_stanzas())
    }

    async fn starttls(&mut self, domain: &str) -> Result<(), ConnectError> {
        delegate!(self, t => t.starttls(domain).await)
    }

    async fn disconnect(&mut self) {
        delegate!(self, t => t.disconnect().await)
    }
}
