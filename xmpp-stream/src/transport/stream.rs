// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XMPP over a byte stream: plain TCP, TCP upgraded by STARTTLS, or TCP
//! wrapped in TLS from the start.

use bytes::{Bytes, BytesMut};
use log::debug;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use super::{tls, AsyncReadAndWrite, ByteTransport};
use crate::config::{ProxyConfig, SecurityMode};
use crate::error::{ConnectError, TransportError};
use crate::session::{OpenStream, STREAM_FOOTER};
use crate::transport::DnsConfig;

/// Read buffer size
pub const RECV_BUFSIZE: usize = 32768;

type Halves = (
    ReadHalf<Box<dyn AsyncReadAndWrite>>,
    WriteHalf<Box<dyn AsyncReadAndWrite>>,
);

/// A [`ByteTransport`] over any duplex byte stream.
pub struct StreamTransport {
    halves: Option<Halves>,
    out: BytesMut,
    read_buf: BytesMut,
    secure: bool,
}

impl StreamTransport {
    /// Wrap an established stream. `secure` tells whether it is already
    /// encrypted.
    pub fn new(stream: Box<dyn AsyncReadAndWrite>, secure: bool) -> StreamTransport {
        StreamTransport {
            halves: Some(split(stream)),
            out: BytesMut::new(),
            read_buf: BytesMut::with_capacity(RECV_BUFSIZE),
            secure,
        }
    }

    /// Connect to the server described by `dns`, through `proxy` if
    /// given, and perform the TLS handshake right away for
    /// [`SecurityMode::DirectTls`].
    pub async fn connect(
        dns: &DnsConfig,
        proxy: Option<&ProxyConfig>,
        security: SecurityMode,
        domain: &str,
    ) -> Result<StreamTransport, ConnectError> {
        let stream: Box<dyn AsyncReadAndWrite> = match proxy {
            Some(proxy) => {
                let (host, port) = dns.target()?;
                debug!("Connecting to proxy {}:{}", proxy.host, proxy.port);
                let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
                super::proxy::tunnel(&mut stream, proxy, &host, port).await?;
                Box::new(stream)
            }
            None => {
                debug!("Connecting to {}", dns);
                Box::new(dns.resolve().await?)
            }
        };
        match security {
            SecurityMode::DirectTls => Ok(StreamTransport::new(
                tls::connect(stream, domain).await?,
                true,
            )),
            _ => Ok(StreamTransport::new(stream, false)),
        }
    }
}

impl ByteTransport for StreamTransport {
    fn write(&mut self, data: Bytes) -> Result<(), TransportError> {
        if self.halves.is_none() {
            return Err(TransportError::Closed);
        }
        self.out.extend_from_slice(&data);
        Ok(())
    }

    fn open_stream(&mut self, header: &OpenStream) -> Result<(), TransportError> {
        self.write(header.to_bytes())
    }

    fn close_stream(&mut self) -> Result<(), TransportError> {
        self.write(Bytes::from_static(STREAM_FOOTER))
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        let StreamTransport { halves, out, .. } = self;
        let (_, writer) = halves.as_mut().ok_or(TransportError::Closed)?;
        while !out.is_empty() {
            writer.write_buf(out).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    async fn read(&mut self) -> Result<Bytes, TransportError> {
        let StreamTransport {
            halves,
            out,
            read_buf,
            ..
        } = self;
        let (reader, writer) = halves.as_mut().ok_or(TransportError::Closed)?;
        loop {
            read_buf.reserve(RECV_BUFSIZE);
            if out.is_empty() {
                reader.read_buf(read_buf).await?;
                return Ok(read_buf.split().freeze());
            }
            tokio::select! {
                result = reader.read_buf(read_buf) => {
                    result?;
                    return Ok(read_buf.split().freeze());
                }
                result = writer.write_buf(out) => {
                    if result? == 0 {
                        return Err(TransportError::Closed);
                    }
                    if out.is_empty() {
                        writer.flush().await?;
                    }
                }
            }
        }
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn supports_starttls(&self) -> bool {
        tls::AVAILABLE && !self.secure
    }

    fn supports_keepalive(&self) -> bool {
        true
    }

    async fn starttls(&mut self, domain: &str) -> Result<(), ConnectError> {
        if self.secure {
            return Ok(());
        }
        self.flush()
            .await
            .map_err(|e| ConnectError::TlsHandshakeFailure(e.to_string()))?;
        let (reader, writer) = self
            .halves
            .take()
            .ok_or_else(|| ConnectError::TlsHandshakeFailure("transport closed".to_owned()))?;
        let stream = tls::connect(reader.unsplit(writer), domain).await?;
        self.halves = Some(split(stream));
        self.secure = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some((_, writer)) = self.halves.as_mut() {
            if let Err(e) = writer.shutdown().await {
                debug!("Error shutting down transport: {}", e);
            }
        }
        self.halves = None;
        self.out.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn read_drives_pending_writes() {
        let (client, mut server) = duplex(64);
        let mut transport = StreamTransport::new(Box::new(client), false);
        // more than the pipe holds, so the write cannot complete at once
        let payload = Bytes::from(vec![b'x'; 1000]);
        transport.write(payload.clone()).unwrap();

        let peer = tokio::spawn(async move {
            let mut received = vec![0u8; 1000];
            server.read_exact(&mut received).await.unwrap();
            server.write_all(b"<iq/>").await.unwrap();
            received
        });

        let data = transport.read().await.unwrap();
        assert_eq!(&data[..], b"<iq/>");
        assert_eq!(peer.await.unwrap(), payload.to_vec());
    }

    #[tokio::test]
    async fn empty_read_means_closed() {
        let (client, server) = duplex(64);
        let mut transport = StreamTransport::new(Box::new(client), false);
        drop(server);
        assert!(transport.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (client, _server) = duplex(64);
        let mut transport = StreamTransport::new(Box::new(client), true);
        assert!(!transport.supports_starttls());
        transport.disconnect().await;
        transport.disconnect().await;
        assert!(matches!(
            transport.write(Bytes::from_static(b" ")),
            Err(TransportError::Closed)
        ));
        assert!(matches!(transport.read().await, Err(TransportError::Closed)));
    }
}
