// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XMPP over BOSH: HTTP long-polling against a connection manager.
//!
//! Nothing is connected up front; the session is created by the first
//! request, which goes out once the stream header is written.

use core::future::Future;
use core::pin::Pin;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, trace};
use reqwest::header::CONTENT_TYPE;
use tokio::time::Instant;

use super::ByteTransport;
use crate::config::{BoshConfig, ProxyConfig, ProxyKind};
use crate::error::{BoshError, ConnectError, TransportError};
use crate::session::OpenStream;

mod session;

pub use session::BoshSession;

type Request = Pin<Box<dyn Future<Output = (u64, Result<Bytes, TransportError>)> + Send>>;

/// A [`ByteTransport`] speaking BOSH through an HTTP client.
pub struct BoshTransport {
    client: reqwest::Client,
    url: String,
    content_type: String,
    session: BoshSession,
    requests: FuturesUnordered<Request>,
    secure: bool,
}

async fn post(request: reqwest::RequestBuilder) -> Result<Bytes, TransportError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(BoshError::HttpStatus(status.as_u16()).into());
    }
    Ok(response.bytes().await?)
}

impl BoshTransport {
    /// Prepare a transport for the connection manager of `config`,
    /// optionally reached through an HTTP proxy.
    pub fn new(config: BoshConfig, proxy: Option<&ProxyConfig>) -> Result<Self, ConnectError> {
        let mut builder = reqwest::Client::builder();
        if let Some(proxy) = proxy {
            if proxy.kind != ProxyKind::HttpConnect {
                return Err(ConnectError::InvalidEndpoint(
                    "BOSH can only be tunnelled through HTTP proxies".to_owned(),
                ));
            }
            let proxy_url = format!("http://{}:{}", proxy.host, proxy.port);
            let mut http_proxy =
                reqwest::Proxy::all(proxy_url).map_err(|e| ConnectError::Proxy(e.to_string()))?;
            if let Some((user, password)) = proxy.credentials.as_ref() {
                http_proxy = http_proxy.basic_auth(user, password);
            }
            builder = builder.proxy(http_proxy);
        }
        let client = builder
            .build()
            .map_err(|e| ConnectError::InvalidEndpoint(e.to_string()))?;
        Ok(BoshTransport {
            client,
            url: config.url.clone(),
            content_type: config.content_type.clone(),
            secure: config.url.starts_with("https://"),
            session: BoshSession::new(config),
            requests: FuturesUnordered::new(),
        })
    }

    // Send every request the session allows right now.
    fn launch(&mut self) {
        while let Some((rid, body)) = self.session.next_request(Instant::now()) {
            trace!("BOSH SEND[{}]: {}", rid, String::from_utf8_lossy(&body));
            let request = self
                .client
                .post(&self.url)
                .header(CONTENT_TYPE, &self.content_type)
                .body(body);
            let timeout = self.session.request_timeout();
            self.requests.push(Box::pin(async move {
                let result = match tokio::time::timeout(timeout, post(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(BoshError::Timeout.into()),
                };
                (rid, result)
            }));
        }
    }

    fn on_response(
        &mut self,
        rid: u64,
        result: Result<Bytes, TransportError>,
    ) -> Result<(), TransportError> {
        let data = result?;
        trace!("BOSH RECV[{}]: {}", rid, String::from_utf8_lossy(&data));
        self.session.on_response(rid, &data, Instant::now())?;
        Ok(())
    }
}

impl ByteTransport for BoshTransport {
    fn write(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.session.queue(&data)?;
        Ok(())
    }

    fn open_stream(&mut self, header: &OpenStream) -> Result<(), TransportError> {
        self.session.open(header);
        Ok(())
    }

    fn close_stream(&mut self) -> Result<(), TransportError> {
        self.session.terminate();
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.launch();
        Ok(())
    }

    async fn read(&mut self) -> Result<Bytes, TransportError> {
        loop {
            if let Some(data) = self.session.take_inbound() {
                return Ok(data);
            }
            if let Some(failure) = self.session.take_failure() {
                return Err(failure.into());
            }
            if self.session.is_closed() {
                return Ok(Bytes::new());
            }
            self.launch();
            if self.requests.is_empty() {
                match self.session.poll_not_before() {
                    Some(at) => {
                        tokio::time::sleep_until(at).await;
                        continue;
                    }
                    // not opened yet
                    None => return futures::future::pending().await,
                }
            }
            if let Some((rid, result)) = self.requests.next().await {
                self.on_response(rid, result)?;
            }
        }
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn supports_starttls(&self) -> bool {
        false
    }

    fn supports_keepalive(&self) -> bool {
        false
    }

    fn qualified_stanzas(&self) -> bool {
        true
    }

    async fn starttls(&mut self, _domain: &str) -> Result<(), ConnectError> {
        Err(ConnectError::TlsHandshakeFailure(
            "STARTTLS is not available over BOSH".to_owned(),
        ))
    }

    async fn disconnect(&mut self) {
        self.session.terminate();
        self.launch();
        // wait for the terminating request, the caller bounds how long
        while !self.session.is_closed() {
            let Some((rid, result)) = self.requests.next().await else {
                break;
            };
            if let Err(e) = self.on_response(rid, result) {
                debug!("BOSH session ended with {}", e);
                break;
            }
            while self.session.take_inbound().is_some() {}
        }
        self.requests.clear();
    }
}
