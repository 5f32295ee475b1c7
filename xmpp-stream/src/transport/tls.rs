// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! TLS client handshake over an established byte stream, used both for
//! STARTTLS and for direct TLS.

#[cfg(feature = "tls-rust")]
use {
    std::sync::Arc,
    tokio_rustls::{
        rustls::pki_types::ServerName,
        rustls::{ClientConfig, RootCertStore},
        TlsConnector,
    },
};

use super::AsyncReadAndWrite;
use crate::error::ConnectError;

/// Whether TLS support is compiled in.
pub const AVAILABLE: bool = cfg!(feature = "tls-rust");

#[cfg(feature = "tls-rust")]
fn client_config() -> Result<ClientConfig, ConnectError> {
    let mut root_store = RootCertStore::empty();
    #[cfg(feature = "webpki-roots")]
    {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    #[cfg(feature = "rustls-native-certs")]
    {
        let certs = rustls_native_certs::load_native_certs()
            .map_err(|e| ConnectError::TlsHandshakeFailure(e.to_string()))?;
        let (added, ignored) = root_store.add_parsable_certificates(certs);
        log::debug!("Loaded {} native root certificates, ignored {}", added, ignored);
    }
    Ok(ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// Perform the client side of a TLS handshake with `domain` on `stream`.
#[cfg(feature = "tls-rust")]
pub async fn connect(
    stream: Box<dyn AsyncReadAndWrite>,
    domain: &str,
) -> Result<Box<dyn AsyncReadAndWrite>, ConnectError> {
    let server_name = ServerName::try_from(domain.to_owned())
        .map_err(|e| ConnectError::TlsHandshakeFailure(e.to_string()))?;
    let config = client_config()?;
    log::debug!("Starting TLS handshake with {}", domain);
    let tls_stream = TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .map_err(|e| ConnectError::TlsHandshakeFailure(e.to_string()))?;
    Ok(Box::new(tls_stream))
}

/// Perform the client side of a TLS handshake with `domain` on `stream`.
#[cfg(not(feature = "tls-rust"))]
pub async fn connect(
    _stream: Box<dyn AsyncReadAndWrite>,
    _domain: &str,
) -> Result<Box<dyn AsyncReadAndWrite>, ConnectError> {
    Err(ConnectError::TlsHandshakeFailure(
        "TLS support not compiled in".to_owned(),
    ))
}
