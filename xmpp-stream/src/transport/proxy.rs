// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tunnels through HTTP `CONNECT` and SOCKS5 proxies.
//!
//! Both run on a freshly connected stream to the proxy and leave it
//! positioned right after the proxy's reply, ready for the XMPP stream.

use std::net::IpAddr;

use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{ProxyConfig, ProxyKind};
use crate::error::ConnectError;

// longest HTTP reply head we are willing to read
const MAX_HEAD: usize = 8192;

const SOCKS_ERRORS: [&str; 8] = [
    "general SOCKS server failure",
    "connection not allowed by ruleset",
    "network unreachable",
    "host unreachable",
    "connection refused",
    "TTL expired",
    "command not supported",
    "address type not supported",
];

fn invalid_reply() -> ConnectError {
    ConnectError::Proxy("invalid proxy reply".to_owned())
}

/// Ask the proxy at the other end of `stream` to connect to
/// `host`:`port`.
pub async fn tunnel<S>(
    stream: &mut S,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(
        "Opening tunnel to {}:{} through {:?} proxy {}:{}",
        host, port, proxy.kind, proxy.host, proxy.port
    );
    match proxy.kind {
        ProxyKind::HttpConnect => http_connect(stream, proxy, host, port).await,
        ProxyKind::Socks5 => socks5(stream, proxy, host, port).await,
    }
}

async fn http_connect<S>(
    stream: &mut S,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Proxy-Connection: Keep-Alive\r\n\
         Pragma: no-cache\r\n"
    );
    if let Some((user, password)) = proxy.credentials.as_ref() {
        let token = Base64.encode(format!("{}:{}", user, password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Read byte by byte so nothing past the reply head is consumed.
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            return Err(invalid_reply());
        }
        head.push(stream.read_u8().await?);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let (Some(proto), Some(code)) = (parts.next(), parts.next()) else {
        return Err(invalid_reply());
    };
    if !proto.starts_with("HTTP/") {
        return Err(invalid_reply());
    }
    if code != "200" {
        return Err(ConnectError::Proxy(format!(
            "proxy refused tunnel: {}",
            status_line
        )));
    }
    Ok(())
}

async fn socks5<S>(
    stream: &mut S,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // RFC 1928 greeting: offer "no auth", and username/password if we have
    // credentials
    match proxy.credentials {
        Some(_) => stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await?,
        None => stream.write_all(&[0x05, 0x01, 0x00]).await?,
    }
    stream.flush().await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x05 {
        return Err(invalid_reply());
    }
    match (reply[1], proxy.credentials.as_ref()) {
        (0x00, _) => (),
        (0x02, Some((user, password))) => socks5_auth(stream, user, password).await?,
        (0xff, _) => {
            return Err(ConnectError::Proxy(
                "no acceptable authentication method".to_owned(),
            ))
        }
        _ => return Err(invalid_reply()),
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len())
                .map_err(|_| ConnectError::Proxy(format!("host name {} too long", host)))?;
            request.push(0x03);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != 0x05 {
        return Err(invalid_reply());
    }
    if head[1] != 0x00 {
        let reason = SOCKS_ERRORS
            .get(usize::from(head[1]).wrapping_sub(1))
            .copied()
            .unwrap_or("invalid proxy reply");
        return Err(ConnectError::Proxy(reason.to_owned()));
    }
    // skip the bound address and port
    let address_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => usize::from(stream.read_u8().await?),
        _ => return Err(invalid_reply()),
    };
    let mut bound = vec![0u8; address_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

// RFC 1929
async fn socks5_auth<S>(stream: &mut S, user: &str, password: &str) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let too_long = || ConnectError::Proxy("proxy credentials too long".to_owned());
    let user_len = u8::try_from(user.len()).map_err(|_| too_long())?;
    let password_len = u8::try_from(password.len()).map_err(|_| too_long())?;

    let mut request = vec![0x01, user_len];
    request.extend_from_slice(user.as_bytes());
    request.push(password_len);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x01 {
        return Err(invalid_reply());
    }
    if reply[1] != 0x00 {
        return Err(ConnectError::Proxy(
            "authentication to proxy failed".to_owned(),
        ));
    }
    Ok(())
}
