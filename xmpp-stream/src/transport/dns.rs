// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#[cfg(feature = "dns")]
use futures::{future::select_ok, FutureExt};
#[cfg(feature = "dns")]
use hickory_resolver::{
    config::LookupIpStrategy, name_server::TokioConnectionProvider, IntoName, TokioAsyncResolver,
};
use log::debug;
#[cfg(feature = "dns")]
use std::net::SocketAddr;
use tokio::net::TcpStream;

use crate::error::ConnectError;

/// Port of the client-to-server service when SRV records give none.
pub const DEFAULT_CLIENT_PORT: u16 = 5222;

/// How to find the TCP endpoint of a server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DnsConfig {
    /// Use SRV record to find server host
    #[cfg(feature = "dns")]
    UseSrv {
        /// Hostname to resolve
        host: String,
        /// TXT field eg. _xmpp-client._tcp
        srv: String,
        /// When SRV resolution fails what port to use
        fallback_port: u16,
    },

    /// Manually define server host and port
    #[cfg(feature = "dns")]
    NoSrv {
        /// Server host name
        host: String,
        /// Server port
        port: u16,
    },

    /// Manually define `host:port`, resolved by the system resolver
    Addr {
        /// host:port
        addr: String,
    },
}

impl std::fmt::Display for DnsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "dns")]
            Self::UseSrv { host, .. } => write!(f, "{}", host),
            #[cfg(feature = "dns")]
            Self::NoSrv { host, port } => write!(f, "{}:{}", host, port),
            Self::Addr { addr } => write!(f, "{}", addr),
        }
    }
}

impl DnsConfig {
    /// Constructor for DnsConfig::UseSrv variant
    #[cfg(feature = "dns")]
    pub fn srv(host: &str, srv: &str, fallback_port: u16) -> Self {
        Self::UseSrv {
            host: host.to_string(),
            srv: srv.to_string(),
            fallback_port,
        }
    }

    /// Constructor for DnsConfig::NoSrv variant
    #[cfg(feature = "dns")]
    pub fn no_srv(host: &str, port: u16) -> Self {
        Self::NoSrv {
            host: host.to_string(),
            port,
        }
    }

    /// Constructor for DnsConfig::Addr variant
    pub fn addr(addr: &str) -> Self {
        Self::Addr {
            addr: addr.to_string(),
        }
    }

    /// The usual way for a client to find the server of `host`: SRV
    /// lookup of `_xmpp-client._tcp` when DNS support is built in, the
    /// standard port otherwise.
    pub fn default_client(host: &str) -> Self {
        #[cfg(feature = "dns")]
        {
            Self::srv(host, "_xmpp-client._tcp", DEFAULT_CLIENT_PORT)
        }
        #[cfg(not(feature = "dns"))]
        {
            Self::addr(&format!("{}:{}", host, DEFAULT_CLIENT_PORT))
        }
    }

    /// Host and port to ask a proxy for. Proxies resolve names
    /// themselves, so no SRV lookup takes place.
    pub fn target(&self) -> Result<(String, u16), ConnectError> {
        match self {
            #[cfg(feature = "dns")]
            Self::UseSrv {
                host,
                fallback_port,
                ..
            } => Ok((host.clone(), *fallback_port)),
            #[cfg(feature = "dns")]
            Self::NoSrv { host, port } => Ok((host.clone(), *port)),
            Self::Addr { addr } => {
                let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
                    ConnectError::InvalidEndpoint(format!("{} has no port", addr))
                })?;
                let port = port
                    .parse()
                    .map_err(|_| ConnectError::InvalidEndpoint(format!("bad port in {}", addr)))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                Ok((host.to_owned(), port))
            }
        }
    }

    /// Try resolve the DnsConfig to a TcpStream
    pub async fn resolve(&self) -> Result<TcpStream, ConnectError> {
        match self {
            #[cfg(feature = "dns")]
            Self::UseSrv {
                host,
                srv,
                fallback_port,
            } => Self::resolve_srv(host, srv, *fallback_port).await,
            #[cfg(feature = "dns")]
            Self::NoSrv { host, port } => Self::resolve_no_srv(host, *port).await,
            Self::Addr { addr } => {
                debug!("Attempting connection to {addr}");
                let mut last_error = None;
                for candidate in tokio::net::lookup_host(addr.as_str())
                    .await
                    .map_err(|e| ConnectError::DnsFailure(e.to_string()))?
                {
                    match TcpStream::connect(candidate).await {
                        Ok(stream) => return Ok(stream),
                        Err(e) => last_error = Some(e),
                    }
                }
                Err(match last_error {
                    Some(e) => e.into(),
                    None => ConnectError::DnsFailure(format!("{} has no addresses", addr)),
                })
            }
        }
    }

    #[cfg(feature = "dns")]
    async fn resolve_srv(
        host: &str,
        srv: &str,
        fallback_port: u16,
    ) -> Result<TcpStream, ConnectError> {
        let ascii_domain = idna::domain_to_ascii(host)?;

        if let Ok(ip) = ascii_domain.parse() {
            debug!("Attempting connection to {ip}:{fallback_port}");
            return Ok(TcpStream::connect(&SocketAddr::new(ip, fallback_port)).await?);
        }

        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;

        let srv_domain = format!("{}.{}.", srv, ascii_domain).into_name()?;
        let srv_records = resolver.srv_lookup(srv_domain.clone()).await.ok();

        match srv_records {
            Some(lookup) => {
                let mut records: Vec<_> = lookup.iter().collect();
                // lowest priority first, heaviest first within a priority
                records.sort_by_key(|srv| (srv.priority(), u16::MAX - srv.weight()));
                let mut last_error = None;
                for srv in records {
                    debug!("Attempting connection to {srv_domain} {srv}");
                    match Self::resolve_no_srv(&srv.target().to_ascii(), srv.port()).await {
                        Ok(stream) => return Ok(stream),
                        Err(e) => {
                            debug!("Connection to {} failed: {}", srv.target(), e);
                            last_error = Some(e);
                        }
                    }
                }
                Err(last_error.unwrap_or_else(|| {
                    ConnectError::DnsFailure(format!("{} has no usable SRV records", srv_domain))
                }))
            }
            None => {
                // SRV lookup error, retry with hostname
                debug!("Attempting connection to {host}:{fallback_port}");
                Self::resolve_no_srv(host, fallback_port).await
            }
        }
    }

    #[cfg(feature = "dns")]
    async fn resolve_no_srv(host: &str, port: u16) -> Result<TcpStream, ConnectError> {
        let ascii_domain = idna::domain_to_ascii(host)?;

        if let Ok(ip) = ascii_domain.parse() {
            return Ok(TcpStream::connect(&SocketAddr::new(ip, port)).await?);
        }

        let (config, mut options) = hickory_resolver::system_conf::read_system_conf()?;
        options.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        let resolver = TokioAsyncResolver::new(config, options, TokioConnectionProvider::default());

        let ips: Vec<_> = resolver.lookup_ip(ascii_domain).await?.into_iter().collect();
        if ips.is_empty() {
            return Err(ConnectError::DnsFailure(format!("{} has no addresses", host)));
        }

        // Happy Eyeballs: connect to all records in parallel, return the
        // first to succeed
        select_ok(
            ips.into_iter()
                .map(|ip| TcpStream::connect(SocketAddr::new(ip, port)).boxed()),
        )
        .await
        .map(|(result, _)| result)
        .map_err(ConnectError::from)
    }
}
