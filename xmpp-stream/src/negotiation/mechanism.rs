// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SASL mechanism selection.

use sasl::client::mechanisms::{Anonymous, Plain, Scram};
use sasl::client::Mechanism as SaslMechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};

use super::digest_md5::DigestMd5;
use crate::config::SaslConfig;
use crate::error::NegotiationFailure;

/// Supplies the account password when authentication first needs it.
pub trait PasswordProvider: Send {
    /// Return the password, or `None` if it cannot be obtained.
    fn password(&mut self) -> Option<String>;
}

impl<F> PasswordProvider for F
where
    F: FnMut() -> Option<String> + Send,
{
    fn password(&mut self) -> Option<String> {
        self()
    }
}

/// A password known up front.
#[derive(Clone)]
pub struct StaticPassword(pub String);

impl PasswordProvider for StaticPassword {
    fn password(&mut self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Password lookup which asks the provider at most once.
pub(crate) struct PasswordCache {
    provider: Box<dyn PasswordProvider>,
    value: Option<Option<String>>,
}

impl PasswordCache {
    pub(crate) fn new(provider: Box<dyn PasswordProvider>) -> PasswordCache {
        PasswordCache {
            provider,
            value: None,
        }
    }

    pub(crate) fn get(&mut self) -> Result<String, NegotiationFailure> {
        let provider = &mut self.provider;
        self.value
            .get_or_insert_with(|| {
                log::debug!("Requesting password");
                provider.password()
            })
            .clone()
            .ok_or(NegotiationFailure::PasswordUnavailable)
    }
}

/// A mechanism in use for one authentication attempt.
pub(crate) enum Mechanism {
    Sasl(Box<dyn SaslMechanism + Send>),
    DigestMd5(DigestMd5),
}

fn sasl_error<E: core::fmt::Debug>(e: E) -> NegotiationFailure {
    NegotiationFailure::Sasl(format!("{:?}", e))
}

impl Mechanism {
    /// Instantiate mechanism `name` for `username` at `host`.
    ///
    /// Only DIGEST-MD5 defers the password lookup to the first challenge.
    pub(crate) fn create(
        name: &str,
        username: Option<&str>,
        host: &str,
        password: &mut PasswordCache,
    ) -> Result<Mechanism, NegotiationFailure> {
        if name == "ANONYMOUS" {
            return Ok(Mechanism::Sasl(Box::new(Anonymous::new())));
        }
        let username = username.ok_or(NegotiationFailure::NoMechanism)?;
        if name == "DIGEST-MD5" {
            return Ok(Mechanism::DigestMd5(DigestMd5::new("xmpp", host, username)));
        }
        let creds = Credentials::default()
            .with_username(username)
            .with_password(password.get()?)
            .with_channel_binding(ChannelBinding::None);
        let mechanism: Box<dyn SaslMechanism + Send> = match name {
            "SCRAM-SHA-256" => {
                Box::new(Scram::<Sha256>::from_credentials(creds).map_err(sasl_error)?)
            }
            "SCRAM-SHA-1" => {
                Box::new(Scram::<Sha1>::from_credentials(creds).map_err(sasl_error)?)
            }
            "PLAIN" => Box::new(Plain::from_credentials(creds).map_err(sasl_error)?),
            _ => return Err(NegotiationFailure::NoMechanism),
        };
        Ok(Mechanism::Sasl(mechanism))
    }

    pub(crate) fn name(&self) -> &str {
        match self {
            Mechanism::Sasl(m) => m.name(),
            Mechanism::DigestMd5(_) => "DIGEST-MD5",
        }
    }

    pub(crate) fn initial(&mut self) -> Vec<u8> {
        match self {
            Mechanism::Sasl(m) => m.initial(),
            Mechanism::DigestMd5(_) => Vec::new(),
        }
    }

    pub(crate) fn response(
        &mut self,
        challenge: &[u8],
        password: &mut PasswordCache,
    ) -> Result<Vec<u8>, NegotiationFailure> {
        match self {
            Mechanism::Sasl(m) => m.response(challenge).map_err(sasl_error),
            Mechanism::DigestMd5(m) => {
                if !m.has_password() {
                    m.set_password(password.get()?);
                }
                m.response(challenge).map_err(NegotiationFailure::Sasl)
            }
        }
    }

    pub(crate) fn success(&mut self, data: &[u8]) -> Result<(), NegotiationFailure> {
        match self {
            Mechanism::Sasl(m) => m.success(data).map_err(sasl_error),
            Mechanism::DigestMd5(m) => m.success(data).map_err(NegotiationFailure::Sasl),
        }
    }
}

/// Mechanisms to try, in order: those we prefer which the server offers
/// and which can work in the current situation.
pub(crate) fn candidates(
    config: &SaslConfig,
    offered: &[String],
    has_username: bool,
    secure: bool,
) -> Vec<String> {
    config
        .mechanisms
        .iter()
        .filter(|name| offered.iter().any(|o| o == *name))
        .filter(|name| match name.as_str() {
            "ANONYMOUS" => !has_username,
            "PLAIN" => has_username && (secure || config.allow_plain_insecure),
            "SCRAM-SHA-256" | "SCRAM-SHA-1" | "DIGEST-MD5" => has_username,
            _ => false,
        })
        .cloned()
        .collect()
}
