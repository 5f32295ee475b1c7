// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! RFC 2831 DIGEST-MD5, client side.

use std::collections::BTreeMap;

use md5::{Digest, Md5};
use rand::{thread_rng, Rng};

/// Parsed challenge. Keys may repeat, `realm` in particular, so every key
/// maps to the values in the order they appeared.
pub(crate) type Directives = BTreeMap<String, Vec<String>>;

/// Split a challenge into its directives.
///
/// Values may be quoted; inside quotes `\` escapes the next character and
/// commas do not separate directives.
pub(crate) fn parse_directives(data: &str) -> Result<Directives, String> {
    let mut directives = Directives::new();
    let mut chars = data.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) if c == ',' => return Err(format!("directive {:?} has no value", key)),
                Some(c) => key.push(c),
                None => return Err(format!("directive {:?} has no value", key)),
            }
        }
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err("empty directive name".to_owned());
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => return Err("unterminated escape".to_owned()),
                    },
                    Some(c) => value.push(c),
                    None => return Err(format!("unterminated value of {:?}", key)),
                }
            }
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            match chars.next() {
                None | Some(',') => (),
                Some(c) => return Err(format!("unexpected {:?} after {:?}", c, key)),
            }
        } else {
            for c in chars.by_ref() {
                if c == ',' {
                    break;
                }
                value.push(c);
            }
            value = value.trim().to_owned();
        }
        directives.entry(key).or_default().push(value);
    }
    Ok(directives)
}

fn first<'a>(directives: &'a Directives, key: &str) -> Option<&'a str> {
    directives
        .get(key)
        .and_then(|values| values.first())
        .map(String::as_str)
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[derive(Debug)]
enum State {
    Initial,
    // waiting for rspauth
    Responded { rspauth: String },
    Done,
}

/// DIGEST-MD5 exchange state.
///
/// The password is set by the caller just before the first challenge is
/// answered, so it is only requested once the server actually asks.
#[derive(Debug)]
pub(crate) struct DigestMd5 {
    service: String,
    host: String,
    username: String,
    password: Option<String>,
    cnonce: String,
    state: State,
}

impl DigestMd5 {
    pub(crate) fn new(service: &str, host: &str, username: &str) -> DigestMd5 {
        let cnonce: [u8; 16] = thread_rng().gen();
        DigestMd5 {
            service: service.to_owned(),
            host: host.to_owned(),
            username: username.to_owned(),
            password: None,
            cnonce: cnonce.iter().map(|b| format!("{:02x}", b)).collect(),
            state: State::Initial,
        }
    }

    #[cfg(test)]
    fn with_cnonce(mut self, cnonce: &str) -> DigestMd5 {
        self.cnonce = cnonce.to_owned();
        self
    }

    pub(crate) fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub(crate) fn set_password(&mut self, password: String) {
        self.password = Some(password);
    }

    /// Answer one server challenge.
    pub(crate) fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, String> {
        let challenge = std::str::from_utf8(challenge).map_err(|e| e.to_string())?;
        let directives = parse_directives(challenge)?;

        if let Some(rspauth) = first(&directives, "rspauth") {
            self.verify(rspauth)?;
            return Ok(Vec::new());
        }
        if !matches!(self.state, State::Initial) {
            return Err("unexpected second digest challenge".to_owned());
        }

        let qop_offered = directives
            .get("qop")
            .map(|values| {
                values
                    .iter()
                    .flat_map(|v| v.split(','))
                    .any(|q| q.trim() == "auth")
            })
            .unwrap_or(true);
        if !qop_offered {
            return Err("server does not offer qop=auth".to_owned());
        }
        let nonce = first(&directives, "nonce").ok_or("challenge without nonce")?;
        let realm = first(&directives, "realm")
            .unwrap_or(self.host.as_str())
            .to_owned();
        let password = self.password.as_deref().ok_or("no password set")?;
        let digest_uri = format!("{}/{}", self.service, self.host);
        let nc = "00000001";

        let mut a1 = Md5::digest(format!("{}:{}:{}", self.username, realm, password)).to_vec();
        a1.extend_from_slice(format!(":{}:{}", nonce, self.cnonce).as_bytes());
        let ha1 = md5_hex(&a1);
        let kd = |a2: &str| {
            md5_hex(
                format!(
                    "{}:{}:{}:{}:auth:{}",
                    ha1,
                    nonce,
                    nc,
                    self.cnonce,
                    md5_hex(a2.as_bytes())
                )
                .as_bytes(),
            )
        };
        let response = kd(&format!("AUTHENTICATE:{}", digest_uri));
        let rspauth = kd(&format!(":{}", digest_uri));

        let mut out = String::new();
        if first(&directives, "charset") == Some("utf-8") {
            out.push_str("charset=utf-8,");
        }
        out.push_str(&format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",nc={},cnonce=\"{}\",digest-uri=\"{}\",response={},qop=auth",
            quote(&self.username),
            quote(&realm),
            quote(nonce),
            nc,
            quote(&self.cnonce),
            quote(&digest_uri),
            response
        ));
        self.state = State::Responded { rspauth };
        Ok(out.into_bytes())
    }

    /// Check additional data carried by `<success/>`.
    pub(crate) fn success(&mut self, data: &[u8]) -> Result<(), String> {
        if data.is_empty() {
            return Ok(());
        }
        let data = std::str::from_utf8(data).map_err(|e| e.to_string())?;
        let directives = parse_directives(data)?;
        match first(&directives, "rspauth") {
            Some(rspauth) => self.verify(rspauth),
            None => Ok(()),
        }
    }

    fn verify(&mut self, rspauth: &str) -> Result<(), String> {
        match &self.state {
            State::Responded { rspauth: expected } if expected == rspauth => {
                self.state = State::Done;
                Ok(())
            }
            State::Done => Ok(()),
            State::Responded { .. } => Err("server sent a wrong rspauth".to_owned()),
            State::Initial => Err("rspauth before response".to_owned()),
        }
    }
}
