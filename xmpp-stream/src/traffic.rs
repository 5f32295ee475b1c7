// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Raw traffic observation, for debugging consoles and logs.

use core::fmt;

use chrono::{DateTime, Utc};

/// Which way data travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from the peer
    Inbound,
    /// Sent to the peer
    Outbound,
}

/// Receives a copy of every chunk of XML exchanged on a connection.
pub trait TrafficLog: Send {
    /// Called once per chunk, in the order chunks were read or written.
    fn record(&mut self, direction: Direction, at: DateTime<Utc>, data: &[u8]);
}

impl<F> TrafficLog for F
where
    F: FnMut(Direction, DateTime<Utc>, &[u8]) + Send,
{
    fn record(&mut self, direction: Direction, at: DateTime<Utc>, data: &[u8]) {
        self(direction, at, data)
    }
}

/// Lossy UTF-8 rendering of a byte buffer.
pub struct LogBuf<'a>(pub &'a [u8]);

impl fmt::Display for LogBuf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.0))
    }
}

/// The default sink: `trace!` through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTraffic;

impl TrafficLog for LogTraffic {
    fn record(&mut self, direction: Direction, at: DateTime<Utc>, data: &[u8]) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }
        let at = at.format("%H:%M:%S%.3f");
        match direction {
            Direction::Inbound => log::trace!("RECV[{}]: {}", at, LogBuf(data)),
            Direction::Outbound => log::trace!("SEND[{}]: {}", at, LogBuf(data)),
        }
    }
}
