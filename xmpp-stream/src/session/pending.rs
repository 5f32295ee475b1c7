// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Correlation of outgoing stanzas with their replies.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::StanzaContext;
use crate::error::ResponseError;
use crate::node::{stanza, Node};

/// Result delivered to whoever waits for a reply.
pub type ResponseResult = Result<Node, ResponseError>;

/// Callback invoked with the reply, or with the reason none will come.
pub type ResponseCallback = Box<dyn FnOnce(&mut StanzaContext<'_>, ResponseResult) + Send>;

/// Where the resolution of a pending response goes.
pub enum ResponseSink {
    /// Call a function on the session's task.
    Callback(ResponseCallback),
    /// Complete a [`ResponseToken`].
    Channel(oneshot::Sender<ResponseResult>),
}

impl ResponseSink {
    /// Create a sink wrapping a callback.
    pub fn callback<F>(f: F) -> ResponseSink
    where
        F: FnOnce(&mut StanzaContext<'_>, ResponseResult) + Send + 'static,
    {
        ResponseSink::Callback(Box::new(f))
    }

    /// Create a sink completing the returned token.
    pub fn channel() -> (ResponseSink, ResponseToken) {
        let (tx, rx) = oneshot::channel();
        (ResponseSink::Channel(tx), ResponseToken { inner: rx })
    }

    pub(crate) fn complete(self, ctx: &mut StanzaContext<'_>, result: ResponseResult) {
        match self {
            ResponseSink::Callback(f) => f(ctx, result),
            ResponseSink::Channel(tx) => {
                // the receiver may have given up waiting
                let _: Result<_, _> = tx.send(result);
            }
        }
    }
}

/// Handle for awaiting a reply.
///
/// Resolves with the reply stanza, or with [`ResponseError::Timeout`] or
/// [`ResponseError::ConnectionLost`]. Dropping the token does not remove
/// the pending entry; it is cleaned up by its deadline or the disconnect.
pub struct ResponseToken {
    inner: oneshot::Receiver<ResponseResult>,
}

impl Future for ResponseToken {
    type Output = ResponseResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(v)) => Poll::Ready(v),
            Poll::Ready(Err(_)) => {
                log::debug!("Response sink dropped without a result");
                Poll::Ready(Err(ResponseError::ConnectionLost))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) struct PendingResponse {
    // replies to an iq must be iq result or error
    expects_iq_response: bool,
    deadline: Option<Instant>,
    pub(crate) sink: ResponseSink,
}

/// Table of pending responses, keyed by stanza id.
#[derive(Default)]
pub(crate) struct PendingResponses {
    entries: HashMap<String, PendingResponse>,
}

impl PendingResponses {
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Track a reply to `request`, which must carry `id`.
    pub(crate) fn insert(
        &mut self,
        id: String,
        request: &Node,
        deadline: Option<Instant>,
        sink: ResponseSink,
    ) {
        let entry = PendingResponse {
            expects_iq_response: request.name() == "iq",
            deadline,
            sink,
        };
        self.entries.insert(id, entry);
    }

    /// Remove and return the entry `node` is a reply to, if any.
    pub(crate) fn take_reply(&mut self, node: &Node) -> Option<PendingResponse> {
        let id = node.id()?;
        let entry = self.entries.get(id)?;
        if entry.expects_iq_response && !stanza::is_iq_response(node) {
            log::trace!(
                "not handling {} with id {:?} as response: not an iq result or error",
                node.name(),
                id
            );
            return None;
        }
        self.entries.remove(id)
    }

    /// Remove and return all entries whose deadline is not after `now`.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(String, PendingResponse)> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    /// Remove and return every entry.
    pub(crate) fn take_all(&mut self) -> Vec<(String, PendingResponse)> {
        self.entries.drain().collect()
    }

    /// The earliest deadline of any entry.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.deadline).min()
    }
}
