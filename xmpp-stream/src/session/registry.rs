// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Typed handler registry.

use core::ops::ControlFlow;
use std::collections::{BTreeMap, HashMap};

use super::StanzaContext;
use crate::node::Node;

/// A stanza handler.
///
/// Returning [`ControlFlow::Break`] marks the stanza as handled: no further
/// handlers and no fallback run for it.
pub type Handler = Box<dyn FnMut(&mut StanzaContext<'_>, &Node) -> ControlFlow<()> + Send>;

/// Which stanzas with a given name and namespace a handler wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// All of them
    Any,
    /// Those with this `type` attribute
    ByType(String),
    /// Those carrying a child element in this namespace
    ByProperty(String),
}

/// Where a handler is placed within its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// After the handlers already registered
    #[default]
    Normal,
    /// Before the handlers already registered
    First,
}

/// Opaque token identifying a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Route {
    by_type: BTreeMap<String, Vec<HandlerId>>,
    by_property: BTreeMap<String, Vec<HandlerId>>,
    any: Vec<HandlerId>,
}

impl Route {
    fn bucket_mut(&mut self, matcher: &Matcher) -> &mut Vec<HandlerId> {
        match matcher {
            Matcher::Any => &mut self.any,
            Matcher::ByType(t) => self.by_type.entry(t.clone()).or_default(),
            Matcher::ByProperty(p) => self.by_property.entry(p.clone()).or_default(),
        }
    }

    fn remove(&mut self, id: HandlerId) {
        self.any.retain(|h| *h != id);
        for bucket in self.by_type.values_mut() {
            bucket.retain(|h| *h != id);
        }
        for bucket in self.by_property.values_mut() {
            bucket.retain(|h| *h != id);
        }
    }

    fn is_empty(&self) -> bool {
        self.any.is_empty()
            && self.by_type.values().all(Vec::is_empty)
            && self.by_property.values().all(Vec::is_empty)
    }

    /// Handlers matching `node`, in invocation order.
    fn matching(&self, node: &Node) -> Vec<HandlerId> {
        let mut result = Vec::new();
        if let Some(bucket) = node.stanza_type().and_then(|t| self.by_type.get(t)) {
            result.extend(bucket.iter().copied());
        }
        let mut seen: Vec<&str> = Vec::new();
        for child in node.children() {
            if seen.contains(&child.ns()) {
                continue;
            }
            seen.push(child.ns());
            if let Some(bucket) = self.by_property.get(child.ns()) {
                result.extend(bucket.iter().copied());
            }
        }
        result.extend(self.any.iter().copied());
        result
    }
}

/// Handler tables of one session.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    // keyed by (namespace, name)
    routes: BTreeMap<(String, String), Route>,
    handlers: HashMap<HandlerId, (String, String, Handler)>,
    next_id: u64,
}

impl HandlerRegistry {
    pub(crate) fn register(
        &mut self,
        namespace: String,
        name: String,
        matcher: Matcher,
        priority: Priority,
        handler: Handler,
    ) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        let bucket = self
            .routes
            .entry((namespace.clone(), name.clone()))
            .or_default()
            .bucket_mut(&matcher);
        match priority {
            Priority::Normal => bucket.push(id),
            Priority::First => bucket.insert(0, id),
        }
        log::debug!(
            "Registered handler {:?} for {{{}}}{} ({:?}, {:?})",
            id,
            namespace,
            name,
            matcher,
            priority
        );
        self.handlers.insert(id, (namespace, name, handler));
        id
    }

    pub(crate) fn unregister(&mut self, id: HandlerId) -> bool {
        let Some((namespace, name, _)) = self.handlers.remove(&id) else {
            return false;
        };
        let key = (namespace, name);
        if let Some(route) = self.routes.get_mut(&key) {
            route.remove(id);
            if route.is_empty() {
                self.routes.remove(&key);
            }
        }
        true
    }

    /// Whether any handler is registered in `namespace`.
    pub(crate) fn knows_namespace(&self, namespace: &str) -> bool {
        self.routes.keys().any(|(ns, _)| ns == namespace)
    }

    pub(crate) fn matching(&self, namespace: &str, node: &Node) -> Vec<HandlerId> {
        self.routes
            .get(&(namespace.to_owned(), node.name().to_owned()))
            .map(|route| route.matching(node))
            .unwrap_or_default()
    }

    /// Run one handler. Handlers removed in the meantime are skipped.
    pub(crate) fn invoke(
        &mut self,
        id: HandlerId,
        ctx: &mut StanzaContext<'_>,
        node: &Node,
    ) -> ControlFlow<()> {
        match self.handlers.get_mut(&id) {
            Some((_, _, handler)) => handler(ctx, node),
            None => ControlFlow::Continue(()),
        }
    }
}
