// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Namespace URIs used by the stream engine.

/// RFC 6120: client-to-server stanzas
pub const JABBER_CLIENT: &str = "jabber:client";

/// RFC 6120: server-to-server stanzas
pub const JABBER_SERVER: &str = "jabber:server";

/// RFC 6120: stream framing (`<stream:stream/>`, `<stream:features/>`, `<stream:error/>`)
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// RFC 6120: stream error conditions
pub const XMPP_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// RFC 6120: STARTTLS negotiation
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// RFC 6120: SASL negotiation
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// RFC 6120: resource binding
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// RFC 3921: legacy session establishment
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// RFC 6120: stanza error conditions
pub const XMPP_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// XEP-0124: BOSH `<body/>` wrapper
pub const HTTPBIND: &str = "http://jabber.org/protocol/httpbind";

/// XEP-0206: XMPP-specific BOSH attributes
pub const XBOSH: &str = "urn:xmpp:xbosh";

/// The namespace bound to the `xml` prefix.
pub const XML: &str = "http://www.w3.org/XML/1998/namespace";

/// The namespace reserved for namespace declarations.
pub const XMLNS: &str = "http://www.w3.org/2000/xmlns/";
