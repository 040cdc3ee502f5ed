// rust-xmpp
// Copyright (c) 2014 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

pub const JABBER_CLIENT: &str = "jabber:client";
pub const JABBER_SERVER: &str = "jabber:server";
pub const STREAMS: &str = "http://etherx.jabber.org/streams";

pub const FEATURE_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const FEATURE_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const FEATURE_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const FEATURE_IQ_AUTH: &str = "http://jabber.org/features/iq-auth";

pub const IQ_AUTH: &str = "jabber:iq:auth";

pub const STANZA_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
