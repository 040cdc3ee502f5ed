// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

//! Non-SASL authentication, `jabber:iq:auth`.
//!
//! Two round trips: ask which fields the server wants for a username, then
//! send them. A digest is preferred over the plaintext password whenever the
//! server offers it and we know the stream id.

use openssl::sha::sha1;

use crate::ns;
use crate::stanzas::{AnyStanza, Iq, IqType};

use super::Credentials;

fn child(name: &str, text: &str) -> xml::Element {
    let mut elem = xml::Element::new(name.into(), Some(ns::IQ_AUTH.into()), vec![]);
    elem.text(text.into());
    elem
}

fn query() -> xml::Element {
    xml::Element::new("query".into(), Some(ns::IQ_AUTH.into()), vec![])
}

/// Fields the server accepts, from the reply to [`fields_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyFields {
    pub password: bool,
    pub digest: bool,
}

impl LegacyFields {
    pub fn from_reply(reply: &AnyStanza) -> LegacyFields {
        match reply.element().get_child("query", Some(ns::IQ_AUTH)) {
            Some(q) => LegacyFields {
                password: q.get_child("password", Some(ns::IQ_AUTH)).is_some(),
                digest: q.get_child("digest", Some(ns::IQ_AUTH)).is_some(),
            },
            // Servers that answer without a query get the plaintext password.
            None => LegacyFields {
                password: true,
                digest: false,
            },
        }
    }
}

pub fn fields_request(identity: &str) -> Iq {
    let mut iq = Iq::new(IqType::Get);
    iq.tag(query()).tag(child("username", identity));
    iq
}

/// The `set` carrying the credentials, in a field the server offered.
pub fn auth_request(creds: &Credentials, fields: LegacyFields, stream_id: Option<&str>) -> Result<Iq, &'static str> {
    let mut q = query();
    q.tag(child("username", &creds.identity));
    match stream_id {
        Some(id) if fields.digest => {
            q.tag(child("digest", &digest(id, &creds.secret)));
        }
        _ if fields.password => {
            q.tag(child("password", &creds.secret));
        }
        _ if fields.digest => return Err("server wants a digest but sent no stream id"),
        _ => return Err("server accepts neither password nor digest"),
    }
    q.tag(child("resource", &creds.resource));

    let mut iq = Iq::new(IqType::Set);
    iq.tag(q);
    Ok(iq)
}

/// Lowercase hex SHA-1 of stream id followed by the secret (XEP-0078).
pub fn digest(stream_id: &str, secret: &str) -> String {
    let mut input = String::with_capacity(stream_id.len() + secret.len());
    input.push_str(stream_id);
    input.push_str(secret);
    sha1(input.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
