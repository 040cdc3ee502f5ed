// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

use crate::ns;
use crate::stanzas::{AnyStanza, Iq, IqType};

pub fn bind_request(resource: &str) -> Iq {
    let mut bind = xml::Element::new("bind".into(), Some(ns::FEATURE_BIND.into()), vec![]);
    if !resource.is_empty() {
        bind.tag(xml::Element::new("resource".into(), Some(ns::FEATURE_BIND.into()), vec![]))
            .text(resource.into());
    }
    let mut iq = Iq::new(IqType::Set);
    iq.tag(bind);
    iq
}

/// The full JID the server assigned, from a bind result.
pub fn bound_jid(reply: &AnyStanza) -> Option<String> {
    reply
        .element()
        .get_child("bind", Some(ns::FEATURE_BIND))?
        .get_child("jid", Some(ns::FEATURE_BIND))
        .map(|jid| jid.content_str().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_bound_jid() {
        let reply: xml::Element = "<iq xmlns='jabber:client' type='result' id='b'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>u@example.com/r</jid></bind></iq>"
            .parse()
            .unwrap();
        let reply = AnyStanza::from_element(reply).unwrap();
        assert_eq!(bound_jid(&reply).as_deref(), Some("u@example.com/r"));
    }

    #[test]
    fn empty_resource_lets_the_server_choose() {
        let iq = bind_request("");
        let bind = iq.get_child("bind", Some(ns::FEATURE_BIND)).unwrap();
        assert!(bind.get_child("resource", Some(ns::FEATURE_BIND)).is_none());
    }
}
