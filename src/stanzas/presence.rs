// rust-xmpp
// Copyright (c) 2014 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

use std::fmt;

use crate::ns;

use super::{Stanza, StanzaType};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PresenceType {
    Error,
    Probe,
    Subscribe,
    Subscribed,
    Unavailable,
    Unsubscribe,
    Unsubscribed,
    Available,
}

impl StanzaType for PresenceType {
    fn attr_string(&self) -> Option<&'static str> {
        Some(match *self {
            PresenceType::Error => "error",
            PresenceType::Probe => "probe",
            PresenceType::Subscribe => "subscribe",
            PresenceType::Subscribed => "subscribed",
            PresenceType::Unavailable => "unavailable",
            PresenceType::Unsubscribe => "unsubscribe",
            PresenceType::Unsubscribed => "unsubscribed",
            // Available presence carries no type attribute.
            PresenceType::Available => return None,
        })
    }
}

impl fmt::Display for PresenceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.attr_string().unwrap_or("available"))
    }
}

#[derive(Clone)]
pub struct Presence {
    elem: xml::Element,
}

impl_Stanza!("presence", Presence, PresenceType,
    |ty: &str| {
        match ty {
            "error" => Some(PresenceType::Error),
            "probe" => Some(PresenceType::Probe),
            "subscribe" => Some(PresenceType::Subscribe),
            "subscribed" => Some(PresenceType::Subscribed),
            "unavailable" => Some(PresenceType::Unavailable),
            "unsubscribe" => Some(PresenceType::Unsubscribe),
            "unsubscribed" => Some(PresenceType::Unsubscribed),
            _ => None
        }
    }
, Some(PresenceType::Available));

impl Presence {
    pub fn new(ty: PresenceType) -> Presence {
        let mut presence = Presence {
            elem: xml::Element::new("presence".into(), Some(ns::JABBER_CLIENT.into()), vec![]),
        };
        presence.set_stanza_type(ty);
        presence
    }
}
