// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

use crate::ns;

use super::{Stanza, StanzaType};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageType {
    Normal,
    Headline,
    Chat,
    Groupchat,
    Error,
}

impl StanzaType for MessageType {
    fn attr_string(&self) -> Option<&'static str> {
        Some(match *self {
            MessageType::Normal => "normal",
            MessageType::Headline => "headline",
            MessageType::Chat => "chat",
            MessageType::Groupchat => "groupchat",
            MessageType::Error => "error",
        })
    }
}

#[derive(Clone)]
pub struct Message {
    elem: xml::Element,
}

impl_Stanza!("message", Message, MessageType,
    |ty: &str| {
        match ty {
            "normal" => Some(MessageType::Normal),
            "headline" => Some(MessageType::Headline),
            "chat" => Some(MessageType::Chat),
            "groupchat" => Some(MessageType::Groupchat),
            "error" => Some(MessageType::Error),
            _ => None
        }
    }
, Some(MessageType::Normal));

impl Message {
    pub fn new(ty: MessageType, to: &str) -> Message {
        let mut message = Message {
            elem: xml::Element::new("message".into(), Some(ns::JABBER_CLIENT.into()), vec![]),
        };
        if ty != MessageType::Normal {
            message.set_stanza_type(ty);
        }
        message.set_to(Some(to.into()));
        message
    }

    /// A chat message carrying `body`.
    pub fn chat(to: &str, body: &str) -> Message {
        let mut message = Message::new(MessageType::Chat, to);
        message.set_body(body);
        message
    }

    pub fn body(&self) -> Option<String> {
        self.elem
            .get_child("body", Some(ns::JABBER_CLIENT))
            .map(|body| body.content_str())
    }

    pub fn set_body(&mut self, body: &str) {
        self.elem
            .children
            .retain(|child| !matches!(*child, xml::Xml::ElementNode(ref el) if el.name == "body"));
        self.elem
            .tag(xml::Element::new("body".into(), Some(ns::JABBER_CLIENT.into()), vec![]))
            .text(body.into());
    }
}
