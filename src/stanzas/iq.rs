// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

use crate::ns;

use super::StanzaType;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IqType {
    Set,
    Get,
    Result,
    Error,
}

impl StanzaType for IqType {
    fn attr_string(&self) -> Option<&'static str> {
        Some(match *self {
            IqType::Set => "set",
            IqType::Get => "get",
            IqType::Result => "result",
            IqType::Error => "error",
        })
    }
}

#[derive(Clone)]
pub struct Iq {
    elem: xml::Element,
}

impl_Stanza!("iq", Iq, IqType,
    |ty: &str| {
        match ty {
            "get" => Some(IqType::Get),
            "set" => Some(IqType::Set),
            "result" => Some(IqType::Result),
            "error" => Some(IqType::Error),
            _ => None
        }
    }
, None);

impl Iq {
    /// An iq without an id; `Connection` assigns one when it is sent.
    pub fn new(ty: IqType) -> Iq {
        let ty = ty.attr_string().unwrap_or("get");
        Iq {
            elem: xml::Element::new(
                "iq".into(),
                Some(ns::JABBER_CLIENT.into()),
                vec![("type".into(), None, ty.into())],
            ),
        }
    }

    /// The single payload child, e.g. `<query/>` or `<bind/>`.
    pub fn payload(&self) -> Option<&xml::Element> {
        self.elem.children.iter().find_map(|child| match *child {
            xml::Xml::ElementNode(ref el) if el.name != "error" => Some(el),
            _ => None,
        })
    }
}
