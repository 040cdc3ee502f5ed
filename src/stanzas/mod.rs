// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

use std::fmt;

use crate::ns;

pub use self::iq::Iq;
pub use self::iq::IqType;
pub use self::message::Message;
pub use self::message::MessageType;
pub use self::presence::Presence;
pub use self::presence::PresenceType;

pub trait StanzaType {
    fn attr_string(&self) -> Option<&'static str>;
}

pub trait Stanza {
    type Ty: StanzaType;

    fn from_element(e: xml::Element) -> Result<Self, xml::Element>
    where
        Self: Sized;
    fn as_element(&self) -> &xml::Element;
    fn into_inner(self) -> xml::Element;

    fn to(&self) -> Option<&str>;
    fn from(&self) -> Option<&str>;
    fn id(&self) -> Option<&str>;
    fn stanza_type(&self) -> Option<<Self as Stanza>::Ty>;

    fn set_to(&mut self, to: Option<String>);
    fn set_from(&mut self, from: Option<String>);
    fn set_id(&mut self, id: Option<String>);
    fn set_stanza_type(&mut self, ty: <Self as Stanza>::Ty);
}

macro_rules! impl_Stanza(
    ($name: expr, $kind: ident, $ty: ty, $ty_some: expr, $ty_none: expr) => (
        impl $crate::stanzas::Stanza for $kind {
            type Ty = $ty;

            fn from_element(e: xml::Element) -> ::std::result::Result<$kind, xml::Element> {
                if !$crate::stanzas::is_content_ns(&e) || e.name != $name {
                    return Err(e);
                }
                Ok($kind { elem: e })
            }

            fn as_element(&self) -> &xml::Element {
                &self.elem
            }

            fn into_inner(self) -> xml::Element {
                self.elem
            }

            fn to(&self) -> Option<&str> {
                self.elem.get_attribute("to", None)
            }

            fn from(&self) -> Option<&str> {
                self.elem.get_attribute("from", None)
            }

            fn id(&self) -> Option<&str> {
                self.elem.get_attribute("id", None)
            }

            fn stanza_type(&self) -> Option<$ty> {
                match self.elem.get_attribute("type", None) {
                    Some(ty) => ($ty_some)(ty),
                    None => $ty_none
                }
            }

            fn set_to(&mut self, to: Option<String>) {
                self.set_or_remove("to", to);
            }

            fn set_from(&mut self, from: Option<String>) {
                self.set_or_remove("from", from);
            }

            fn set_id(&mut self, id: Option<String>) {
                self.set_or_remove("id", id);
            }

            fn set_stanza_type(&mut self, ty: $ty) {
                let ty = $crate::stanzas::StanzaType::attr_string(&ty).map(|t| t.to_string());
                self.set_or_remove("type", ty);
            }
        }

        impl $kind {
            fn set_or_remove(&mut self, attr: &str, value: Option<String>) {
                match value {
                    Some(value) => {
                        self.elem.set_attribute(attr.into(), None, value);
                    }
                    None => {
                        self.elem.remove_attribute(attr, None);
                    }
                }
            }
        }

        impl ::std::ops::Deref for $kind {
            type Target = xml::Element;
            fn deref(&self) -> &xml::Element {
                &self.elem
            }
        }

        impl ::std::ops::DerefMut for $kind {
            fn deref_mut(&mut self) -> &mut xml::Element {
                &mut self.elem
            }
        }

        impl ::std::fmt::Display for $kind {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                self.elem.fmt(f)
            }
        }
    );
);

// Has to be after impl_Stanza!
mod iq;
mod message;
mod presence;

pub(crate) fn is_content_ns(e: &xml::Element) -> bool {
    matches!(e.ns.as_deref(), Some(ns::JABBER_CLIENT) | Some(ns::JABBER_SERVER))
}

/// First child element living in namespace `ns`, whatever its name.
pub(crate) fn first_child_in<'a>(e: &'a xml::Element, ns: &str) -> Option<&'a xml::Element> {
    e.children
        .iter()
        .filter_map(|child| match *child {
            xml::Xml::ElementNode(ref el) => Some(el),
            _ => None,
        })
        .find(|el| el.ns.as_deref() == Some(ns))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Iq,
    Message,
    Presence,
}

impl fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            StanzaKind::Iq => "iq",
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
        })
    }
}

/// Any of the three top-level stanzas.
#[derive(Clone)]
pub enum AnyStanza {
    Iq(Iq),
    Message(Message),
    Presence(Presence),
}

impl AnyStanza {
    pub fn from_element(e: xml::Element) -> Result<AnyStanza, xml::Element> {
        if !is_content_ns(&e) {
            return Err(e);
        }

        match &e.name[..] {
            "iq" => Stanza::from_element(e).map(AnyStanza::Iq),
            "message" => Stanza::from_element(e).map(AnyStanza::Message),
            "presence" => Stanza::from_element(e).map(AnyStanza::Presence),
            _ => Err(e),
        }
    }

    pub fn kind(&self) -> StanzaKind {
        match *self {
            AnyStanza::Iq(_) => StanzaKind::Iq,
            AnyStanza::Message(_) => StanzaKind::Message,
            AnyStanza::Presence(_) => StanzaKind::Presence,
        }
    }

    pub fn element(&self) -> &xml::Element {
        match *self {
            AnyStanza::Iq(ref s) => s.as_element(),
            AnyStanza::Message(ref s) => s.as_element(),
            AnyStanza::Presence(ref s) => s.as_element(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.element().get_attribute("id", None)
    }

    pub fn from(&self) -> Option<&str> {
        self.element().get_attribute("from", None)
    }

    pub fn to(&self) -> Option<&str> {
        self.element().get_attribute("to", None)
    }

    /// The raw `type` attribute.
    pub fn type_attr(&self) -> Option<&str> {
        self.element().get_attribute("type", None)
    }

    pub fn is_error(&self) -> bool {
        self.type_attr() == Some("error")
    }

    pub fn body(&self) -> Option<String> {
        self.element()
            .children
            .iter()
            .find_map(|child| match *child {
                xml::Xml::ElementNode(ref el) if el.name == "body" && is_content_ns(el) => {
                    Some(el.content_str())
                }
                _ => None,
            })
    }

    /// Defined condition of an error reply, e.g. `not-authorized`.
    pub fn error_condition(&self) -> Option<&str> {
        if !self.is_error() {
            return None;
        }
        let error = self
            .element()
            .get_child("error", self.element().ns.as_deref())?;
        first_child_in(error, ns::STANZA_ERRORS).map(|cond| &cond.name[..])
    }

    pub(crate) fn set_id(&mut self, id: String) {
        match *self {
            AnyStanza::Iq(ref mut s) => s.set_id(Some(id)),
            AnyStanza::Message(ref mut s) => s.set_id(Some(id)),
            AnyStanza::Presence(ref mut s) => s.set_id(Some(id)),
        }
    }
}

impl From<Iq> for AnyStanza {
    fn from(iq: Iq) -> AnyStanza {
        AnyStanza::Iq(iq)
    }
}

impl From<Message> for AnyStanza {
    fn from(message: Message) -> AnyStanza {
        AnyStanza::Message(message)
    }
}

impl From<Presence> for AnyStanza {
    fn from(presence: Presence) -> AnyStanza {
        AnyStanza::Presence(presence)
    }
}

impl fmt::Display for AnyStanza {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.element().fmt(f)
    }
}

impl fmt::Debug for AnyStanza {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AnyStanza({})", self.element())
    }
}
