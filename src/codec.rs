// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

//! Turns the inbound byte stream into frames and outbound units into bytes.
//!
//! Reads may end anywhere, including inside a multi-byte UTF-8 sequence or in
//! the middle of a tag; both are buffered until the rest arrives.

use std::fmt;
use std::str;

use tracing::trace;

use crate::error::{Error, Result};
use crate::ns;
use crate::stanzas::{first_child_in, AnyStanza};

// https://tools.ietf.org/html/rfc3629
#[rustfmt::skip]
static UTF8_CHAR_WIDTH: [u8; 256] = [
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1, // 0x1F
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1, // 0x3F
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1, // 0x5F
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1, // 0x7F
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, // 0x9F
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, // 0xBF
    0,0,2,2,2,2,2,2,2,2,2,2,2,2,2,2,
    2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2, // 0xDF
    3,3,3,3,3,3,3,3,3,3,3,3,3,3,3,3, // 0xEF
    4,4,4,4,4,0,0,0,0,0,0,0,0,0,0,0, // 0xFF
];

/// Given a first byte, determine how many bytes are in this UTF-8 character
#[inline]
fn utf8_char_width(b: u8) -> usize {
    UTF8_CHAR_WIDTH[b as usize] as usize
}

/// Length of the longest prefix of `buf` that does not end inside a
/// multi-byte sequence.
fn complete_utf8_prefix(buf: &[u8]) -> usize {
    let len = buf.len();
    for i in (len.saturating_sub(3)..len).rev() {
        let width = utf8_char_width(buf[i]);
        if width == 0 {
            continue;
        }
        return if i + width > len { i } else { len };
    }
    len
}

/// What the server announced in `<stream:features/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    pub starttls: bool,
    pub mechanisms: Vec<String>,
    pub bind: bool,
}

impl Features {
    fn from_element(e: &xml::Element) -> Features {
        let mechanisms = e
            .get_child("mechanisms", Some(ns::FEATURE_SASL))
            .map(|mechs| {
                mechs
                    .get_children("mechanism", Some(ns::FEATURE_SASL))
                    .map(|m| m.content_str().trim().to_string())
                    .collect()
            })
            .unwrap_or_default();
        Features {
            starttls: e.get_child("starttls", Some(ns::FEATURE_TLS)).is_some(),
            mechanisms,
            bind: e.get_child("bind", Some(ns::FEATURE_BIND)).is_some(),
        }
    }
}

#[derive(Debug)]
pub enum Frame {
    StreamStart {
        id: Option<String>,
        from: Option<String>,
        /// Absent on pre-1.0 streams, which never send features.
        version: Option<String>,
    },
    StreamEnd,
    Features(Features),
    TlsProceed,
    TlsFailure,
    /// Base64 text, undecoded.
    SaslChallenge(String),
    /// Base64 text of the additional data, possibly empty.
    SaslSuccess(String),
    SaslFailure(String),
    StreamError {
        condition: String,
        text: Option<String>,
    },
    Stanza(AnyStanza),
}

pub struct StanzaCodec {
    parser: xml::Parser,
    builder: xml::ElementBuilder,
    partial: Vec<u8>,
}

impl Default for StanzaCodec {
    fn default() -> StanzaCodec {
        StanzaCodec::new()
    }
}

impl StanzaCodec {
    pub fn new() -> StanzaCodec {
        StanzaCodec {
            parser: xml::Parser::new(),
            builder: xml::ElementBuilder::new(),
            partial: Vec::new(),
        }
    }

    /// Forget everything buffered so far. Used when the stream restarts.
    pub fn reset(&mut self) {
        *self = StanzaCodec::new();
    }

    pub fn encode<T: fmt::Display + ?Sized>(item: &T) -> Vec<u8> {
        item.to_string().into_bytes()
    }

    /// Feed freshly read bytes and collect every frame they complete.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.partial.extend_from_slice(data);
        let complete = complete_utf8_prefix(&self.partial);
        let text = str::from_utf8(&self.partial[..complete])
            .map_err(|_| Error::Protocol("stream did not contain valid UTF-8".into()))?
            .to_string();
        self.partial.drain(..complete);

        let mut frames = Vec::new();
        if text.is_empty() {
            return Ok(frames);
        }

        self.parser.feed_str(&text);
        let builder = &mut self.builder;
        for event in &mut self.parser {
            match event {
                Ok(xml::Event::ElementStart(xml::StartTag {
                    ref name,
                    ns: Some(ref ns),
                    ref prefix,
                    ref attributes,
                    ..
                })) if *name == "stream" && *ns == ns::STREAMS => {
                    *builder = xml::ElementBuilder::new();
                    match *prefix {
                        Some(ref prefix) => {
                            builder.set_default_ns(ns::JABBER_CLIENT.to_string());
                            builder.define_prefix(prefix.clone(), ns::STREAMS.to_string());
                        }
                        None => builder.set_default_ns(ns::STREAMS.to_string()),
                    }
                    let attr = |key: &str| attributes.get(&(key.to_string(), None)).cloned();
                    frames.push(Frame::StreamStart {
                        id: attr("id"),
                        from: attr("from"),
                        version: attr("version"),
                    });
                }
                Ok(xml::Event::ElementEnd(xml::EndTag {
                    ref name,
                    ns: Some(ref ns),
                    ..
                })) if *name == "stream" && *ns == ns::STREAMS => {
                    frames.push(Frame::StreamEnd);
                }
                event => match builder.handle_event(event) {
                    Some(Ok(element)) => {
                        if let Some(frame) = classify(element) {
                            frames.push(frame);
                        }
                    }
                    Some(Err(e)) => return Err(Error::Protocol(e.to_string())),
                    None => (),
                },
            }
        }
        Ok(frames)
    }
}

fn classify(element: xml::Element) -> Option<Frame> {
    let frame = match (element.ns.as_deref(), &element.name[..]) {
        (Some(ns::STREAMS), "features") => Some(Frame::Features(Features::from_element(&element))),
        (Some(ns::STREAMS), "error") => {
            let condition = element
                .children
                .iter()
                .find_map(|child| match *child {
                    xml::Xml::ElementNode(ref el)
                        if el.ns.as_deref() == Some(ns::STREAM_ERRORS) && el.name != "text" =>
                    {
                        Some(el.name.clone())
                    }
                    _ => None,
                })
                .unwrap_or_else(|| "undefined-condition".to_string());
            let text = element
                .get_child("text", Some(ns::STREAM_ERRORS))
                .map(|t| t.content_str());
            Some(Frame::StreamError { condition, text })
        }
        (Some(ns::FEATURE_TLS), "proceed") => Some(Frame::TlsProceed),
        (Some(ns::FEATURE_TLS), "failure") => Some(Frame::TlsFailure),
        (Some(ns::FEATURE_SASL), "challenge") => Some(Frame::SaslChallenge(element.content_str())),
        (Some(ns::FEATURE_SASL), "success") => Some(Frame::SaslSuccess(element.content_str())),
        (Some(ns::FEATURE_SASL), "failure") => {
            let condition = first_child_in(&element, ns::FEATURE_SASL)
                .filter(|el| el.name != "text")
                .map(|el| el.name.clone())
                .unwrap_or_else(|| "not-authorized".to_string());
            Some(Frame::SaslFailure(condition))
        }
        _ => None,
    };
    if frame.is_some() {
        return frame;
    }

    match AnyStanza::from_element(element) {
        Ok(stanza) => Some(Frame::Stanza(stanza)),
        Err(other) => {
            trace!(name = %other.name, "ignoring unknown top-level element");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanzas::StanzaKind;

    const HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns:stream='http://etherx.jabber.org/streams' \
                          xmlns='jabber:client' id='s-42' from='example.com' version='1.0'>";

    fn decode_all(codec: &mut StanzaCodec, data: &[u8]) -> Vec<Frame> {
        codec.decode(data).expect("decode should succeed")
    }

    #[test]
    fn stream_start_carries_id() {
        let mut codec = StanzaCodec::new();
        let frames = decode_all(&mut codec, HEADER.as_bytes());
        assert_eq!(frames.len(), 1);
        match frames[0] {
            Frame::StreamStart {
                ref id,
                ref from,
                ref version,
            } => {
                assert_eq!(id.as_deref(), Some("s-42"));
                assert_eq!(from.as_deref(), Some("example.com"));
                assert_eq!(version.as_deref(), Some("1.0"));
            }
            ref other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn features_and_stanzas() {
        let mut codec = StanzaCodec::new();
        let input = format!(
            "{}<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism></mechanisms>\
             <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>\
             <message from='a@example.com' type='chat'><body>yo</body></message>",
            HEADER
        );
        let frames = decode_all(&mut codec, input.as_bytes());
        assert_eq!(frames.len(), 3);
        match frames[1] {
            Frame::Features(ref f) => {
                assert_eq!(f.mechanisms, ["SCRAM-SHA-1", "PLAIN"]);
                assert!(f.starttls);
                assert!(!f.bind);
            }
            ref other => panic!("unexpected frame {:?}", other),
        }
        match frames[2] {
            Frame::Stanza(ref s) => {
                assert_eq!(s.kind(), StanzaKind::Message);
                assert_eq!(s.body().as_deref(), Some("yo"));
            }
            ref other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn byte_at_a_time_matches_single_read() {
        let input = format!(
            "{}<message type='chat'><body>h\u{e9}llo \u{1f980}</body></message></stream:stream>",
            HEADER
        );

        let mut codec = StanzaCodec::new();
        let mut frames = Vec::new();
        for b in input.as_bytes() {
            frames.extend(decode_all(&mut codec, std::slice::from_ref(b)));
        }

        assert_eq!(frames.len(), 3);
        match frames[1] {
            Frame::Stanza(ref s) => assert_eq!(s.body().as_deref(), Some("h\u{e9}llo \u{1f980}")),
            ref other => panic!("unexpected frame {:?}", other),
        }
        assert!(matches!(frames[2], Frame::StreamEnd));
    }

    #[test]
    fn sasl_outcomes_and_stream_errors() {
        let mut codec = StanzaCodec::new();
        decode_all(&mut codec, HEADER.as_bytes());
        let frames = decode_all(
            &mut codec,
            b"<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>\
              <challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>cj1hYmM=</challenge>\
              <success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>\
              <stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
              <text xmlns='urn:ietf:params:xml:ns:xmpp-streams'>replaced</text></stream:error>",
        );
        assert_eq!(frames.len(), 4);
        assert!(matches!(frames[0], Frame::SaslFailure(ref c) if c == "not-authorized"));
        assert!(matches!(frames[1], Frame::SaslChallenge(ref c) if c == "cj1hYmM="));
        assert!(matches!(frames[2], Frame::SaslSuccess(ref data) if data.is_empty()));
        match frames[3] {
            Frame::StreamError { ref condition, ref text } => {
                assert_eq!(condition, "conflict");
                assert_eq!(text.as_deref(), Some("replaced"));
            }
            ref other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn tls_negotiation_frames() {
        let mut codec = StanzaCodec::new();
        decode_all(&mut codec, HEADER.as_bytes());
        let frames = decode_all(
            &mut codec,
            b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/><failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>",
        );
        assert!(matches!(frames[0], Frame::TlsProceed));
        assert!(matches!(frames[1], Frame::TlsFailure));
    }

    #[test]
    fn pre_1_0_stream_has_no_version() {
        let mut codec = StanzaCodec::new();
        let frames = decode_all(
            &mut codec,
            b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' xmlns='jabber:client' id='old'>",
        );
        assert!(matches!(frames[0], Frame::StreamStart { version: None, .. }));
    }

    #[test]
    fn malformed_xml_is_a_protocol_error() {
        let mut codec = StanzaCodec::new();
        decode_all(&mut codec, HEADER.as_bytes());
        let err = codec.decode(b"<message><body></message>").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn invalid_utf8_is_a_protocol_error() {
        let mut codec = StanzaCodec::new();
        let err = codec.decode(&[b'<', 0xFF, 0xFE, b'>']).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn incomplete_sequence_is_held_back() {
        assert_eq!(complete_utf8_prefix(b"abc"), 3);
        assert_eq!(complete_utf8_prefix(&[b'a', 0xE2, 0x82]), 1);
        assert_eq!(complete_utf8_prefix(&[b'a', 0xE2, 0x82, 0xAC]), 4);
        assert_eq!(complete_utf8_prefix(&[0xF0, 0x9F, 0xA6]), 0);
    }

    #[test]
    fn reset_accepts_a_new_stream() {
        let mut codec = StanzaCodec::new();
        decode_all(&mut codec, HEADER.as_bytes());
        codec.reset();
        let frames = decode_all(&mut codec, HEADER.as_bytes());
        assert!(matches!(frames[0], Frame::StreamStart { .. }));
    }
}
