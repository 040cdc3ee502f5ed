// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

//! A scripted in-memory XMPP server behind the `Connector` seam.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use openssl::hash::{hash, MessageDigest};
use openssl::pkcs5::pbkdf2_hmac;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use xmpp::{AuthMethod, Connection, ConnectionConfig, Connector, Transport};

pub const DOMAIN: &str = "example.org";
pub const STREAM_ID: &str = "c2s-1";
pub const PASSWORD: &str = "secret";

const STREAM_HEADER: &str = "<?xml version='1.0'?>\
    <stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' \
    id='c2s-1' from='example.org' version='1.0'>";

const SCRAM_SALT: &[u8] = b"fake-server-salt";
const SCRAM_ITERATIONS: usize = 4096;
const SCRAM_SERVER_NONCE: &str = "3rfcNHYJY1ZVvWVs7j";

/// How the fake server behaves.
#[derive(Debug, Clone)]
pub struct Script {
    /// Refuse the TCP connection outright.
    pub refuse: bool,
    /// Accept, then reset the connection on the first read.
    pub reset: bool,
    /// Answer the stream header.
    pub greet: bool,
    /// Offer SASL and resource binding instead of jabber:iq:auth.
    pub sasl: bool,
    /// SASL mechanisms offered when `sasl` is set.
    pub mechanisms: Vec<&'static str>,
    /// Offer STARTTLS on an unencrypted stream.
    pub starttls: bool,
    /// Answer `<starttls/>` with a failure.
    pub refuse_starttls: bool,
    /// Never answer authentication requests.
    pub silent_auth: bool,
    /// Refuse resource binding.
    pub bind_error: bool,
    /// Answer iq get/set that aren't auth or bind with an empty result.
    pub answer_iqs: bool,
}

impl Default for Script {
    fn default() -> Script {
        Script {
            refuse: false,
            reset: false,
            greet: true,
            sasl: false,
            mechanisms: vec!["PLAIN"],
            starttls: false,
            refuse_starttls: false,
            silent_auth: false,
            bind_error: false,
            answer_iqs: true,
        }
    }
}

#[derive(Default)]
struct Wire {
    to_client: VecDeque<u8>,
    from_client: String,
    hung_up: bool,
    closed_by_client: bool,
    /// SASL succeeded and the client restarted the stream.
    restarted: bool,
    secured: bool,
    /// `client-first-message-bare,server-first-message` of a SCRAM exchange.
    scram: Option<String>,
}

struct Inner {
    script: Script,
    wire: Mutex<Wire>,
    readable: Condvar,
    connects: AtomicUsize,
}

#[derive(Clone)]
pub struct FakeServer {
    inner: Arc<Inner>,
}

/// Value of the first `name` attribute in `text`, in either quote style.
pub fn attr(text: &str, name: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let needle = format!(" {}={}", name, quote);
        if let Some(start) = text.find(&needle) {
            let rest = &text[start + needle.len()..];
            if let Some(end) = rest.find(quote) {
                return Some(rest[..end].to_string());
            }
        }
    }
    None
}

/// Text content of the outermost element in `text`, base64-decoded.
fn sasl_payload(text: &str) -> String {
    let encoded = text
        .split('>')
        .nth(1)
        .and_then(|rest| rest.split('<').next())
        .unwrap_or("");
    String::from_utf8(base64::decode(encoded).unwrap_or_default()).unwrap_or_default()
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let pkey = PKey::hmac(key).unwrap();
    let mut signer = Signer::new(MessageDigest::sha1(), &pkey).unwrap();
    signer.sign_oneshot_to_vec(data).unwrap()
}

fn sasl_failure() -> String {
    "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>".into()
}

/// Check a SCRAM-SHA-1 client-final-message; the server signature if it holds.
fn scram_verify(auth_prefix: &str, client_final: &str) -> Option<Vec<u8>> {
    let (without_proof, proof) = client_final.split_once(",p=")?;
    let proof = base64::decode(proof).ok()?;
    let auth_message = format!("{},{}", auth_prefix, without_proof);

    let mut salted = [0u8; 20];
    pbkdf2_hmac(PASSWORD.as_bytes(), SCRAM_SALT, SCRAM_ITERATIONS, MessageDigest::sha1(), &mut salted).unwrap();
    let client_key = hmac_sha1(&salted, b"Client Key");
    let stored_key = hash(MessageDigest::sha1(), &client_key).unwrap();
    let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes());
    let recovered: Vec<u8> = proof.iter().zip(client_signature.iter()).map(|(p, s)| p ^ s).collect();
    if hash(MessageDigest::sha1(), &recovered).unwrap()[..] != stored_key[..] {
        return None;
    }
    let server_key = hmac_sha1(&salted, b"Server Key");
    Some(hmac_sha1(&server_key, auth_message.as_bytes()))
}

impl FakeServer {
    pub fn new(script: Script) -> FakeServer {
        FakeServer {
            inner: Arc::new(Inner {
                script,
                wire: Mutex::new(Wire::default()),
                readable: Condvar::new(),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        Box::new(FakeConnector { server: self.clone() })
    }

    /// Queue raw bytes for the client.
    pub fn push(&self, text: &str) {
        let mut wire = self.inner.wire.lock().unwrap();
        wire.to_client.extend(text.as_bytes());
        self.inner.readable.notify_all();
    }

    pub fn hang_up(&self) {
        self.inner.wire.lock().unwrap().hung_up = true;
        self.inner.readable.notify_all();
    }

    /// Everything the client wrote so far.
    pub fn written(&self) -> String {
        self.inner.wire.lock().unwrap().from_client.clone()
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn closed_by_client(&self) -> bool {
        self.inner.wire.lock().unwrap().closed_by_client
    }

    /// Whether the client switched the stream to TLS.
    pub fn secured(&self) -> bool {
        self.inner.wire.lock().unwrap().secured
    }

    fn features(&self, wire: &Wire) -> String {
        let script = &self.inner.script;
        let mut features = String::from("<stream:features>");
        if script.starttls && !wire.secured {
            features.push_str("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        }
        if !script.sasl {
            features.push_str("<auth xmlns='http://jabber.org/features/iq-auth'/>");
        } else if wire.restarted {
            features.push_str("<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>");
        } else {
            features.push_str("<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>");
            for mech in &script.mechanisms {
                features.push_str(&format!("<mechanism>{}</mechanism>", mech));
            }
            features.push_str("</mechanisms>");
        }
        features + "</stream:features>"
    }

    fn sasl_start(&self, wire: &mut Wire, text: &str) -> Vec<String> {
        let payload = sasl_payload(text);
        match attr(text, "mechanism").as_deref() {
            Some("PLAIN") if payload == format!("\0alice\0{}", PASSWORD) => {
                wire.restarted = true;
                vec!["<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>".into()]
            }
            Some("SCRAM-SHA-1") => {
                let bare = payload.strip_prefix("n,,").unwrap_or("");
                let cnonce = bare.split(",r=").nth(1).unwrap_or("");
                let server_first = format!(
                    "r={}{},s={},i={}",
                    cnonce,
                    SCRAM_SERVER_NONCE,
                    base64::encode(SCRAM_SALT),
                    SCRAM_ITERATIONS
                );
                wire.scram = Some(format!("{},{}", bare, server_first));
                vec![format!(
                    "<challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>{}</challenge>",
                    base64::encode(server_first)
                )]
            }
            _ => vec![sasl_failure()],
        }
    }

    fn sasl_response(&self, wire: &mut Wire, text: &str) -> Vec<String> {
        let verified = wire
            .scram
            .take()
            .and_then(|prefix| scram_verify(&prefix, &sasl_payload(text)));
        match verified {
            Some(signature) => {
                wire.restarted = true;
                let server_final = format!("v={}", base64::encode(signature));
                vec![format!(
                    "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>{}</success>",
                    base64::encode(server_final)
                )]
            }
            None => vec![sasl_failure()],
        }
    }

    /// What the server says back to one write from the client.
    fn respond(&self, wire: &mut Wire, text: &str) -> Vec<String> {
        let script = &self.inner.script;
        if text.contains("<stream:stream") {
            if !script.greet {
                return vec![];
            }
            return vec![STREAM_HEADER.to_string() + &self.features(wire)];
        }

        if text.starts_with("<starttls") {
            return if script.refuse_starttls {
                vec!["<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>".into()]
            } else {
                vec!["<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>".into()]
            };
        }

        let is_auth = text.starts_with("<auth") || text.starts_with("<response") || text.contains("jabber:iq:auth");
        if script.silent_auth && is_auth {
            return vec![];
        }
        if text.starts_with("<auth") {
            return self.sasl_start(wire, text);
        }
        if text.starts_with("<response") {
            return self.sasl_response(wire, text);
        }

        if !text.starts_with("<iq") {
            return vec![];
        }
        let id = attr(text, "id").unwrap_or_default();
        let ty = attr(text, "type").unwrap_or_default();

        if text.contains("jabber:iq:auth") {
            if ty == "get" {
                return vec![format!(
                    "<iq type='result' id='{}'><query xmlns='jabber:iq:auth'>\
                     <username/><password/><digest/><resource/></query></iq>",
                    id
                )];
            }
            let digest = xmpp::auth::legacy::digest(STREAM_ID, PASSWORD);
            let accepted = text.contains(&format!(">{}</password>", PASSWORD))
                || text.contains(&format!(">{}</digest>", digest));
            return if accepted {
                vec![format!("<iq type='result' id='{}'/>", id)]
            } else {
                vec![format!(
                    "<iq type='error' id='{}'><error code='401' type='auth'>\
                     <not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
                    id
                )]
            };
        }

        if text.contains("urn:ietf:params:xml:ns:xmpp-bind") {
            if script.bind_error {
                return vec![format!(
                    "<iq type='error' id='{}'><error type='cancel'>\
                     <not-allowed xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
                    id
                )];
            }
            return vec![format!(
                "<iq type='result' id='{}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                 <jid>alice@example.org/bound</jid></bind></iq>",
                id
            )];
        }

        if script.answer_iqs && (ty == "get" || ty == "set") {
            return vec![format!("<iq type='result' id='{}' from='{}'/>", id, DOMAIN)];
        }
        vec![]
    }
}

struct FakeConnector {
    server: FakeServer,
}

impl Connector for FakeConnector {
    fn connect(&mut self, _host: &str, _port: u16) -> io::Result<Box<dyn Transport>> {
        if self.server.inner.script.refuse {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
        }
        self.server.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTransport {
            server: self.server.clone(),
        }))
    }
}

struct FakeTransport {
    server: FakeServer,
}

impl Transport for FakeTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let inner = &self.server.inner;
        if inner.script.reset {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"));
        }
        let until = Instant::now() + timeout;
        let mut wire = inner.wire.lock().unwrap();
        loop {
            if !wire.to_client.is_empty() {
                let n = buf.len().min(wire.to_client.len());
                for (slot, byte) in buf.iter_mut().zip(wire.to_client.drain(..n)) {
                    *slot = byte;
                }
                return Ok(Some(n));
            }
            if wire.hung_up {
                return Ok(Some(0));
            }
            let now = Instant::now();
            if now >= until {
                return Ok(None);
            }
            wire = inner.readable.wait_timeout(wire, until - now).unwrap().0;
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(data).into_owned();
        let mut wire = self.server.inner.wire.lock().unwrap();
        wire.from_client.push_str(&text);
        for reply in self.server.respond(&mut wire, &text) {
            wire.to_client.extend(reply.as_bytes());
        }
        self.server.inner.readable.notify_all();
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.server.inner.wire.lock().unwrap().closed_by_client = true;
        Ok(())
    }

    fn starttls(&mut self, _domain: &str) -> io::Result<()> {
        self.server.inner.wire.lock().unwrap().secured = true;
        Ok(())
    }

    fn is_secure(&self) -> bool {
        self.server.inner.wire.lock().unwrap().secured
    }
}

pub fn config() -> ConnectionConfig {
    ConnectionConfig::new(DOMAIN).with_request_timeout(Duration::from_secs(5))
}

pub fn connection(script: Script) -> (FakeServer, Connection) {
    connection_with(script, config())
}

pub fn connection_with(script: Script, config: ConnectionConfig) -> (FakeServer, Connection) {
    let config = if script.sasl && config.auth_method == AuthMethod::Legacy {
        config.with_auth_method(AuthMethod::SaslPlain)
    } else {
        config
    };
    let server = FakeServer::new(script);
    let conn = Connection::new(config, server.connector()).unwrap();
    (server, conn)
}

/// Open and authenticate as alice.
pub fn logged_in(script: Script) -> (FakeServer, Connection) {
    let (server, conn) = connection(script);
    conn.open_and_block().unwrap();
    conn.authenticate_and_block("alice", PASSWORD, "desk").unwrap();
    (server, conn)
}

/// Shared log for recording callback order.
pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Pump `conn` until `done` holds or a few seconds pass.
pub fn pump_until<F: Fn() -> bool>(conn: &Connection, done: F) {
    let until = Instant::now() + Duration::from_secs(5);
    while !done() && Instant::now() < until {
        conn.iterate(Duration::from_millis(20)).unwrap();
    }
}
