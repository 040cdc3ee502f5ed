// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

//! One client stream to one server, and everything waiting on it.
//!
//! A [`Connection`] is a handle: clones share the session, so one thread can
//! block in [`Connection::send_with_reply_and_block`] while another pumps
//! I/O through [`Connection::iterate`].
//!
//! Internally there are three locks, always taken in this order:
//!
//! * `pump`: held by whichever thread is currently reading,
//! * `link`: the transport and the incremental parser,
//! * `core`: state, pending requests, handlers.
//!
//! A fourth, `pumper`, only records which thread holds `pump`, so a
//! blocking call made from inside a callback pumps instead of waiting on
//! itself.
//!
//! Callbacks never run under `link` or `core`. They are queued on one
//! backlog while the locks are held and run, oldest first, once both are
//! released, so a callback may freely call back into the connection. One
//! thread at a time runs the backlog; a blocking call made from inside a
//! callback keeps working through it in order until its own answer is in.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::auth::legacy::{self, LegacyFields};
use crate::auth::{bind, select_mechanism, Credentials, Mechanism};
use crate::codec::{Features, Frame, StanzaCodec};
use crate::config::{AuthMethod, ConnectionConfig, StartTlsPolicy};
use crate::dispatch::{Control, EventSource};
use crate::error::{DisconnectReason, Error, Result};
use crate::handlers::{self, Handler, HandlerId, HandlerPriority, HandlerRegistry, HandlerResult};
use crate::non_stanzas::{AuthResponse, AuthStart, KeepAlive, StartTls, StreamEnd, StreamStart};
use crate::stanzas::{AnyStanza, Stanza, StanzaKind};
use crate::tracker::{AuthStep, Completion, OpenStep, PendingRequest, RequestKind, Tracker};
use crate::transport::{Connector, TcpConnector, Transport};

/// Longest a single read holds the link lock.
const POLL_SLICE: Duration = Duration::from_millis(50);
const READ_BUFFER: usize = 4096;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// The stream is up, nobody has authenticated on it.
    Connected,
    Authenticating,
    Authenticated,
    Closing,
    Closed,
}

impl ConnectionState {
    fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }

    fn is_established(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Authenticating | ConnectionState::Authenticated
        )
    }
}

impl Default for ConnectionState {
    fn default() -> ConnectionState {
        ConnectionState::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type DisconnectHandler = Arc<dyn Fn(&Connection, DisconnectReason) + Send + Sync>;

/// Something that ends the session, and how to report it.
struct Fatal {
    /// Handed to every request still pending.
    error: Error,
    reason: DisconnectReason,
}

impl Fatal {
    fn transport(e: io::Error) -> Fatal {
        Fatal {
            error: Error::Transport(e),
            reason: DisconnectReason::Error,
        }
    }

    fn internal(msg: &str) -> Fatal {
        Fatal {
            error: Error::Internal(msg.to_string()),
            reason: DisconnectReason::Error,
        }
    }
}

/// Work to do once the locks are released.
enum Deferred {
    Complete(Completion, Option<AnyStanza>),
    Fail(Completion, Error),
    Handlers(AnyStanza),
    Disconnect(DisconnectReason),
}

struct Link {
    transport: Box<dyn Transport>,
    codec: StanzaCodec,
    last_write: Instant,
}

impl Link {
    fn new(transport: Box<dyn Transport>) -> Link {
        Link {
            transport,
            codec: StanzaCodec::new(),
            last_write: Instant::now(),
        }
    }

    fn write<T: fmt::Display + ?Sized>(&mut self, item: &T) -> Result<(), Fatal> {
        debug!("out: {}", item);
        self.write_bytes(&StanzaCodec::encode(item))
    }

    /// Like `write`, but only `summary` reaches the log.
    fn write_redacted<T: fmt::Display + ?Sized>(&mut self, item: &T, summary: &str) -> Result<(), Fatal> {
        debug!("out: {}", summary);
        self.write_bytes(&StanzaCodec::encode(item))
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), Fatal> {
        self.transport.write_all(data).map_err(Fatal::transport)?;
        self.last_write = Instant::now();
        Ok(())
    }
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

fn auth_error(reply: &AnyStanza, fallback: &str) -> Error {
    Error::AuthFailure(reply.error_condition().unwrap_or(fallback).to_string())
}

/// SASL payloads are base64; `=` stands for an empty one.
fn decode_sasl(text: &str) -> Result<Vec<u8>, String> {
    match text.trim() {
        "" | "=" => Ok(Vec::new()),
        text => base64::decode(text).map_err(|_| "server sent invalid base64".to_string()),
    }
}

#[derive(Default)]
struct Core {
    state: ConnectionState,
    tracker: Tracker,
    handlers: HandlerRegistry,
    on_disconnect: Option<DisconnectHandler>,
    /// Only held while authenticating.
    credentials: Option<Credentials>,
    mechanism: Option<Mechanism>,
    features: Option<Features>,
    stream_id: Option<String>,
    identity: Option<String>,
}

impl Core {
    fn require(&self, allowed: &[ConnectionState], expected: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "state change");
            self.state = state;
        }
    }

    /// End the session: fail everything pending, drop the transport.
    fn teardown(&mut self, link: &mut Option<Link>, fatal: Fatal, out: &mut Vec<Deferred>) {
        let established = self.state.is_established();
        self.set_state(ConnectionState::Closing);

        if let Some(mut link) = link.take() {
            let stream_usable = !matches!(fatal.error, Error::Transport(_)) && fatal.reason != DisconnectReason::Hup;
            if stream_usable {
                let _ = link.write(&StreamEnd);
            }
            if let Err(e) = link.transport.close() {
                debug!(error = %e, "closing transport");
            }
        }

        for req in self.tracker.drain() {
            out.push(Deferred::Fail(req.completion, fatal.error.clone()));
        }
        self.credentials = None;
        self.mechanism = None;
        self.set_state(ConnectionState::Closed);

        if established {
            info!(reason = ?fatal.reason, "disconnected");
            out.push(Deferred::Disconnect(fatal.reason));
        }
    }

    /// Move an open or auth request on to its next step under a fresh id.
    fn advance(&mut self, req: PendingRequest, kind: RequestKind, out: &mut Vec<Deferred>) -> Result<String, Fatal> {
        let id = self.tracker.generate_id();
        match self.tracker.requeue(req, id.clone(), kind) {
            Ok(()) => Ok(id),
            Err(req) => {
                out.push(Deferred::Fail(
                    req.completion,
                    Error::Internal(format!("correlation id {} already pending", id)),
                ));
                Err(Fatal::internal("lost track of a request"))
            }
        }
    }

    fn stream_started(
        &mut self,
        config: &ConnectionConfig,
        link: &mut Link,
        version: Option<String>,
        out: &mut Vec<Deferred>,
    ) -> Result<(), Fatal> {
        let header = RequestKind::Open(OpenStep::Header);
        let req = match self.tracker.take_where(|k| *k == header) {
            Some(req) => req,
            None => return Ok(()),
        };
        if version.is_some() {
            // Features follow, and STARTTLS and SASL depend on them.
            self.advance(req, RequestKind::Open(OpenStep::Features), out)?;
            Ok(())
        } else {
            self.finish_open(config, link, req, out)
        }
    }

    fn open_features(
        &mut self,
        config: &ConnectionConfig,
        link: &mut Link,
        req: PendingRequest,
        out: &mut Vec<Deferred>,
    ) -> Result<(), Fatal> {
        let offered = self.features.as_ref().map_or(false, |f| f.starttls);
        let upgrade = offered && config.starttls != StartTlsPolicy::Never && !link.transport.is_secure();
        if !upgrade {
            return self.finish_open(config, link, req, out);
        }
        self.advance(req, RequestKind::Open(OpenStep::TlsProceed), out)?;
        link.write(&StartTls)
    }

    fn start_tls(
        &mut self,
        config: &ConnectionConfig,
        link: &mut Link,
        req: PendingRequest,
        out: &mut Vec<Deferred>,
    ) -> Result<(), Fatal> {
        // Back to waiting for a header; teardown fails it if TLS breaks.
        self.advance(req, RequestKind::Open(OpenStep::Header), out)?;
        if let Err(e) = link.transport.starttls(&config.server) {
            warn!(error = %e, "TLS negotiation failed");
            return Err(Fatal::transport(e));
        }
        info!(server = %config.server, "TLS established");
        self.features = None;
        link.codec.reset();
        link.write(&StreamStart { to: &config.server })
    }

    fn finish_open(
        &mut self,
        config: &ConnectionConfig,
        link: &mut Link,
        req: PendingRequest,
        out: &mut Vec<Deferred>,
    ) -> Result<(), Fatal> {
        if config.starttls == StartTlsPolicy::Required && !link.transport.is_secure() {
            warn!("server does not offer STARTTLS");
            out.push(Deferred::Fail(
                req.completion,
                Error::Protocol("server does not offer STARTTLS".into()),
            ));
            return Err(Fatal {
                error: Error::ConnectionClosed,
                reason: DisconnectReason::Error,
            });
        }
        self.set_state(ConnectionState::Connected);
        info!(server = %config.server, secure = link.transport.is_secure(), "connection open");
        out.push(Deferred::Complete(req.completion, None));
        Ok(())
    }

    fn session_jid(&self, config: &ConnectionConfig) -> String {
        match self.credentials {
            Some(ref creds) => {
                let bare = if creds.identity.contains('@') {
                    creds.identity.clone()
                } else {
                    format!("{}@{}", creds.identity, config.server)
                };
                if creds.resource.is_empty() {
                    bare
                } else {
                    format!("{}/{}", bare, creds.resource)
                }
            }
            None => config.server.clone(),
        }
    }

    fn auth_succeeded(&mut self, req: PendingRequest, identity: String, out: &mut Vec<Deferred>) {
        info!(jid = %identity, "authenticated");
        self.identity = Some(identity);
        self.credentials = None;
        self.set_state(ConnectionState::Authenticated);
        out.push(Deferred::Complete(req.completion, None));
    }

    /// Report a failed attempt. Unless `retry` holds, the server may consider
    /// us authenticated and the stream must go regardless of the config.
    fn auth_failed(
        &mut self,
        config: &ConnectionConfig,
        req: PendingRequest,
        error: Error,
        retry: bool,
        out: &mut Vec<Deferred>,
    ) -> Result<(), Fatal> {
        warn!(error = %error, "authentication failed");
        self.credentials = None;
        self.mechanism = None;
        out.push(Deferred::Fail(req.completion, error));
        if config.close_on_auth_failure || !retry {
            Err(Fatal {
                error: Error::ConnectionClosed,
                reason: DisconnectReason::AuthFailed,
            })
        } else {
            self.set_state(ConnectionState::Connected);
            Ok(())
        }
    }

    fn legacy_fields(
        &mut self,
        config: &ConnectionConfig,
        link: &mut Link,
        req: PendingRequest,
        reply: &AnyStanza,
        out: &mut Vec<Deferred>,
    ) -> Result<(), Fatal> {
        if reply.is_error() {
            let error = auth_error(reply, "authentication fields refused");
            return self.auth_failed(config, req, error, true, out);
        }
        let fields = LegacyFields::from_reply(reply);
        let request = match self.credentials {
            Some(ref creds) => legacy::auth_request(creds, fields, self.stream_id.as_deref()),
            None => return Err(Fatal::internal("credentials missing during authentication")),
        };
        let mut iq = match request {
            Ok(iq) => iq,
            Err(e) => return self.auth_failed(config, req, Error::AuthFailure(e.into()), true, out),
        };
        let id = self.advance(req, RequestKind::Auth(AuthStep::LegacyVerdict), out)?;
        iq.set_id(Some(id));
        link.write_redacted(&iq, "<iq type='set'> jabber:iq:auth (credentials elided)")
    }

    fn start_sasl(
        &mut self,
        config: &ConnectionConfig,
        link: &mut Link,
        req: PendingRequest,
        out: &mut Vec<Deferred>,
    ) -> Result<(), Fatal> {
        let offered: &[String] = self.features.as_ref().map_or(&[], |f| &f.mechanisms);
        let chosen = match self.credentials {
            Some(ref creds) => select_mechanism(config.auth_method, offered, creds),
            None => return Err(Fatal::internal("credentials missing during authentication")),
        };
        let mut mech = match chosen {
            Some(mech) => mech,
            None => {
                let error = Error::AuthFailure(format!(
                    "no usable SASL mechanism among [{}]",
                    offered.join(", ")
                ));
                return self.auth_failed(config, req, error, true, out);
            }
        };
        let data = match mech.initial() {
            Ok(data) => base64::encode(data),
            Err(e) => return self.auth_failed(config, req, Error::AuthFailure(e.into()), true, out),
        };
        self.advance(req, RequestKind::Auth(AuthStep::SaslVerdict), out)?;
        let name = mech.mechanism();
        self.mechanism = Some(mech);
        let auth = AuthStart { mech: name, data: &data };
        link.write_redacted(&auth, &format!("<auth mechanism='{}'/> (credentials elided)", name))
    }

    /// Feed server data to the running mechanism.
    fn sasl_step(&mut self, text: &str) -> Result<Vec<u8>, String> {
        let data = decode_sasl(text)?;
        match self.mechanism.as_mut() {
            Some(mech) => mech.continuation(&data).map_err(String::from),
            None => Err("no SASL exchange in progress".into()),
        }
    }

    fn sasl_challenge(
        &mut self,
        config: &ConnectionConfig,
        link: &mut Link,
        req: PendingRequest,
        text: &str,
        out: &mut Vec<Deferred>,
    ) -> Result<(), Fatal> {
        match self.sasl_step(text) {
            Ok(data) => {
                self.advance(req, RequestKind::Auth(AuthStep::SaslVerdict), out)?;
                let response = AuthResponse {
                    data: &base64::encode(data),
                };
                link.write_redacted(&response, "<response/> (credentials elided)")
            }
            Err(e) => self.auth_failed(config, req, Error::AuthFailure(e), false, out),
        }
    }

    fn sasl_success(
        &mut self,
        config: &ConnectionConfig,
        link: &mut Link,
        req: PendingRequest,
        text: &str,
        out: &mut Vec<Deferred>,
    ) -> Result<(), Fatal> {
        let checked = self.sasl_step(text).and_then(|_| match self.mechanism {
            Some(ref mech) if mech.verified() => Ok(()),
            _ => Err("server did not prove it knows the credentials".to_string()),
        });
        if let Err(e) = checked {
            return self.auth_failed(config, req, Error::AuthFailure(e), false, out);
        }
        self.mechanism = None;
        self.advance(req, RequestKind::Auth(AuthStep::SaslRestart), out)?;
        self.features = None;
        link.codec.reset();
        link.write(&StreamStart { to: &config.server })
    }

    fn bind(
        &mut self,
        config: &ConnectionConfig,
        link: &mut Link,
        req: PendingRequest,
        out: &mut Vec<Deferred>,
    ) -> Result<(), Fatal> {
        if !self.features.as_ref().map_or(false, |f| f.bind) {
            let jid = self.session_jid(config);
            self.auth_succeeded(req, jid, out);
            return Ok(());
        }
        let resource = self
            .credentials
            .as_ref()
            .map(|c| c.resource.clone())
            .unwrap_or_default();
        let mut iq = bind::bind_request(&resource);
        let id = self.advance(req, RequestKind::Auth(AuthStep::Bind), out)?;
        iq.set_id(Some(id));
        link.write(&iq)
    }

    fn handle_frame(
        &mut self,
        config: &ConnectionConfig,
        link: &mut Link,
        frame: Frame,
        out: &mut Vec<Deferred>,
    ) -> Result<(), Fatal> {
        match frame {
            Frame::StreamStart { id, from, version } => {
                debug!(id = ?id, from = ?from, version = ?version, "in: stream start");
                self.stream_id = id;
                self.stream_started(config, link, version, out)
            }
            Frame::StreamEnd => {
                debug!("in: stream end");
                Err(Fatal {
                    error: Error::ConnectionClosed,
                    reason: DisconnectReason::Hup,
                })
            }
            Frame::StreamError { condition, text } => {
                warn!(%condition, text = ?text, "stream error");
                let reason = if condition == "conflict" {
                    DisconnectReason::ResourceConflict
                } else {
                    DisconnectReason::Error
                };
                Err(Fatal {
                    error: Error::Protocol(format!("stream error: {}", condition)),
                    reason,
                })
            }
            Frame::Features(features) => {
                debug!(?features, "in: stream features");
                self.features = Some(features);
                let opening = RequestKind::Open(OpenStep::Features);
                if let Some(req) = self.tracker.take_where(|k| *k == opening) {
                    return self.open_features(config, link, req, out);
                }
                let restart = RequestKind::Auth(AuthStep::SaslRestart);
                if let Some(req) = self.tracker.take_where(|k| *k == restart) {
                    return self.bind(config, link, req, out);
                }
                Ok(())
            }
            Frame::TlsProceed => {
                debug!("in: STARTTLS proceed");
                let waiting = RequestKind::Open(OpenStep::TlsProceed);
                match self.tracker.take_where(|k| *k == waiting) {
                    Some(req) => self.start_tls(config, link, req, out),
                    None => {
                        warn!("STARTTLS proceed without a pending request");
                        Ok(())
                    }
                }
            }
            Frame::TlsFailure => {
                debug!("in: STARTTLS failure");
                let waiting = RequestKind::Open(OpenStep::TlsProceed);
                if let Some(req) = self.tracker.take_where(|k| *k == waiting) {
                    out.push(Deferred::Fail(
                        req.completion,
                        Error::Protocol("server refused STARTTLS".into()),
                    ));
                }
                // The server closes the stream after a TLS failure.
                Err(Fatal {
                    error: Error::ConnectionClosed,
                    reason: DisconnectReason::Error,
                })
            }
            Frame::SaslChallenge(text) => {
                debug!("in: SASL challenge");
                let verdict = RequestKind::Auth(AuthStep::SaslVerdict);
                match self.tracker.take_where(|k| *k == verdict) {
                    Some(req) => self.sasl_challenge(config, link, req, &text, out),
                    None => {
                        warn!("SASL challenge without a pending authentication");
                        Ok(())
                    }
                }
            }
            Frame::SaslSuccess(text) => {
                debug!("in: SASL success");
                let verdict = RequestKind::Auth(AuthStep::SaslVerdict);
                match self.tracker.take_where(|k| *k == verdict) {
                    Some(req) => self.sasl_success(config, link, req, &text, out),
                    None => {
                        warn!("SASL success without a pending authentication");
                        Ok(())
                    }
                }
            }
            Frame::SaslFailure(condition) => {
                debug!(%condition, "in: SASL failure");
                let verdict = RequestKind::Auth(AuthStep::SaslVerdict);
                match self.tracker.take_where(|k| *k == verdict) {
                    Some(req) => self.auth_failed(config, req, Error::AuthFailure(condition), true, out),
                    None => {
                        warn!("SASL failure without a pending authentication");
                        Ok(())
                    }
                }
            }
            Frame::Stanza(stanza) => self.handle_stanza(config, link, stanza, out),
        }
    }

    fn handle_stanza(
        &mut self,
        config: &ConnectionConfig,
        link: &mut Link,
        stanza: AnyStanza,
        out: &mut Vec<Deferred>,
    ) -> Result<(), Fatal> {
        debug!("in: {}", stanza);

        // Only these kinds are answered by a stanza with their id.
        let claimed = stanza.id().map_or(false, |id| {
            matches!(
                self.tracker.kind_of(id),
                Some(RequestKind::Reply)
                    | Some(RequestKind::Auth(AuthStep::LegacyFields))
                    | Some(RequestKind::Auth(AuthStep::LegacyVerdict))
                    | Some(RequestKind::Auth(AuthStep::Bind))
            )
        });
        let req = if claimed {
            stanza.id().and_then(|id| self.tracker.take(id))
        } else {
            None
        };
        let req = match req {
            Some(req) => req,
            None => {
                out.push(Deferred::Handlers(stanza));
                return Ok(());
            }
        };

        match req.kind {
            RequestKind::Reply => {
                out.push(Deferred::Complete(req.completion, Some(stanza)));
                Ok(())
            }
            RequestKind::Auth(AuthStep::LegacyFields) => self.legacy_fields(config, link, req, &stanza, out),
            RequestKind::Auth(AuthStep::LegacyVerdict) => {
                if stanza.is_error() {
                    self.auth_failed(config, req, auth_error(&stanza, "not-authorized"), true, out)
                } else {
                    let jid = self.session_jid(config);
                    self.auth_succeeded(req, jid, out);
                    Ok(())
                }
            }
            RequestKind::Auth(AuthStep::Bind) => {
                if stanza.is_error() {
                    // SASL already succeeded; there is nothing to retry on this stream.
                    self.auth_failed(config, req, auth_error(&stanza, "bind refused"), false, out)
                } else {
                    let jid = bind::bound_jid(&stanza).unwrap_or_else(|| self.session_jid(config));
                    self.auth_succeeded(req, jid, out);
                    Ok(())
                }
            }
            _ => {
                out.push(Deferred::Fail(
                    req.completion,
                    Error::Internal(format!("stanza {} answered a request that expects none", req.id)),
                ));
                Ok(())
            }
        }
    }

    /// Expire overdue requests and keep an idle stream alive.
    fn check_timers(&mut self, config: &ConnectionConfig, link: &mut Option<Link>, out: &mut Vec<Deferred>) {
        let mut fatal = None;
        for req in self.tracker.take_expired(Instant::now()) {
            match req.kind {
                RequestKind::Reply => {
                    debug!(id = %req.id, "request timed out");
                    out.push(Deferred::Fail(req.completion, Error::Timeout));
                }
                RequestKind::Open(step) => {
                    warn!(?step, "stream negotiation timed out");
                    out.push(Deferred::Fail(req.completion, Error::Timeout));
                    fatal = Some(Fatal {
                        error: Error::ConnectionClosed,
                        reason: DisconnectReason::PingTimeout,
                    });
                }
                RequestKind::Auth(step) => {
                    warn!(?step, "authentication timed out");
                    out.push(Deferred::Fail(req.completion, Error::Timeout));
                    self.credentials = None;
                    self.mechanism = None;
                    if config.close_on_auth_failure || step.committed() {
                        fatal = Some(Fatal {
                            error: Error::ConnectionClosed,
                            reason: DisconnectReason::PingTimeout,
                        });
                    } else {
                        self.set_state(ConnectionState::Connected);
                    }
                }
            }
        }
        if let Some(fatal) = fatal {
            self.teardown(link, fatal, out);
            return;
        }

        let rate = match config.keep_alive() {
            Some(rate) if self.state.is_established() => rate,
            _ => return,
        };
        let result = match link.as_mut() {
            Some(l) if l.last_write.elapsed() >= rate => {
                debug!("out: keep-alive");
                l.write_bytes(&StanzaCodec::encode(&KeepAlive))
            }
            _ => Ok(()),
        };
        if let Err(fatal) = result {
            self.teardown(link, fatal, out);
        }
    }
}

/// Callbacks waiting to run, and the thread running them.
#[derive(Default)]
struct Backlog {
    items: VecDeque<Deferred>,
    runner: Option<thread::ThreadId>,
}

/// Gives up the backlog if a callback panics.
struct RunnerGuard<'a> {
    backlog: &'a Mutex<Backlog>,
    outermost: bool,
}

impl Drop for RunnerGuard<'_> {
    fn drop(&mut self) {
        if self.outermost {
            lock(self.backlog).runner = None;
        }
    }
}

struct Shared {
    config: ConnectionConfig,
    connector: Mutex<Box<dyn Connector>>,
    pump: Mutex<()>,
    pumper: Mutex<Option<thread::ThreadId>>,
    backlog: Mutex<Backlog>,
    link: Mutex<Option<Link>>,
    core: Mutex<Core>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut link) = link.take() {
            let _ = link.write(&StreamEnd);
            let _ = link.transport.close();
        }
        let backlog = self.backlog.get_mut().unwrap_or_else(PoisonError::into_inner);
        for item in backlog.items.drain(..) {
            match item {
                Deferred::Complete(completion, reply) => completion.complete(reply),
                Deferred::Fail(completion, error) => completion.fail(error),
                Deferred::Handlers(_) | Deferred::Disconnect(_) => {}
            }
        }
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        for req in core.tracker.drain() {
            req.fail(Error::ConnectionClosed);
        }
    }
}

/// Where a blocking call waits for its callback.
struct Slot<T> {
    value: Mutex<Option<Result<T>>>,
    filled: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Arc<Slot<T>> {
        Arc::new(Slot {
            value: Mutex::new(None),
            filled: Condvar::new(),
        })
    }

    fn fill(&self, value: Result<T>) {
        *lock(&self.value) = Some(value);
        self.filled.notify_all();
    }

    fn take(&self) -> Option<Result<T>> {
        lock(&self.value).take()
    }

    fn is_filled(&self) -> bool {
        lock(&self.value).is_some()
    }

    fn wait(&self, timeout: Duration) {
        let guard = lock(&self.value);
        if guard.is_none() {
            let _ = self.filled.wait_timeout(guard, timeout);
        }
    }
}

/// A client stream to one server. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server())
            .field("port", &self.port())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(config: ConnectionConfig, connector: Box<dyn Connector>) -> Result<Connection> {
        config.validate()?;
        Ok(Connection {
            shared: Arc::new(Shared {
                config,
                connector: Mutex::new(connector),
                pump: Mutex::new(()),
                pumper: Mutex::new(None),
                backlog: Mutex::new(Backlog::default()),
                link: Mutex::new(None),
                core: Mutex::new(Core::default()),
            }),
        })
    }

    /// A connection over plain TCP, or TLS when the config asks for it.
    pub fn with_tcp(config: ConnectionConfig) -> Result<Connection> {
        let connector = TcpConnector::new(config.use_tls);
        Connection::new(config, Box::new(connector))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn server(&self) -> &str {
        &self.shared.config.server
    }

    pub fn port(&self) -> u16 {
        self.shared.config.effective_port()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.core).state
    }

    pub fn is_open(&self) -> bool {
        self.state().is_established()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    /// The JID we authenticated as.
    pub fn identity(&self) -> Option<String> {
        lock(&self.shared.core).identity.clone()
    }

    pub fn stream_id(&self) -> Option<String> {
        lock(&self.shared.core).stream_id.clone()
    }

    /// Connect and start the stream.
    ///
    /// Returns an error only when the connection is not `Disconnected`. Every
    /// other outcome, including a refused connection, reaches `on_result`.
    pub fn open<F>(&self, on_result: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let config = &self.shared.config;
        let mut out = Vec::new();
        {
            let mut link = lock(&self.shared.link);
            {
                let mut core = lock(&self.shared.core);
                core.require(&[ConnectionState::Disconnected], "disconnected")?;
                let id = core.tracker.generate_id();
                let completion = Completion::Result(Box::new(on_result));
                core.tracker.insert(
                    id,
                    RequestKind::Open(OpenStep::Header),
                    completion,
                    deadline(config.request_timeout()),
                )?;
                core.set_state(ConnectionState::Connecting);
            }

            let (host, port) = (config.server.as_str(), config.effective_port());
            info!(host, port, "opening connection");
            let connected = lock(&self.shared.connector).connect(host, port);

            let mut core = lock(&self.shared.core);
            match connected {
                Ok(transport) => {
                    let mut fresh = Link::new(transport);
                    let header = fresh.write(&StreamStart { to: host });
                    *link = Some(fresh);
                    if let Err(fatal) = header {
                        core.teardown(&mut link, fatal, &mut out);
                    }
                }
                Err(e) => {
                    warn!(error = %e, host, port, "connect failed");
                    core.teardown(&mut link, Fatal::transport(e), &mut out);
                }
            }
        }
        self.dispatch(out);
        Ok(())
    }

    pub fn open_and_block(&self) -> Result<()> {
        let slot = Slot::new();
        let filler = slot.clone();
        self.open(move |res| filler.fill(res))?;
        self.block_on(&slot)
    }

    /// Authenticate with the mechanism the config names.
    ///
    /// `identity` is the username (legacy) or authentication id (SASL).
    pub fn authenticate<F>(&self, identity: &str, secret: &str, resource: &str, on_result: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let config = &self.shared.config;
        let mut out = Vec::new();
        {
            let mut link_guard = lock(&self.shared.link);
            let mut core = lock(&self.shared.core);
            core.require(&[ConnectionState::Connected], "connected")?;
            let link = match link_guard.as_mut() {
                Some(link) => link,
                None => return Err(Error::Internal("connected without a transport".into())),
            };

            let step = match config.auth_method {
                AuthMethod::Legacy => AuthStep::LegacyFields,
                _ => AuthStep::SaslVerdict,
            };
            let id = core.tracker.generate_id();
            let completion = Completion::Result(Box::new(on_result));
            core.tracker.insert(
                id.clone(),
                RequestKind::Auth(step),
                completion,
                deadline(config.request_timeout()),
            )?;
            core.credentials = Some(Credentials::new(identity, secret, resource));
            core.set_state(ConnectionState::Authenticating);

            let started = match config.auth_method {
                AuthMethod::Legacy => {
                    let mut iq = legacy::fields_request(identity);
                    iq.set_id(Some(id));
                    link.write(&iq)
                }
                _ => match core.tracker.take(&id) {
                    Some(req) => core.start_sasl(config, link, req, &mut out),
                    None => Err(Fatal::internal("lost track of authentication")),
                },
            };
            if let Err(fatal) = started {
                core.teardown(&mut link_guard, fatal, &mut out);
            }
        }
        self.dispatch(out);
        Ok(())
    }

    pub fn authenticate_and_block(&self, identity: &str, secret: &str, resource: &str) -> Result<()> {
        let slot = Slot::new();
        let filler = slot.clone();
        self.authenticate(identity, secret, resource, move |res| filler.fill(res))?;
        self.block_on(&slot)
    }

    /// End the session. Safe to call any number of times.
    pub fn close(&self) {
        let mut out = Vec::new();
        {
            let mut link = lock(&self.shared.link);
            let mut core = lock(&self.shared.core);
            if core.state == ConnectionState::Closed {
                return;
            }
            debug!("closing connection");
            let fatal = Fatal {
                error: Error::ConnectionClosed,
                reason: DisconnectReason::Ok,
            };
            core.teardown(&mut link, fatal, &mut out);
        }
        self.dispatch(out);
    }

    /// Fire and forget.
    pub fn send<S: Into<AnyStanza>>(&self, stanza: S) -> Result<()> {
        let stanza = stanza.into();
        self.write_out(|link| link.write(&stanza))
    }

    /// Write `text` to the stream as is.
    pub fn send_raw(&self, text: &str) -> Result<()> {
        self.write_out(|link| link.write(text))
    }

    /// Send and have `on_reply` called with the stanza that answers it.
    ///
    /// The stanza's own id is used when it has one. Once this returns `Ok`,
    /// every outcome (reply, timeout, a broken stream) goes to `on_reply`.
    pub fn send_with_reply<S, F>(&self, stanza: S, on_reply: F) -> Result<()>
    where
        S: Into<AnyStanza>,
        F: FnOnce(Result<AnyStanza>) + Send + 'static,
    {
        let timeout = self.shared.config.request_timeout();
        self.send_with_reply_timeout(stanza, timeout, on_reply)
    }

    /// `send_with_reply` with an explicit deadline; `None` waits forever.
    pub fn send_with_reply_timeout<S, F>(&self, stanza: S, timeout: Option<Duration>, on_reply: F) -> Result<()>
    where
        S: Into<AnyStanza>,
        F: FnOnce(Result<AnyStanza>) + Send + 'static,
    {
        let mut stanza = stanza.into();
        let mut out = Vec::new();
        {
            let mut link_guard = lock(&self.shared.link);
            let mut core = lock(&self.shared.core);
            core.require(
                &[ConnectionState::Connected, ConnectionState::Authenticated],
                "connected or authenticated",
            )?;
            let id = match stanza.id() {
                Some(id) => id.to_string(),
                None => {
                    let id = core.tracker.generate_id();
                    stanza.set_id(id.clone());
                    id
                }
            };
            let completion = Completion::Reply(Box::new(on_reply));
            core.tracker
                .insert(id, RequestKind::Reply, completion, deadline(timeout))?;

            let written = match link_guard.as_mut() {
                Some(link) => link.write(&stanza),
                None => Err(Fatal::internal("connected without a transport")),
            };
            if let Err(fatal) = written {
                core.teardown(&mut link_guard, fatal, &mut out);
            }
        }
        self.dispatch(out);
        Ok(())
    }

    /// Send and wait for the answer.
    ///
    /// If no other thread is pumping I/O, this one does; otherwise it waits
    /// for the pumping thread to deliver the reply.
    pub fn send_with_reply_and_block<S: Into<AnyStanza>>(&self, stanza: S) -> Result<AnyStanza> {
        let slot = Slot::new();
        let filler = slot.clone();
        self.send_with_reply(stanza, move |res| filler.fill(res))?;
        self.block_on(&slot)
    }

    pub fn register_handler<F>(&self, kind: StanzaKind, priority: HandlerPriority, handler: F) -> HandlerId
    where
        F: Fn(&Connection, &AnyStanza) -> HandlerResult + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        lock(&self.shared.core).handlers.register(kind, priority, handler)
    }

    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        lock(&self.shared.core).handlers.unregister(id)
    }

    /// Called once each time an opened session ends.
    pub fn set_disconnect_handler<F>(&self, handler: F)
    where
        F: Fn(&Connection, DisconnectReason) + Send + Sync + 'static,
    {
        lock(&self.shared.core).on_disconnect = Some(Arc::new(handler));
    }

    /// Wait at most `max_wait` for data, then dispatch it.
    ///
    /// Returns [`Control::Remove`] once the connection is closed.
    pub fn iterate(&self, max_wait: Duration) -> Result<Control> {
        let _pump = lock(&self.shared.pump);
        self.pump_holding(max_wait, &|| false)
    }

    /// Iterate until the session ends.
    pub fn run_until_closed(&self) -> Result<()> {
        while self.iterate(POLL_SLICE)? == Control::Continue {}
        Ok(())
    }

    fn write_out<F>(&self, write: F) -> Result<()>
    where
        F: FnOnce(&mut Link) -> Result<(), Fatal>,
    {
        let mut out = Vec::new();
        let result = {
            let mut link_guard = lock(&self.shared.link);
            let mut core = lock(&self.shared.core);
            core.require(
                &[ConnectionState::Connected, ConnectionState::Authenticated],
                "connected or authenticated",
            )?;
            let written = match link_guard.as_mut() {
                Some(link) => write(link),
                None => Err(Fatal::internal("connected without a transport")),
            };
            match written {
                Ok(()) => Ok(()),
                Err(fatal) => {
                    let error = fatal.error.clone();
                    core.teardown(&mut link_guard, fatal, &mut out);
                    Err(error)
                }
            }
        };
        self.dispatch(out);
        result
    }

    /// Pump, then run what came in. The caller holds `pump`.
    fn pump_holding(&self, max_wait: Duration, done: &dyn Fn() -> bool) -> Result<Control> {
        *lock(&self.shared.pumper) = Some(thread::current().id());
        let result = self.pump(max_wait);
        self.run_backlog(done);
        *lock(&self.shared.pumper) = None;
        result
    }

    /// One round of reading. The caller holds `pump`; callbacks are queued,
    /// not run.
    fn pump(&self, max_wait: Duration) -> Result<Control> {
        let config = &self.shared.config;
        let until = Instant::now() + max_wait;
        let mut buf = [0u8; READ_BUFFER];

        loop {
            let mut out = Vec::new();
            let mut got_data = false;
            let control = {
                let mut link_guard = lock(&self.shared.link);
                let mut core = lock(&self.shared.core);
                core.check_timers(config, &mut link_guard, &mut out);

                if core.state == ConnectionState::Closed {
                    Control::Remove
                } else if link_guard.is_none() {
                    Control::Continue
                } else {
                    drop(core);
                    let slice = until.saturating_duration_since(Instant::now()).min(POLL_SLICE);
                    let read = match link_guard.as_mut() {
                        Some(link) => link.transport.read(&mut buf, slice),
                        None => Ok(None),
                    };
                    let mut core = lock(&self.shared.core);
                    match read {
                        Ok(None) => {}
                        Ok(Some(0)) => {
                            debug!("in: end of file");
                            let fatal = Fatal {
                                error: Error::ConnectionClosed,
                                reason: DisconnectReason::Hup,
                            };
                            core.teardown(&mut link_guard, fatal, &mut out);
                        }
                        Ok(Some(n)) => {
                            got_data = true;
                            self.feed(&mut core, &mut link_guard, &buf[..n], &mut out);
                        }
                        Err(e) => {
                            warn!(error = %e, "read failed");
                            core.teardown(&mut link_guard, Fatal::transport(e), &mut out);
                        }
                    }
                    if core.state == ConnectionState::Closed {
                        Control::Remove
                    } else {
                        Control::Continue
                    }
                }
            };
            let idle = control == Control::Continue && !got_data && out.is_empty();
            let no_link = lock(&self.shared.link).is_none();
            self.enqueue(out);

            if !idle || Instant::now() >= until {
                return Ok(control);
            }
            if no_link {
                // Nothing to read from yet; don't spin.
                thread::sleep(until.saturating_duration_since(Instant::now()).min(POLL_SLICE));
            }
        }
    }

    fn feed(&self, core: &mut Core, link_guard: &mut Option<Link>, data: &[u8], out: &mut Vec<Deferred>) {
        let config = &self.shared.config;
        let frames = match link_guard.as_mut() {
            Some(link) => link.codec.decode(data),
            None => return,
        };
        let frames = match frames {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "unparseable input from server");
                let fatal = Fatal {
                    error: e,
                    reason: DisconnectReason::InvalidXml,
                };
                core.teardown(link_guard, fatal, out);
                return;
            }
        };
        for frame in frames {
            let handled = match link_guard.as_mut() {
                Some(link) => core.handle_frame(config, link, frame, out),
                None => return,
            };
            if let Err(fatal) = handled {
                core.teardown(link_guard, fatal, out);
                return;
            }
        }
    }

    fn enqueue(&self, out: Vec<Deferred>) {
        if !out.is_empty() {
            lock(&self.shared.backlog).items.extend(out);
        }
    }

    /// Queue callbacks behind older ones and run them. Must be called
    /// without `link` or `core` held.
    fn dispatch(&self, out: Vec<Deferred>) {
        self.enqueue(out);
        self.run_backlog(&|| false);
    }

    /// Run queued callbacks, oldest first, one thread at a time.
    ///
    /// When another thread is already running them this returns at once.
    /// A call from inside one of our own callbacks carries on with the next
    /// item and stops as soon as `done` holds.
    fn run_backlog(&self, done: &dyn Fn() -> bool) {
        let me = thread::current().id();
        let mut guard = {
            let mut backlog = lock(&self.shared.backlog);
            let outermost = match backlog.runner {
                Some(runner) if runner != me => return,
                Some(_) => false,
                None => {
                    backlog.runner = Some(me);
                    true
                }
            };
            RunnerGuard {
                backlog: &self.shared.backlog,
                outermost,
            }
        };
        loop {
            if !guard.outermost && done() {
                return;
            }
            let item = {
                let mut backlog = lock(&self.shared.backlog);
                match backlog.items.pop_front() {
                    Some(item) => item,
                    None => {
                        if guard.outermost {
                            backlog.runner = None;
                            guard.outermost = false;
                        }
                        return;
                    }
                }
            };
            self.run_deferred(item);
        }
    }

    fn run_deferred(&self, item: Deferred) {
        match item {
            Deferred::Complete(completion, reply) => completion.complete(reply),
            Deferred::Fail(completion, error) => completion.fail(error),
            Deferred::Handlers(stanza) => {
                let chain = lock(&self.shared.core).handlers.chain(stanza.kind());
                if handlers::run_chain(&chain, self, &stanza) == HandlerResult::AllowMore {
                    debug!(kind = %stanza.kind(), "no handler took the stanza");
                }
            }
            Deferred::Disconnect(reason) => {
                let handler = lock(&self.shared.core).on_disconnect.clone();
                if let Some(handler) = handler {
                    handler(self, reason);
                }
            }
        }
    }

    /// Wait for `slot` to be filled, pumping I/O when nobody else is.
    fn block_on<T>(&self, slot: &Slot<T>) -> Result<T> {
        let me = thread::current().id();
        let filled = || slot.is_filled();
        loop {
            // Older callbacks first, even when our answer is already queued.
            self.run_backlog(&filled);
            if let Some(result) = slot.take() {
                return result;
            }
            let control = if *lock(&self.shared.pumper) == Some(me) {
                // Called from a callback the pump is running.
                self.pump(POLL_SLICE)?
            } else {
                match self.shared.pump.try_lock() {
                    Ok(_pump) => self.pump_holding(POLL_SLICE, &filled)?,
                    Err(TryLockError::Poisoned(poisoned)) => {
                        let _pump = poisoned.into_inner();
                        self.pump_holding(POLL_SLICE, &filled)?
                    }
                    Err(TryLockError::WouldBlock) => {
                        slot.wait(POLL_SLICE);
                        Control::Continue
                    }
                }
            };
            if control == Control::Remove {
                // Teardown fails every pending request, so the slot is full
                // unless the request never made it into the tracker.
                self.run_backlog(&filled);
                return slot.take().unwrap_or(Err(Error::ConnectionClosed));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests() -> Connection {
        struct Unreachable;

        impl Connector for Unreachable {
            fn connect(&mut self, _host: &str, _port: u16) -> io::Result<Box<dyn Transport>> {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no network in unit tests"))
            }
        }

        match Connection::new(ConnectionConfig::new("localhost"), Box::new(Unreachable)) {
            Ok(conn) => conn,
            Err(e) => panic!("test connection: {}", e),
        }
    }
}

impl EventSource for Connection {
    fn iterate(&self, max_wait: Duration) -> Result<Control> {
        Connection::iterate(self, max_wait)
    }
}
