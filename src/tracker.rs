// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

//! Bookkeeping for requests that are waiting on the server.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::stanzas::AnyStanza;

pub type ResultCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;
pub type ReplyCallback = Box<dyn FnOnce(Result<AnyStanza>) + Send + 'static>;

/// Where an in-flight `open` currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStep {
    /// Waiting for the server's stream header.
    Header,
    /// Header seen, waiting for `<stream:features/>`.
    Features,
    /// `<starttls/>` sent.
    TlsProceed,
}

/// Where an in-flight authentication currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    /// Legacy: waiting for the field list.
    LegacyFields,
    /// Legacy: credentials sent, waiting for the verdict.
    LegacyVerdict,
    /// SASL: `<auth/>` or a `<response/>` sent.
    SaslVerdict,
    /// SASL: stream restarted, waiting for the new header and features.
    SaslRestart,
    /// SASL: bind iq sent.
    Bind,
}

impl AuthStep {
    /// Whether, lacking an answer, the server may already have accepted the
    /// credentials. A stream in that condition can't host another attempt.
    pub fn committed(self) -> bool {
        !matches!(self, AuthStep::LegacyFields)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Open(OpenStep),
    Auth(AuthStep),
    Reply,
}

pub enum Completion {
    Result(ResultCallback),
    Reply(ReplyCallback),
}

impl Completion {
    /// Run the callback with success. Reply callbacks receive `reply`.
    pub fn complete(self, reply: Option<AnyStanza>) {
        match (self, reply) {
            (Completion::Result(cb), _) => cb(Ok(())),
            (Completion::Reply(cb), Some(stanza)) => cb(Ok(stanza)),
            (Completion::Reply(cb), None) => {
                cb(Err(Error::Internal("request completed without a reply".into())))
            }
        }
    }

    /// Run the callback with a failure.
    pub fn fail(self, error: Error) {
        match self {
            Completion::Result(cb) => cb(Err(error)),
            Completion::Reply(cb) => cb(Err(error)),
        }
    }
}

pub struct PendingRequest {
    pub id: String,
    pub kind: RequestKind,
    pub completion: Completion,
    pub deadline: Option<Instant>,
    seq: u64,
}

impl PendingRequest {
    pub fn fail(self, error: Error) {
        self.completion.fail(error)
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Pending requests keyed by correlation id, ordered by creation.
#[derive(Default)]
pub struct Tracker {
    by_seq: BTreeMap<u64, PendingRequest>,
    ids: HashMap<String, u64>,
    next_seq: u64,
    next_id: u64,
}

impl Tracker {
    /// A correlation id that is not pending right now.
    pub fn generate_id(&mut self) -> String {
        loop {
            self.next_id += 1;
            let id = format!("lm{}", self.next_id);
            if !self.ids.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a new request.
    pub fn insert(
        &mut self,
        id: String,
        kind: RequestKind,
        completion: Completion,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.place(PendingRequest {
            id,
            kind,
            completion,
            deadline,
            seq,
        })
        .map_err(|req| Error::Internal(format!("correlation id {} already pending", req.id)))
    }

    /// Put a taken request back under a new id and kind, keeping its place
    /// in the creation order.
    pub fn requeue(
        &mut self,
        mut req: PendingRequest,
        id: String,
        kind: RequestKind,
    ) -> std::result::Result<(), PendingRequest> {
        req.id = id;
        req.kind = kind;
        self.place(req)
    }

    fn place(&mut self, req: PendingRequest) -> std::result::Result<(), PendingRequest> {
        if self.ids.contains_key(&req.id) {
            return Err(req);
        }
        self.ids.insert(req.id.clone(), req.seq);
        self.by_seq.insert(req.seq, req);
        Ok(())
    }

    pub fn kind_of(&self, id: &str) -> Option<&RequestKind> {
        let seq = self.ids.get(id)?;
        self.by_seq.get(seq).map(|req| &req.kind)
    }

    pub fn take(&mut self, id: &str) -> Option<PendingRequest> {
        let seq = self.ids.remove(id)?;
        self.by_seq.remove(&seq)
    }

    /// Take the oldest request whose kind matches.
    pub fn take_where<F: Fn(&RequestKind) -> bool>(&mut self, pred: F) -> Option<PendingRequest> {
        let seq = self
            .by_seq
            .values()
            .find(|req| pred(&req.kind))
            .map(|req| req.seq)?;
        let req = self.by_seq.remove(&seq)?;
        self.ids.remove(&req.id);
        Some(req)
    }

    /// Every request, oldest first.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.ids.clear();
        std::mem::take(&mut self.by_seq).into_values().collect()
    }

    /// Requests whose deadline is at or before `now`, oldest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingRequest> {
        let expired: Vec<u64> = self
            .by_seq
            .values()
            .filter(|req| req.deadline.map_or(false, |d| d <= now))
            .map(|req| req.seq)
            .collect();
        expired
            .into_iter()
            .filter_map(|seq| {
                let req = self.by_seq.remove(&seq)?;
                self.ids.remove(&req.id);
                Some(req)
            })
            .collect()
    }
}

#[cfg(test)]
impl Tracker {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    fn find_where<F: Fn(&RequestKind) -> bool>(&self, pred: F) -> Option<&PendingRequest> {
        self.by_seq.values().find(|req| pred(&req.kind))
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.by_seq.values().filter_map(|req| req.deadline).min()
    }

    fn len(&self) -> usize {
        self.by_seq.len()
    }

    fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Completion) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |name: &str| {
                let log = log.clone();
                let name = name.to_string();
                Completion::Reply(Box::new(move |res| {
                    let outcome = match res {
                        Ok(_) => "ok".to_string(),
                        Err(e) => e.to_string(),
                    };
                    log.lock().unwrap().push(format!("{}: {}", name, outcome));
                }))
            }
        };
        (log, make)
    }

    #[test]
    fn generated_ids_are_unique() {
        let mut tracker = Tracker::default();
        let a = tracker.generate_id();
        let b = tracker.generate_id();
        assert_ne!(a, b);
    }

    #[test]
    fn generated_ids_skip_pending_ones() {
        let mut tracker = Tracker::default();
        let (_log, make) = recorder();
        tracker.insert("lm1".into(), RequestKind::Reply, make("x"), None).unwrap();
        assert_eq!(tracker.generate_id(), "lm2");
    }

    #[test]
    fn duplicate_id_is_internal_error() {
        let mut tracker = Tracker::default();
        let (log, make) = recorder();
        tracker.insert("a".into(), RequestKind::Reply, make("first"), None).unwrap();
        let err = tracker
            .insert("a".into(), RequestKind::Reply, make("second"), None)
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(tracker.len(), 1);
        // The rejected callback is dropped, never run.
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn drain_is_in_creation_order() {
        let mut tracker = Tracker::default();
        let (log, make) = recorder();
        for name in ["z", "a", "m"] {
            tracker.insert(name.into(), RequestKind::Reply, make(name), None).unwrap();
        }
        for req in tracker.drain() {
            req.fail(Error::ConnectionClosed);
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["z: connection closed", "a: connection closed", "m: connection closed"]
        );
        assert!(tracker.is_empty());
        assert!(!tracker.contains("a"));
    }

    #[test]
    fn expiry_only_takes_due_requests() {
        let mut tracker = Tracker::default();
        let (_log, make) = recorder();
        let now = Instant::now();
        tracker
            .insert("soon".into(), RequestKind::Reply, make("soon"), Some(now))
            .unwrap();
        tracker
            .insert("later".into(), RequestKind::Reply, make("later"), Some(now + Duration::from_secs(60)))
            .unwrap();
        tracker.insert("never".into(), RequestKind::Reply, make("never"), None).unwrap();

        assert_eq!(tracker.next_deadline(), Some(now));
        let expired = tracker.take_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "soon");
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.next_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn requeue_keeps_creation_order() {
        let mut tracker = Tracker::default();
        let (log, make) = recorder();
        tracker
            .insert("auth1".into(), RequestKind::Auth(AuthStep::LegacyFields), make("auth"), None)
            .unwrap();
        tracker.insert("msg".into(), RequestKind::Reply, make("msg"), None).unwrap();

        let auth = tracker.take("auth1").unwrap();
        tracker
            .requeue(auth, "auth2".into(), RequestKind::Auth(AuthStep::LegacyVerdict))
            .unwrap();
        assert!(tracker
            .find_where(|k| matches!(*k, RequestKind::Auth(AuthStep::LegacyVerdict)))
            .is_some());

        for req in tracker.drain() {
            req.fail(Error::ConnectionClosed);
        }
        let log = log.lock().unwrap();
        assert!(log[0].starts_with("auth"));
        assert!(log[1].starts_with("msg"));
    }

    #[test]
    fn only_the_field_query_is_uncommitted() {
        assert!(!AuthStep::LegacyFields.committed());
        for step in [AuthStep::LegacyVerdict, AuthStep::SaslVerdict, AuthStep::SaslRestart, AuthStep::Bind] {
            assert!(step.committed(), "{:?}", step);
        }
    }

    #[test]
    fn take_where_matches_kind() {
        let mut tracker = Tracker::default();
        let (_log, make) = recorder();
        tracker.insert("m".into(), RequestKind::Reply, make("m"), None).unwrap();
        let header = RequestKind::Open(OpenStep::Header);
        tracker.insert("o".into(), header.clone(), make("o"), None).unwrap();
        assert!(tracker.take_where(|k| *k == RequestKind::Open(OpenStep::Features)).is_none());
        let open = tracker.take_where(|k| *k == header).unwrap();
        assert_eq!(open.id, "o");
        assert!(!tracker.contains("o"));
        assert!(tracker.take_where(|k| *k == header).is_none());
    }
}
