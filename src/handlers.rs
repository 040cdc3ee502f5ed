// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

use std::sync::Arc;

use crate::connection::Connection;
use crate::stanzas::{AnyStanza, StanzaKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// The stanza is dealt with; later handlers don't see it.
    Remove,
    AllowMore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandlerPriority {
    Last = 1,
    Normal = 2,
    First = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub type Handler = Arc<dyn Fn(&Connection, &AnyStanza) -> HandlerResult + Send + Sync>;

struct Entry {
    id: HandlerId,
    kind: StanzaKind,
    priority: HandlerPriority,
    handler: Handler,
}

/// Handlers for stanzas nobody is waiting a reply for.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<Entry>,
    next_id: u64,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    pub fn register(&mut self, kind: StanzaKind, priority: HandlerPriority, handler: Handler) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        // After every entry of equal or higher priority, so ties keep
        // registration order.
        let at = self
            .entries
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            at,
            Entry {
                id,
                kind,
                priority,
                handler,
            },
        );
        id
    }

    pub fn unregister(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Snapshot of the chain for `kind`, highest priority first.
    ///
    /// Handlers run outside the connection lock, so they get a copy and may
    /// register or unregister while the chain runs.
    pub fn chain(&self, kind: StanzaKind) -> Vec<Handler> {
        self.entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.handler.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Run `chain` until a handler claims the stanza.
pub fn run_chain(chain: &[Handler], conn: &Connection, stanza: &AnyStanza) -> HandlerResult {
    for handler in chain {
        if handler(conn, stanza) == HandlerResult::Remove {
            return HandlerResult::Remove;
        }
    }
    HandlerResult::AllowMore
}
