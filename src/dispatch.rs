// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

//! The seam between connections and whatever loop the host runs.
//!
//! A connection never owns a loop. Hosts either call
//! [`EventSource::iterate`] from their own loop (select/epoll, an async
//! runtime, a GUI idle hook) or use the small [`MainLoop`] below.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// The source is finished and should not be polled again.
    Remove,
}

pub trait EventSource: Send {
    /// Wait at most `max_wait` for I/O, then dispatch whatever is ready.
    fn iterate(&self, max_wait: Duration) -> Result<Control>;
}

/// Stops a [`MainLoop`] from any thread, including from inside a callback
/// the loop is dispatching. A quit issued before [`MainLoop::run`] makes
/// `run` return at once.
#[derive(Clone, Debug)]
pub struct LoopHandle {
    running: Arc<AtomicBool>,
}

impl LoopHandle {
    pub fn quit(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct MainLoop {
    sources: Vec<Box<dyn EventSource>>,
    running: Arc<AtomicBool>,
    slice: Duration,
}

impl Default for MainLoop {
    fn default() -> MainLoop {
        MainLoop::new()
    }
}

impl MainLoop {
    pub fn new() -> MainLoop {
        MainLoop {
            sources: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
            slice: Duration::from_millis(50),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            running: self.running.clone(),
        }
    }

    pub fn add_source<S: EventSource + 'static>(&mut self, source: S) {
        self.sources.push(Box::new(source));
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Give every source one turn. Sources that finish or fail are dropped.
    pub fn run_iteration(&mut self) {
        // Split the time slice so one idle source doesn't starve the rest.
        let per_source = self.slice / (self.sources.len().max(1) as u32);
        self.sources.retain(|source| match source.iterate(per_source) {
            Ok(Control::Continue) => true,
            Ok(Control::Remove) => false,
            Err(e) => {
                warn!(error = %e, "event source failed, removing it");
                false
            }
        });
    }

    /// Iterate until [`LoopHandle::quit`] is called or no sources remain.
    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) && !self.sources.is_empty() {
            self.run_iteration();
        }
        self.running.store(false, Ordering::SeqCst);
    }
}
