// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

//! A client-side XMPP connection library.
//!
//! A [`Connection`] opens a stream to a server, authenticates on it, and
//! sends stanzas either fire-and-forget, with a reply callback, or blocking
//! until the reply arrives. It does not own an event loop; drive it through
//! [`Connection::iterate`], the [`EventSource`] trait, or [`MainLoop`].
//!
//! ```no_run
//! use xmpp::{Connection, ConnectionConfig, Message};
//!
//! let conn = Connection::with_tcp(ConnectionConfig::new("example.org"))?;
//! conn.open_and_block()?;
//! conn.authenticate_and_block("alice", "secret", "desk")?;
//! conn.send(Message::chat("bob@example.org", "hello"))?;
//! conn.close();
//! # Ok::<(), xmpp::Error>(())
//! ```

pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handlers;
mod non_stanzas;
pub mod ns;
pub mod stanzas;
mod tracker;
pub mod transport;

pub use crate::config::{AuthMethod, ConnectionConfig, StartTlsPolicy};
pub use crate::connection::{Connection, ConnectionState, DisconnectHandler};
pub use crate::dispatch::{Control, EventSource, LoopHandle, MainLoop};
pub use crate::error::{DisconnectReason, Error, Result};
pub use crate::handlers::{HandlerId, HandlerPriority, HandlerResult};
pub use crate::stanzas::{AnyStanza, Iq, IqType, Message, MessageType, Presence, PresenceType, Stanza, StanzaKind};
pub use crate::transport::{Connector, TcpConnector, Transport};
