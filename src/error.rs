// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

use std::io;

use thiserror::Error;

use crate::connection::ConnectionState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The byte stream failed: refused, reset, or closed underneath us.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer sent something that is not a well-formed stream.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("operation requires state {expected}, connection is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: ConnectionState,
    },

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Clone for Error {
    fn clone(&self) -> Error {
        match *self {
            Error::Transport(ref e) => Error::Transport(io::Error::new(e.kind(), e.to_string())),
            Error::Protocol(ref s) => Error::Protocol(s.clone()),
            Error::AuthFailure(ref s) => Error::AuthFailure(s.clone()),
            Error::InvalidState { expected, actual } => Error::InvalidState { expected, actual },
            Error::Timeout => Error::Timeout,
            Error::ConnectionClosed => Error::ConnectionClosed,
            Error::Internal(ref s) => Error::Internal(s.clone()),
            Error::Config(ref s) => Error::Config(s.clone()),
        }
    }
}

/// Why an opened session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed locally with `close()`.
    Ok,
    /// The keep-alive or a pending open/auth request ran out of time.
    PingTimeout,
    /// The peer ended the stream or hung up.
    Hup,
    Error,
    /// Another session bound the same resource.
    ResourceConflict,
    InvalidXml,
    AuthFailed,
}
