// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 5222;
pub const DEFAULT_TLS_PORT: u16 = 5223;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    /// `jabber:iq:auth`, using a digest when the server offers one.
    #[default]
    Legacy,
    /// The strongest SASL mechanism both sides support: SCRAM-SHA-1, then
    /// PLAIN.
    Sasl,
    SaslPlain,
    SaslScramSha1,
}

/// Whether to upgrade a plain connection with STARTTLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartTlsPolicy {
    Never,
    /// Upgrade when the server offers it.
    #[default]
    IfOffered,
    /// Fail `open` unless the stream ends up encrypted.
    Required,
}

/// Everything a `Connection` needs to know about its server.
///
/// Durations are given in whole seconds so the struct can be read straight
/// from a TOML table:
///
/// ```toml
/// server = "jabber.org"
/// port = 5222
/// auth_method = "sasl"
/// starttls = "required"
/// request_timeout = 30
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionConfig {
    pub server: String,
    pub port: Option<u16>,
    /// TLS from the first byte, on the legacy port.
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub starttls: StartTlsPolicy,
    #[serde(default)]
    pub auth_method: AuthMethod,
    /// Seconds before a request awaiting a reply fails. Unset waits forever.
    pub request_timeout: Option<u64>,
    /// Seconds of write silence before a whitespace keep-alive is sent.
    pub keep_alive: Option<u64>,
    #[serde(default = "default_true")]
    pub close_on_auth_failure: bool,
}

fn default_true() -> bool {
    true
}

impl ConnectionConfig {
    pub fn new(server: &str) -> ConnectionConfig {
        ConnectionConfig {
            server: server.to_string(),
            port: None,
            use_tls: false,
            starttls: StartTlsPolicy::default(),
            auth_method: AuthMethod::default(),
            request_timeout: None,
            keep_alive: None,
            close_on_auth_failure: true,
        }
    }

    pub fn with_port(mut self, port: u16) -> ConnectionConfig {
        self.port = Some(port);
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> ConnectionConfig {
        self.use_tls = use_tls;
        self
    }

    pub fn with_starttls(mut self, policy: StartTlsPolicy) -> ConnectionConfig {
        self.starttls = policy;
        self
    }

    pub fn with_auth_method(mut self, method: AuthMethod) -> ConnectionConfig {
        self.auth_method = method;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> ConnectionConfig {
        self.request_timeout = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_keep_alive(mut self, rate: Duration) -> ConnectionConfig {
        self.keep_alive = Some(rate.as_secs().max(1));
        self
    }

    pub fn with_close_on_auth_failure(mut self, close: bool) -> ConnectionConfig {
        self.close_on_auth_failure = close;
        self
    }

    pub fn from_toml_str(raw: &str) -> Result<ConnectionConfig> {
        let config: ConnectionConfig =
            toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<ConnectionConfig> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        ConnectionConfig::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            return Err(Error::Config("server must not be empty".into()));
        }
        if self.port == Some(0) {
            return Err(Error::Config("port must not be 0".into()));
        }
        Ok(())
    }

    pub fn effective_port(&self) -> u16 {
        match self.port {
            Some(port) => port,
            None if self.use_tls => DEFAULT_TLS_PORT,
            None => DEFAULT_PORT,
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout.map(Duration::from_secs)
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive.map(Duration::from_secs)
    }
}
