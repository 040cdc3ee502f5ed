// rust-xmpp
// Copyright (c) 2014 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

use std::fmt;

pub use self::plain::PlainAuth;
pub use self::scram::ScramAuth;

use crate::config::AuthMethod;

pub mod bind;
pub mod legacy;
pub mod plain;
pub mod scram;

/// One SASL mechanism, client side.
pub trait Authenticator {
    fn mechanism(&self) -> &'static str;
    fn initial(&mut self) -> Result<Vec<u8>, &'static str>;
    /// Answer a challenge, or check the additional data sent with success.
    fn continuation(&mut self, _data: &[u8]) -> Result<Vec<u8>, &'static str> {
        Ok(Vec::new())
    }
    /// Whether the server has proven it knows the credentials too.
    fn verified(&self) -> bool {
        true
    }
}

pub type Mechanism = Box<dyn Authenticator + Send>;

/// The mechanism `method` asks for, among those the server offers.
pub fn select_mechanism(method: AuthMethod, offered: &[String], creds: &Credentials) -> Option<Mechanism> {
    let wanted: &[&str] = match method {
        AuthMethod::Legacy => &[],
        AuthMethod::Sasl => &["SCRAM-SHA-1", "PLAIN"],
        AuthMethod::SaslPlain => &["PLAIN"],
        AuthMethod::SaslScramSha1 => &["SCRAM-SHA-1"],
    };
    let name = wanted.iter().find(|name| offered.iter().any(|o| o == *name))?;
    let (authcid, passwd) = (creds.identity.clone(), creds.secret.clone());
    let mech: Mechanism = match *name {
        "SCRAM-SHA-1" => Box::new(ScramAuth::new(authcid, passwd, None)),
        _ => Box::new(PlainAuth::new(authcid, passwd, None)),
    };
    Some(mech)
}

/// What `authenticate` was called with.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identity: String,
    pub secret: String,
    pub resource: String,
}

impl Credentials {
    pub fn new(identity: &str, secret: &str, resource: &str) -> Credentials {
        Credentials {
            identity: identity.to_string(),
            secret: secret.to_string(),
            resource: resource.to_string(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .field("resource", &self.resource)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_secret() {
        let creds = Credentials::new("jdahlin", "amiga", "gossip");
        let shown = format!("{:?}", creds);
        assert!(shown.contains("jdahlin"));
        assert!(!shown.contains("amiga"));
    }

    #[test]
    fn selection_prefers_scram() {
        let creds = Credentials::new("u", "p", "r");
        let offered = vec!["PLAIN".to_string(), "SCRAM-SHA-1".to_string()];
        let pick = |method| select_mechanism(method, &offered, &creds).map(|m| m.mechanism());

        assert_eq!(pick(AuthMethod::Sasl), Some("SCRAM-SHA-1"));
        assert_eq!(pick(AuthMethod::SaslPlain), Some("PLAIN"));
        assert_eq!(pick(AuthMethod::Legacy), None);

        let plain_only = vec!["PLAIN".to_string()];
        assert!(select_mechanism(AuthMethod::SaslScramSha1, &plain_only, &creds).is_none());
        assert_eq!(
            select_mechanism(AuthMethod::Sasl, &plain_only, &creds).map(|m| m.mechanism()),
            Some("PLAIN")
        );
    }
}
