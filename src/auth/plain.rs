// rust-xmpp
// Copyright (c) 2014 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

use super::Authenticator;

/// SASL PLAIN (RFC 4616).
pub struct PlainAuth {
    authcid: String,
    authzid: Option<String>,
    passwd: String,
}

impl PlainAuth {
    pub fn new(authcid: String, passwd: String, authzid: Option<String>) -> PlainAuth {
        PlainAuth {
            authcid,
            passwd,
            authzid,
        }
    }
}

impl Authenticator for PlainAuth {
    fn mechanism(&self) -> &'static str {
        "PLAIN"
    }

    fn initial(&mut self) -> Result<Vec<u8>, &'static str> {
        if self.authcid.contains('\0') || self.passwd.contains('\0') {
            return Err("PLAIN: credentials must not contain NUL");
        }
        let mut data: Vec<u8> = Vec::new();
        if let Some(ref authzid) = self.authzid {
            data.extend(authzid.bytes());
        }
        data.push(0);
        data.extend(self.authcid.bytes());
        data.push(0);
        data.extend(self.passwd.bytes());
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_response_layout() {
        let mut auth = PlainAuth::new("u".into(), "p".into(), None);
        assert_eq!(auth.initial().unwrap(), b"\0u\0p");
        assert_eq!(base64::encode(auth.initial().unwrap()), "AHUAcA==");

        let mut auth = PlainAuth::new("u".into(), "p".into(), Some("admin".into()));
        assert_eq!(auth.initial().unwrap(), b"admin\0u\0p");
    }

    #[test]
    fn rejects_embedded_nul() {
        let mut auth = PlainAuth::new("u\0x".into(), "p".into(), None);
        assert!(auth.initial().is_err());
    }
}
