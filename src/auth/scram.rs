// rust-xmpp
// Copyright (c) 2014 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

//! SCRAM-SHA-1 (RFC 5802), without channel binding.

use std::str;

use openssl::hash::{hash, MessageDigest};
use openssl::pkcs5::pbkdf2_hmac;
use openssl::pkey::PKey;
use openssl::rand::rand_bytes;
use openssl::sign::Signer;

use super::Authenticator;

macro_rules! check (
    ($e:expr, $s:expr) => (match $e { Some(s) => s, None => return Err($s) })
);

enum State {
    Initial,
    WaitFirst { cnonce: String, client_first_bare: String },
    WaitFinal { server_signature: Vec<u8> },
    Finished,
}

pub struct ScramAuth {
    authcid: String,
    authzid: Option<String>,
    passwd: String,
    state: State,
}

fn gen_nonce() -> Result<String, &'static str> {
    let mut nonce = vec![0; 32];
    rand_bytes(&mut nonce).map_err(|_| "SCRAM: couldn't generate nonce")?;

    // Printable ASCII without ','
    Ok(nonce
        .into_iter()
        .map(|b| match (b % (b'~' - b'!')) + b'!' {
            b',' => '~',
            c => c as char,
        })
        .collect())
}

/// `saslname` escaping of a username.
fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<Vec<u8>, &'static str> {
    let pkey = PKey::hmac(key).map_err(|_| "SCRAM: HMAC key setup failed")?;
    let mut signer = Signer::new(MessageDigest::sha1(), &pkey).map_err(|_| "SCRAM: HMAC setup failed")?;
    signer.sign_oneshot_to_vec(data).map_err(|_| "SCRAM: HMAC failed")
}

fn parse_server_first(data: &str) -> Result<(&str, Vec<u8>, u32), &'static str> {
    let mut nonce = None;
    let mut salt = None;
    let mut iter = None;
    for sub in data.split(',') {
        if let Some(value) = sub.strip_prefix("r=") {
            nonce = Some(value);
        } else if let Some(value) = sub.strip_prefix("s=") {
            salt = Some(base64::decode(value).map_err(|_| "SCRAM: invalid base64 encoding for salt")?);
        } else if let Some(value) = sub.strip_prefix("i=") {
            iter = Some(value.parse().map_err(|_| "SCRAM: iteration count is not a number")?);
        } else if sub.starts_with("m=") {
            return Err("SCRAM: unsupported mandatory extension found");
        }
    }

    let nonce = check!(nonce, "SCRAM: no nonce found");
    let salt = check!(salt, "SCRAM: no salt found");
    let iter = check!(iter, "SCRAM: no iteration count found");
    if iter == 0 {
        return Err("SCRAM: iteration count must be positive");
    }

    Ok((nonce, salt, iter))
}

impl ScramAuth {
    pub fn new(authcid: String, passwd: String, authzid: Option<String>) -> ScramAuth {
        ScramAuth {
            authcid,
            passwd,
            authzid,
            state: State::Initial,
        }
    }

    fn gs2_header(&self) -> String {
        match self.authzid {
            Some(ref a) => format!("n,a={},", escape_name(a)),
            None => "n,,".to_string(),
        }
    }

    fn client_first(&mut self, cnonce: String) -> Vec<u8> {
        let client_first_bare = format!("n={},r={}", escape_name(&self.authcid), cnonce);
        let message = format!("{}{}", self.gs2_header(), client_first_bare);
        self.state = State::WaitFirst {
            cnonce,
            client_first_bare,
        };
        message.into_bytes()
    }

    fn handle_server_first(&mut self, data: &[u8]) -> Result<Vec<u8>, &'static str> {
        let (cnonce, client_first_bare) = match self.state {
            State::WaitFirst {
                ref cnonce,
                ref client_first_bare,
            } => (cnonce.clone(), client_first_bare.clone()),
            _ => return Err("SCRAM: unexpected server-first-message"),
        };

        let data = check!(str::from_utf8(data).ok(), "SCRAM: server sent non-UTF-8 data");
        let (nonce, salt, iter) = parse_server_first(data)?;
        if !nonce.starts_with(&cnonce) || nonce.len() == cnonce.len() {
            return Err("SCRAM: server replied with invalid nonce");
        }

        // c=<base64(GS2Header)>,r=<nonce>
        let without_proof = format!("c={},r={}", base64::encode(self.gs2_header()), nonce);

        // SaltedPassword := Hi(Normalize(password), salt, i)
        let mut salted_passwd = [0; 20];
        pbkdf2_hmac(
            self.passwd.as_bytes(),
            &salt,
            iter as usize,
            MessageDigest::sha1(),
            &mut salted_passwd,
        )
        .map_err(|_| "SCRAM: failed to compute Hi()")?;

        // AuthMessage := client-first-message-bare + "," +
        //                server-first-message + "," +
        //                client-final-message-without-proof
        let auth_message = format!("{},{},{}", client_first_bare, data, without_proof);

        // ClientKey := HMAC(SaltedPassword, "Client Key")
        let client_key = hmac_sha1(&salted_passwd, b"Client Key")?;
        // StoredKey := H(ClientKey)
        let stored_key = hash(MessageDigest::sha1(), &client_key).map_err(|_| "SCRAM: SHA-1 failed")?;
        // ClientSignature := HMAC(StoredKey, AuthMessage)
        let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes())?;
        // ServerKey := HMAC(SaltedPassword, "Server Key")
        let server_key = hmac_sha1(&salted_passwd, b"Server Key")?;
        // ServerSignature := HMAC(ServerKey, AuthMessage)
        let server_signature = hmac_sha1(&server_key, auth_message.as_bytes())?;
        // ClientProof := ClientKey XOR ClientSignature
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(x, y)| x ^ y)
            .collect();

        self.state = State::WaitFinal { server_signature };
        Ok(format!("{},p={}", without_proof, base64::encode(client_proof)).into_bytes())
    }

    fn handle_server_final(&mut self, data: &[u8]) -> Result<Vec<u8>, &'static str> {
        let data = check!(str::from_utf8(data).ok(), "SCRAM: server sent non-UTF-8 data");
        if let Some(err) = data.strip_prefix("e=") {
            return Err(if err == "invalid-proof" {
                "SCRAM: server rejected the proof"
            } else {
                "SCRAM: server reported an error"
            });
        }
        let verifier = check!(data.strip_prefix("v="), "SCRAM: server didn't send a verifier");
        let verifier = base64::decode(verifier).map_err(|_| "SCRAM: verifier has invalid base64 encoding")?;

        match self.state {
            State::WaitFinal { ref server_signature } if *server_signature == verifier => (),
            State::WaitFinal { .. } => return Err("SCRAM: server sent invalid verifier"),
            _ => return Err("SCRAM: unexpected server-final-message"),
        }

        self.state = State::Finished;
        Ok(Vec::new())
    }
}

impl Authenticator for ScramAuth {
    fn mechanism(&self) -> &'static str {
        "SCRAM-SHA-1"
    }

    fn initial(&mut self) -> Result<Vec<u8>, &'static str> {
        let cnonce = gen_nonce()?;
        Ok(self.client_first(cnonce))
    }

    fn continuation(&mut self, data: &[u8]) -> Result<Vec<u8>, &'static str> {
        match self.state {
            State::Initial => self.initial(),
            State::WaitFirst { .. } => self.handle_server_first(data),
            State::WaitFinal { .. } => self.handle_server_final(data),
            State::Finished => Ok(Vec::new()),
        }
    }

    fn verified(&self) -> bool {
        matches!(self.state, State::Finished)
    }
}
