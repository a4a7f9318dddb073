//! Password authentication methods.
//!
//! - [`md5`] password hashing
//! - [`ScramSha256`] SASL exchange, without channel binding
use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::{borrow::Cow, fmt};

/// SASL mechanism name.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

const NONCE_LEN: usize = 18;

/// gs2 header without channel binding, `c=biws` is its base64.
const GS2_HEADER: &str = "n,,";

/// Hash password for `AuthenticationMD5Password`.
///
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`
pub fn md5(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut md5 = Md5::new();
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let inner = format!("{:x}", md5.finalize());

    let mut md5 = Md5::new();
    md5.update(inner.as_bytes());
    md5.update(salt);
    format!("md5{:x}", md5.finalize())
}

enum State {
    Init,
    Continue {
        salted_password: [u8; 32],
        auth_message: String,
    },
    Done,
}

/// Client side of a `SCRAM-SHA-256` exchange.
///
/// ```text
/// client-first  ->  SASLInitialResponse
///               <-  AuthenticationSASLContinue (server-first)
/// client-final  ->  SASLResponse
///               <-  AuthenticationSASLFinal (server-final, verified)
/// ```
pub struct ScramSha256 {
    password: Vec<u8>,
    nonce: String,
    client_first_bare: String,
    state: State,
}

impl ScramSha256 {
    /// Start exchange with random nonce.
    ///
    /// Postgres takes the user name from the startup message, so it is sent empty.
    pub fn new(password: &str) -> Self {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        Self::with_nonce("", password, STANDARD.encode(nonce))
    }

    pub(crate) fn with_nonce(user: &str, password: &str, nonce: String) -> Self {
        // passwords which saslprep rejects are used as is, same as libpq
        let password = match stringprep::saslprep(password) {
            Ok(prepared) => prepared.into_owned().into_bytes(),
            Err(_) => password.as_bytes().to_vec(),
        };
        let user = user.replace('=', "=3D").replace(',', "=2C");
        let client_first_bare = format!("n={user},r={nonce}");
        Self { password, nonce, client_first_bare, state: State::Init }
    }

    /// `client-first-message` for `SASLInitialResponse`.
    pub fn client_first(&self) -> Vec<u8> {
        format!("{GS2_HEADER}{}", self.client_first_bare).into_bytes()
    }

    /// Consume `server-first-message`, returns `client-final-message`.
    pub fn update(&mut self, server_first: &[u8]) -> Result<Vec<u8>, AuthError> {
        if !matches!(self.state, State::Init) {
            return Err(AuthError::new("unexpected SASL continue"));
        }
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| AuthError::new("server-first-message is not utf8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            match part.split_once('=') {
                Some(("r", value)) => nonce = Some(value),
                Some(("s", value)) => {
                    salt = Some(STANDARD.decode(value).map_err(|_| AuthError::new("invalid salt"))?)
                }
                Some(("i", value)) => {
                    iterations = Some(value.parse::<u32>().map_err(|_| AuthError::new("invalid iteration count"))?)
                }
                _ => {}
            }
        }

        let nonce = nonce.ok_or_else(|| AuthError::new("missing server nonce"))?;
        let salt = salt.ok_or_else(|| AuthError::new("missing salt"))?;
        let iterations = iterations.ok_or_else(|| AuthError::new("missing iteration count"))?;

        if iterations == 0 {
            return Err(AuthError::new("invalid iteration count"));
        }
        if !nonce.starts_with(&self.nonce) || nonce.len() == self.nonce.len() {
            return Err(AuthError::new("server nonce does not extend client nonce"));
        }

        let salted_password = hi(&self.password, &salt, iterations);
        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(client_key);

        let without_proof = format!("c={},r={nonce}", STANDARD.encode(GS2_HEADER));
        let auth_message = format!("{},{server_first},{without_proof}", self.client_first_bare);

        let signature = hmac(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(signature) {
            *p ^= s;
        }

        self.state = State::Continue { salted_password, auth_message };
        Ok(format!("{without_proof},p={}", STANDARD.encode(proof)).into_bytes())
    }

    /// Verify `server-final-message`.
    pub fn finish(&mut self, server_final: &[u8]) -> Result<(), AuthError> {
        let State::Continue { salted_password, auth_message } =
            std::mem::replace(&mut self.state, State::Done)
        else {
            return Err(AuthError::new("unexpected SASL final"));
        };

        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| AuthError::new("server-final-message is not utf8"))?;

        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(AuthError::new(format!("server rejected authentication: {err}")));
        }

        let verifier = server_final
            .split(',')
            .find_map(|e| e.strip_prefix("v="))
            .ok_or_else(|| AuthError::new("missing server signature"))?;
        let verifier = STANDARD
            .decode(verifier)
            .map_err(|_| AuthError::new("invalid server signature"))?;

        let server_key = hmac(&salted_password, b"Server Key");
        let mut mac = Hmac::<Sha256>::new_from_slice(&server_key)
            .expect("HMAC is able to accept all key sizes");
        mac.update(auth_message.as_bytes());
        mac.verify_slice(&verifier)
            .map_err(|_| AuthError::new("server signature mismatch"))
    }
}

impl fmt::Debug for ScramSha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScramSha256").finish_non_exhaustive()
    }
}

pub(crate) fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .expect("HMAC is able to accept all key sizes");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// `Hi()` of RFC 5802, PBKDF2 with HMAC-SHA-256 and a single block.
pub(crate) fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(password)
        .expect("HMAC is able to accept all key sizes");
    mac.update(salt);
    mac.update(&[0, 0, 0, 1]);
    let mut prev: [u8; 32] = mac.finalize().into_bytes().into();

    let mut hi = prev;
    for _ in 1..iterations {
        prev = hmac(password, &prev);
        for (hi, prev) in hi.iter_mut().zip(prev) {
            *hi ^= prev;
        }
    }
    hi
}

/// Authentication exchange failed on the client side.
pub struct AuthError {
    reason: Cow<'static, str>,
}

impl AuthError {
    pub(crate) fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::error::Error for AuthError { }

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authentication failed: {}", self.reason)
    }
}

impl fmt::Debug for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Server requested an authentication method this driver does not implement.
pub struct UnsupportedAuth {
    method: Cow<'static, str>,
}

impl UnsupportedAuth {
    pub(crate) fn new(method: impl Into<Cow<'static, str>>) -> Self {
        Self { method: method.into() }
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl std::error::Error for UnsupportedAuth { }

impl fmt::Display for UnsupportedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported authentication method: {}", self.method)
    }
}

impl fmt::Debug for UnsupportedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
