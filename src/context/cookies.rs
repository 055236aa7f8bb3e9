//! Cookie jar bound to a handshake request
//!
//! Cookies are read from the handshake's `Cookie` header. A realtime connection
//! has no HTTP response to write to, so the jar talks to a response stand-in;
//! the default one discards everything.

use cookie::{Cookie, CookieJar, Key};
use http::header::{COOKIE, SET_COOKIE};
use sha2::{Digest, Sha512};
use thiserror::Error;
use tracing::{debug, warn};

use crate::transport::HandshakeRequest;

/// Errors raised by the cookie jar
#[derive(Debug, Error)]
pub enum CookieError {
    #[error("signing keys are required for signed cookies")]
    MissingKeys,
}

/// The two response members the cookie jar needs
pub trait ResponseHeaders {
    fn set_header(&mut self, name: &str, value: &str);
    fn get_header(&self, name: &str) -> Option<&str>;
}

/// Response stand-in that never sends anything
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoopResponse;

impl ResponseHeaders for NoopResponse {
    fn set_header(&mut self, _name: &str, _value: &str) {}

    fn get_header(&self, _name: &str) -> Option<&str> {
        None
    }
}

/// Request cookies plus signing keys
pub struct Cookies<R = NoopResponse> {
    jar: CookieJar,
    keys: Vec<Key>,
    response: R,
}

impl<R: ResponseHeaders> Cookies<R> {
    /// Build a jar from the request's `Cookie` header.
    ///
    /// Each signing secret is stretched to a 64-byte key with SHA-512. The first
    /// key signs, every key verifies.
    pub fn new(request: &HandshakeRequest, response: R, keys: &[String]) -> Self {
        let mut jar = CookieJar::new();
        if let Some(header) = request.headers().get(COOKIE).and_then(|v| v.to_str().ok()) {
            for parsed in Cookie::split_parse(header) {
                match parsed {
                    Ok(cookie) => jar.add_original(cookie.into_owned()),
                    Err(e) => debug!("Skipping malformed cookie: {}", e),
                }
            }
        }

        let keys = keys
            .iter()
            .filter_map(|secret| match Key::try_from(Sha512::digest(secret.as_bytes()).as_slice()) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!("Ignoring unusable signing key: {}", e);
                    None
                }
            })
            .collect();

        Self {
            jar,
            keys,
            response,
        }
    }

    /// Value of an unsigned cookie
    pub fn get(&self, name: &str) -> Option<&str> {
        self.jar.get(name).map(Cookie::value)
    }

    /// Value of a signed cookie whose signature verifies against any key
    pub fn get_signed(&self, name: &str) -> Option<String> {
        self.keys
            .iter()
            .find_map(|key| self.jar.signed(key).get(name))
            .map(|cookie| cookie.value().to_string())
    }

    /// Set a cookie on the jar and hand the header to the response
    pub fn set(&mut self, cookie: Cookie<'static>) {
        self.response.set_header(SET_COOKIE.as_str(), &cookie.to_string());
        self.jar.add(cookie);
    }

    /// Sign a cookie with the newest key and set it
    pub fn set_signed(&mut self, cookie: Cookie<'static>) -> Result<(), CookieError> {
        let key = self.keys.first().ok_or(CookieError::MissingKeys)?;
        let name = cookie.name().to_string();
        self.jar.signed_mut(key).add(cookie);

        if let Some(signed) = self.jar.get(&name) {
            self.response.set_header(SET_COOKIE.as_str(), &signed.to_string());
        }
        Ok(())
    }

    /// Whether any signing key is configured
    pub fn can_sign(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn response(&self) -> &R {
        &self.response
    }

    /// Cookies set since the jar was built
    pub fn delta(&self) -> impl Iterator<Item = &Cookie<'static>> {
        self.jar.delta()
    }
}
