//! Signed session cookie codec.
//!
//! Cookie values have the shape `<sid>.<mac>`: the session id in the clear,
//! followed by the URL-safe base64 (unpadded) of a keyed BLAKE3 MAC over the
//! id. The MAC key is derived from the configured secret, so cookies survive
//! restarts but not secret rotation.
//!
//! Decoding is strict and silent: any cookie that fails parsing or
//! verification yields no session id, which callers treat exactly like "no
//! cookie at all". A tampered cookie therefore demotes the request to
//! anonymous instead of erroring.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use http::header::COOKIE;
use http::HeaderMap;
use subtle::ConstantTimeEq as _;

use agora_core::SessionId;

/// Domain separator for deriving the cookie MAC key from the secret.
const KEY_CONTEXT: &str = "agora 2026-01-12 session cookie mac";

/// Signs and verifies the session cookie for one server instance.
#[derive(Clone)]
pub struct CookieCodec {
    name: String,
    key: [u8; 32],
    max_age: Duration,
    secure: bool,
}

impl CookieCodec {
    /// Builds a codec for cookies called `name`, signed under a key derived
    /// from `secret`.
    #[must_use]
    pub fn new(name: impl Into<String>, secret: &str, max_age: Duration, secure: bool) -> Self {
        Self {
            name: name.into(),
            key: blake3::derive_key(KEY_CONTEXT, secret.as_bytes()),
            max_age,
            secure,
        }
    }

    /// The cookie name this codec reads and writes.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renders the signed cookie value `<sid>.<mac>` for a session id.
    #[must_use]
    pub fn encode(&self, id: &SessionId) -> String {
        let mac = blake3::keyed_hash(&self.key, id.as_str().as_bytes());
        format!("{}.{}", id, URL_SAFE_NO_PAD.encode(mac.as_bytes()))
    }

    /// Recovers the session id from a cookie value, if the MAC verifies.
    ///
    /// Comparison of the presented MAC is constant-time. Returns `None` for
    /// anything malformed: no separator, undecodable base64, wrong MAC
    /// length, or a MAC that does not match.
    #[must_use]
    pub fn decode(&self, value: &str) -> Option<SessionId> {
        let (sid, mac_b64) = value.split_once('.')?;
        if sid.is_empty() {
            return None;
        }
        let presented = URL_SAFE_NO_PAD.decode(mac_b64).ok()?;
        let expected = blake3::keyed_hash(&self.key, sid.as_bytes());
        if bool::from(presented.as_slice().ct_eq(expected.as_bytes())) {
            Some(SessionId::from(sid))
        } else {
            None
        }
    }

    /// Finds this codec's cookie among the request's `Cookie` headers and
    /// decodes it. The first occurrence wins.
    #[must_use]
    pub fn extract(&self, headers: &HeaderMap) -> Option<SessionId> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == self.name).then_some(value)
            })
            .find_map(|value| self.decode(value))
    }

    /// Renders the `Set-Cookie` header value establishing `id` on the client.
    ///
    /// `HttpOnly` keeps scripts away from the session credential and
    /// `SameSite=Lax` keeps the cookie off cross-site subrequests; the CSRF
    /// guard covers what `Lax` does not.
    #[must_use]
    pub fn set_cookie(&self, id: &SessionId) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.name,
            self.encode(id),
            self.max_age.as_secs()
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

impl std::fmt::Debug for CookieCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieCodec")
            .field("name", &self.name)
            .field("max_age", &self.max_age)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}
