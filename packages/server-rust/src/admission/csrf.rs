//! Path-sensitive CSRF guard.
//!
//! Double-submit scheme keyed per session. Tokens are minted from the
//! session's CSRF key and handed out on every non-exempt response;
//! mutating requests must present one back. Each mint carries a fresh
//! salt so tokens are never byte-stable across responses, but any token
//! minted for the session verifies until the session ends.
//!
//! Exemption is a property of the request path. Paths under the configured
//! namespace prefix (`{prefix}/...`) belong to token-authenticated API
//! clients and skip the guard entirely; the bare prefix itself stays
//! protected, as does everything outside the namespace.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http::{HeaderMap, Method, Uri};
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::debug;

use agora_core::context::RequestContext;
use agora_core::errors::AdmissionError;

use super::identity;

/// Header carrying the CSRF token on mutating requests.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Query parameter fallback for clients that cannot set headers.
pub const CSRF_QUERY_PARAM: &str = "_csrf";

const SALT_LEN: usize = 16;

/// Whether `path` falls inside the exempt namespace.
///
/// Only strict descendants are exempt: with prefix `/api`, the path
/// `/api/v1/topics` skips the guard while `/api` itself and `/apifoo` do
/// not. An empty prefix exempts nothing.
#[must_use]
pub fn is_exempt(path: &str, exempt_prefix: &str) -> bool {
    !exempt_prefix.is_empty()
        && path
            .strip_prefix(exempt_prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Whether `method` is subject to CSRF verification.
#[must_use]
pub fn enforces(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Mints a fresh token bound to `csrf_key`: `b64(salt).b64(mac)`.
#[must_use]
pub fn mint_token(csrf_key: &[u8; 32]) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    let mac = blake3::keyed_hash(csrf_key, &salt);
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(salt),
        URL_SAFE_NO_PAD.encode(mac.as_bytes())
    )
}

/// Checks `presented` against `csrf_key` in constant time.
#[must_use]
pub fn verify_token(csrf_key: &[u8; 32], presented: &str) -> bool {
    let Some((salt, mac)) = presented.split_once('.') else {
        return false;
    };
    let Ok(salt) = URL_SAFE_NO_PAD.decode(salt) else {
        return false;
    };
    let Ok(mac) = URL_SAFE_NO_PAD.decode(mac) else {
        return false;
    };
    let expected = blake3::keyed_hash(csrf_key, &salt);
    mac.as_slice().ct_eq(expected.as_bytes()).into()
}

/// Attaches a freshly minted token to the context when the request path is
/// not exempt. Runs for every outcome of a non-exempt request, rejections
/// included, so browser clients can always re-arm their next form.
pub fn issue(ctx: &mut RequestContext, path: &str, exempt_prefix: &str) {
    if !is_exempt(path, exempt_prefix) {
        ctx.csrf_token = Some(mint_token(&ctx.session.record.csrf_key));
    }
}

/// Verifies the token presented with a mutating request.
///
/// Exempt paths pass unconditionally. Everywhere else the token comes from
/// the [`CSRF_HEADER`] header or, failing that, the [`CSRF_QUERY_PARAM`]
/// query parameter, and must verify against the session's key.
///
/// # Errors
///
/// Returns [`AdmissionError::CsrfInvalid`] when the token is missing or
/// fails verification.
pub fn verify(
    ctx: &RequestContext,
    headers: &HeaderMap,
    uri: &Uri,
    exempt_prefix: &str,
) -> Result<(), AdmissionError> {
    if is_exempt(uri.path(), exempt_prefix) {
        return Ok(());
    }

    let presented = headers
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or_else(|| identity::query_param(uri, CSRF_QUERY_PARAM));

    match presented {
        Some(token) if verify_token(&ctx.session.record.csrf_key, &token) => Ok(()),
        Some(_) => {
            debug!(path = uri.path(), "csrf token failed verification");
            Err(AdmissionError::CsrfInvalid)
        }
        None => {
            debug!(path = uri.path(), "csrf token missing");
            Err(AdmissionError::CsrfInvalid)
        }
    }
}
