//! Identity resolution: who is calling?
//!
//! Two credential kinds, one precedence rule. A verified session cookie
//! beats an API credential when both are present, so a browser that also
//! holds a token behaves like the logged-in user it shows on screen.
//!
//! Failure handling is deliberately asymmetric:
//! - malformed or unknown credentials resolve to Anonymous (the gate stage
//!   decides whether that is acceptable for the route)
//! - a store failure is an infrastructure error; mapping it to Anonymous
//!   would silently demote logged-in users while the directory is down.
//!
//! Every request leaves this stage with a session. A missing, lapsed, or
//! forged cookie yields a fresh session whose cookie goes out on the
//! response, so the CSRF key is in place before the first mutating request.

use http::header::AUTHORIZATION;
use http::{HeaderMap, Uri};
use tracing::debug;

use agora_core::context::{RequestContext, SessionState};
use agora_core::errors::AdmissionError;
use agora_core::traits::{IdentityStore, SessionStore};
use agora_core::types::{AuthVia, Credential};

use super::AdmissionState;
use crate::session::CookieCodec;

/// Query parameter accepted as an API credential carrier, for clients that
/// cannot set headers.
pub const TOKEN_QUERY_PARAM: &str = "access_token";

/// Longest token shape we bother looking up.
const MAX_TOKEN_LEN: usize = 128;

/// Session credential presented by the request, if its cookie verifies.
pub(crate) fn session_credential(headers: &HeaderMap, cookies: &CookieCodec) -> Option<Credential> {
    cookies.extract(headers).map(Credential::Session)
}

/// API credential presented by the request: `Authorization: Bearer` wins
/// over the `access_token` query parameter. No validity check here.
pub(crate) fn api_credential(headers: &HeaderMap, uri: &Uri) -> Option<Credential> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    let token = match bearer {
        Some(token) => Some(token.to_owned()),
        None => query_param(uri, TOKEN_QUERY_PARAM),
    };
    token.map(Credential::Api)
}

/// First value of `name` in the query string, undecoded. Token and CSRF
/// carriers are URL-safe by construction, so no percent-decoding happens.
pub(crate) fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_owned())
}

/// A token worth a directory lookup: nonempty, bounded, URL-safe charset.
/// Anything else is malformed and resolves to Anonymous without a lookup.
fn plausible_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Resolves the caller for one request and establishes its session.
///
/// # Errors
///
/// Returns [`AdmissionError::Infrastructure`] when the session store or the
/// identity directory fails. Credential problems are not errors; they
/// resolve to an anonymous context.
pub async fn resolve(
    state: &AdmissionState,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<RequestContext, AdmissionError> {
    let session = ensure_session(state, headers).await?;

    // Freshly created sessions cannot be bound to anyone yet; skipping the
    // lookup keeps cookie-less visitors admissible during a directory
    // outage.
    if !session.fresh {
        if let Some(user) = state.identity.lookup_by_session(&session.record.id).await? {
            debug!(user = %user.id, via = AuthVia::Session.as_str(), "caller resolved");
            return Ok(RequestContext::authenticated(session, user, AuthVia::Session));
        }
    }

    if let Some(Credential::Api(token)) = api_credential(headers, uri) {
        if plausible_token(&token) {
            if let Some(user) = state.identity.lookup_by_credential(&token).await? {
                debug!(
                    user = %user.id,
                    via = AuthVia::ApiCredential.as_str(),
                    "caller resolved"
                );
                return Ok(RequestContext::authenticated(
                    session,
                    user,
                    AuthVia::ApiCredential,
                ));
            }
        } else {
            debug!("malformed api credential ignored");
        }
    }

    Ok(RequestContext::anonymous(session))
}

/// Loads the session named by a verified cookie, or creates a fresh one.
/// Pre-existing sessions get their expiry window slid forward.
async fn ensure_session(
    state: &AdmissionState,
    headers: &HeaderMap,
) -> Result<SessionState, AdmissionError> {
    if let Some(Credential::Session(sid)) = session_credential(headers, &state.cookies) {
        if let Some(record) = state.sessions.load(&sid).await? {
            state.sessions.touch(&record.id).await?;
            return Ok(SessionState::existing(record));
        }
    }
    let record = state.sessions.create().await?;
    Ok(SessionState::fresh(record))
}
