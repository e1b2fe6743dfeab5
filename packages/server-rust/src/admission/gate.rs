//! Access gate: blocked-account rejection and authentication requirement.
//!
//! The blocked check runs on every route, authenticated or not, and always
//! before the quota stage. A blocked account must never consume quota or
//! reach a handler, even on routes that welcome anonymous callers.

use tracing::debug;

use agora_core::context::RequestContext;
use agora_core::errors::AdmissionError;

/// Rejects the request when it resolved to a blocked account.
///
/// Anonymous requests pass; there is no account to be blocked.
///
/// # Errors
///
/// Returns [`AdmissionError::Forbidden`] for a blocked caller.
pub fn reject_blocked(ctx: &RequestContext) -> Result<(), AdmissionError> {
    if let Some(user) = &ctx.caller {
        if user.blocked {
            debug!(user = %user.id, "blocked account rejected");
            return Err(AdmissionError::Forbidden);
        }
    }
    Ok(())
}

/// Rejects the request when no account was resolved.
///
/// # Errors
///
/// Returns [`AdmissionError::Unauthenticated`] for anonymous callers.
pub fn require_auth(ctx: &RequestContext) -> Result<(), AdmissionError> {
    if ctx.is_authenticated() {
        Ok(())
    } else {
        Err(AdmissionError::Unauthenticated)
    }
}
