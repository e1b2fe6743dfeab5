use crate::quota::QuotaDecision;
use crate::types::{AuthVia, SessionRecord, User, UserId};

/// Session attached to the current request.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// The live session record, loaded or newly created.
    pub record: SessionRecord,
    /// True when the record was created for this very request. Fresh
    /// sessions cannot be bound to a user yet and still need their cookie
    /// sent back.
    pub fresh: bool,
}

impl SessionState {
    /// Wraps a record loaded from the session store.
    #[must_use]
    pub fn existing(record: SessionRecord) -> Self {
        Self {
            record,
            fresh: false,
        }
    }

    /// Wraps a record created for this request.
    #[must_use]
    pub fn fresh(record: SessionRecord) -> Self {
        Self {
            record,
            fresh: true,
        }
    }
}

/// Per-request context assembled by the admission pipeline and handed to
/// handlers. Built once per request, never shared across requests.
///
/// `caller` and `auth_via` are set together or not at all; the constructors
/// are the only way to establish that pairing.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Session for this request. Always present: anonymous visitors get a
    /// fresh session so a CSRF key exists before their first mutating
    /// request.
    pub session: SessionState,
    /// Resolved account, if the request authenticated.
    pub caller: Option<User>,
    /// How the caller authenticated, if they did.
    pub auth_via: Option<AuthVia>,
    /// CSRF token minted for this request on non-exempt routes.
    pub csrf_token: Option<String>,
    /// Limiter decision, recorded when the route carries a quota and the
    /// request was admitted.
    pub quota: Option<QuotaDecision>,
}

impl RequestContext {
    /// Context for a request that resolved to no account.
    #[must_use]
    pub fn anonymous(session: SessionState) -> Self {
        Self {
            session,
            caller: None,
            auth_via: None,
            csrf_token: None,
            quota: None,
        }
    }

    /// Context for a request that resolved to `caller` via `auth_via`.
    #[must_use]
    pub fn authenticated(session: SessionState, caller: User, auth_via: AuthVia) -> Self {
        Self {
            session,
            caller: Some(caller),
            auth_via: Some(auth_via),
            csrf_token: None,
            quota: None,
        }
    }

    /// Whether an account was resolved for this request.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.caller.is_some()
    }

    /// The resolved caller's id, if any.
    #[must_use]
    pub fn user_id(&self) -> Option<&UserId> {
        self.caller.as_ref().map(|user| &user.id)
    }
}
