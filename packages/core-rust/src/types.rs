use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a registered account.
///
/// The directory assigns these; the pipeline never inspects their shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Borrows the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque identifier of a server-side session.
///
/// Only the verified form travels in a cookie; an unverifiable cookie never
/// produces a `SessionId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Borrows the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A registered account as the identity directory reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Directory-assigned identifier.
    pub id: UserId,
    /// Human-readable name shown alongside the account.
    pub display_name: String,
    /// True when an administrator has banned the account. Blocked users are
    /// rejected on every route before any quota is consumed.
    pub blocked: bool,
}

/// How a resolved caller proved who they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthVia {
    /// Interactive session bound to a signed cookie.
    Session,
    /// Opaque API credential from a bearer header or query parameter.
    ApiCredential,
}

impl AuthVia {
    /// Short tag used in logs and metrics labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuthVia::Session => "session",
            AuthVia::ApiCredential => "api_credential",
        }
    }
}

/// A credential as presented on the wire, before resolution.
///
/// When a request carries both kinds, the session credential wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Session identifier recovered from a cookie whose signature verified.
    Session(SessionId),
    /// Opaque API token. Not yet checked against the directory.
    Api(String),
}

/// Server-side session state persisted between requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Identifier echoed (signed) in the session cookie.
    pub id: SessionId,
    /// Per-session key the CSRF guard derives tokens from.
    pub csrf_key: [u8; 32],
    /// When the session was first established.
    pub created_at: DateTime<Utc>,
    /// When the session lapses unless touched again.
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Whether the session has lapsed as of `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
