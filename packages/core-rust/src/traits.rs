use std::time::Duration;

use async_trait::async_trait;

use crate::errors::StoreError;
use crate::quota::QuotaKey;
use crate::types::{SessionId, SessionRecord, User};

/// Read-only directory of accounts and the credentials bound to them.
///
/// The pipeline only ever reads: binding a session to a user happens in the
/// login flow, outside admission. Implementations report outages as
/// [`StoreError`]; the resolver never maps an outage to "anonymous".
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Account bound to `session`, if any.
    async fn lookup_by_session(&self, session: &SessionId)
        -> Result<Option<User>, StoreError>;

    /// Account owning the opaque API `credential`, if any.
    async fn lookup_by_credential(&self, credential: &str)
        -> Result<Option<User>, StoreError>;
}

/// Shared counter store backing the daily limiter.
#[async_trait]
pub trait QuotaCounterStore: Send + Sync {
    /// Atomically increments the counter for `key` and returns its value
    /// after the increment.
    ///
    /// Absent and expired counters start from zero; the counter is (re)armed
    /// with `ttl` when that happens. Increment and read are one operation:
    /// two concurrent calls for the same key can never observe the same
    /// value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot complete the operation.
    /// Callers treat that as an outage, never as "counter unknown, allow".
    async fn increment_and_get(&self, key: &QuotaKey, ttl: Duration)
        -> Result<u64, StoreError>;
}

/// Session lifecycle: load, create, keep alive, destroy.
///
/// Sessions exist for anonymous visitors too, so a CSRF key is in place
/// before the first mutating request.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads a live session. Expired sessions are reported as absent.
    async fn load(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError>;

    /// Creates a session with a fresh id and CSRF key.
    async fn create(&self) -> Result<SessionRecord, StoreError>;

    /// Slides the expiry of an existing session forward. Unknown ids are a
    /// no-op, not an error: the session may have expired moments ago.
    async fn touch(&self, id: &SessionId) -> Result<(), StoreError>;

    /// Removes a session. Destroying an unknown id is a no-op.
    async fn destroy(&self, id: &SessionId) -> Result<(), StoreError>;
}
