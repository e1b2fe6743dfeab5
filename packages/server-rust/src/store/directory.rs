//! In-memory identity directory.
//!
//! Three indexes: accounts by id, API credential digests to account ids, and
//! session ids to account ids. Credentials are stored as SHA-256 digests so
//! a directory dump never yields usable tokens.
//!
//! The [`IdentityStore`] impl is the read-only face the pipeline sees. The
//! inherent methods are the write surface the surrounding application uses:
//! registration inserts accounts, the login flow binds sessions after an
//! external identity claim is verified, and moderation toggles the blocked
//! flag.

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest as _, Sha256};
use uuid::Uuid;

use agora_core::errors::StoreError;
use agora_core::traits::IdentityStore;
use agora_core::types::{SessionId, User, UserId};

/// In-memory [`IdentityStore`] backed by [`DashMap`] indexes.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: DashMap<UserId, User>,
    credentials: DashMap<String, UserId>,
    sessions: DashMap<SessionId, UserId>,
}

impl MemoryDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an account, replacing any previous record with the same id.
    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    /// Issues a fresh API credential for `user` and returns the raw token.
    ///
    /// Only the digest is retained; the returned token is the one chance to
    /// hand it to the caller.
    #[must_use]
    pub fn issue_credential(&self, user: &UserId) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.credentials.insert(digest(&token), user.clone());
        token
    }

    /// Revokes a previously issued credential. Unknown tokens are a no-op.
    pub fn revoke_credential(&self, token: &str) {
        self.credentials.remove(&digest(token));
    }

    /// Binds a session to an account, as the login flow does after an
    /// external identity claim checks out.
    pub fn bind_session(&self, session: &SessionId, user: &UserId) {
        self.sessions.insert(session.clone(), user.clone());
    }

    /// Removes a session binding. Unknown sessions are a no-op.
    pub fn unbind_session(&self, session: &SessionId) {
        self.sessions.remove(session);
    }

    /// Sets the blocked flag on an account. Returns false when the account
    /// does not exist.
    pub fn set_blocked(&self, user: &UserId, blocked: bool) -> bool {
        match self.users.get_mut(user) {
            Some(mut entry) => {
                entry.blocked = blocked;
                true
            }
            None => false,
        }
    }

    /// Number of registered accounts.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[async_trait]
impl IdentityStore for MemoryDirectory {
    async fn lookup_by_session(
        &self,
        session: &SessionId,
    ) -> Result<Option<User>, StoreError> {
        let user_id = match self.sessions.get(session) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };
        Ok(self.users.get(&user_id).map(|entry| entry.value().clone()))
    }

    async fn lookup_by_credential(&self, credential: &str) -> Result<Option<User>, StoreError> {
        let user_id = match self.credentials.get(&digest(credential)) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };
        Ok(self.users.get(&user_id).map(|entry| entry.value().clone()))
    }
}
