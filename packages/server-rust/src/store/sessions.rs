//! In-memory session store with a sliding expiry window.
//!
//! Expiry is lazy: a lapsed record is dropped the next time `load` sees it.
//! Every admitted request that carries the session slides its window forward
//! via `touch`, so only abandoned sessions ever lapse.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore as _;
use uuid::Uuid;

use agora_core::errors::StoreError;
use agora_core::traits::SessionStore;
use agora_core::types::{SessionId, SessionRecord};

/// In-memory [`SessionStore`] backed by [`DashMap`].
#[derive(Debug)]
pub struct MemorySessionStore {
    sessions: DashMap<SessionId, SessionRecord>,
    ttl: chrono::Duration,
}

impl MemorySessionStore {
    /// Creates an empty store whose sessions live `ttl` past their last
    /// touch.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            // from_std only fails for durations beyond representable range;
            // clamp those to two weeks rather than carrying a Result around.
            ttl: chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::days(14)),
        }
    }

    /// Number of sessions currently held, lapsed ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store holds no sessions at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.ttl
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let now = Utc::now();
        // The get() guard must drop before remove() touches the same shard.
        let expired = match self.sessions.get(id) {
            Some(entry) => {
                if entry.value().is_expired(now) {
                    true
                } else {
                    return Ok(Some(entry.value().clone()));
                }
            }
            None => return Ok(None),
        };
        if expired {
            self.sessions.remove(id);
        }
        Ok(None)
    }

    async fn create(&self) -> Result<SessionRecord, StoreError> {
        let now = Utc::now();
        let mut csrf_key = [0u8; 32];
        rand::rng().fill_bytes(&mut csrf_key);

        let record = SessionRecord {
            id: SessionId::from(Uuid::new_v4().simple().to_string()),
            csrf_key,
            created_at: now,
            expires_at: self.expiry_from(now),
        };
        self.sessions.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn touch(&self, id: &SessionId) -> Result<(), StoreError> {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.expires_at = self.expiry_from(Utc::now());
        }
        Ok(())
    }

    async fn destroy(&self, id: &SessionId) -> Result<(), StoreError> {
        self.sessions.remove(id);
        Ok(())
    }
}
