//! In-memory daily quota counters.
//!
//! The whole point of this store is the atomicity of `increment_and_get`:
//! the entry API holds the shard write lock across the reset check, the
//! increment, and the read, so concurrent callers for one key always observe
//! distinct, strictly increasing values.
//!
//! Expiry is lazy on access; `purge_expired` exists so a periodic sweep can
//! reclaim counters nobody asks about anymore (yesterday's keys).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use agora_core::errors::StoreError;
use agora_core::quota::QuotaKey;
use agora_core::traits::QuotaCounterStore;

#[derive(Debug, Clone, Copy)]
struct CounterCell {
    count: u64,
    expires_at: Instant,
}

/// In-memory [`QuotaCounterStore`] backed by [`DashMap`].
///
/// Keys are the full [`QuotaKey`] struct, so distinct users, actions, and
/// days can never collide regardless of what their string parts contain.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<QuotaKey, CounterCell>,
}

impl MemoryCounterStore {
    /// Creates an empty counter store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of counters currently held, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no counters at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drops every expired counter and returns how many were reclaimed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, cell| cell.expires_at > now);
        before.saturating_sub(self.counters.len())
    }
}

#[async_trait]
impl QuotaCounterStore for MemoryCounterStore {
    async fn increment_and_get(
        &self,
        key: &QuotaKey,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut cell = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| CounterCell {
                count: 0,
                expires_at: now + ttl,
            });
        if cell.expires_at <= now {
            cell.count = 0;
            cell.expires_at = now + ttl;
        }
        cell.count += 1;
        Ok(cell.count)
    }
}
