//! Daily quota stage.
//!
//! One counter per (user, action, local calendar day), bumped with a single
//! atomic increment-and-read. The increment happens before the limit check,
//! so rejected attempts count too: hammering a full quota never becomes
//! free retries. Counters reset implicitly when the local date changes, and
//! their store TTL outlives the day they bucket.

use tracing::debug;

use agora_core::clock::ClockSource;
use agora_core::context::RequestContext;
use agora_core::errors::AdmissionError;
use agora_core::policy::QuotaPolicy;
use agora_core::quota::{QuotaDecision, QuotaKey, COUNTER_TTL};
use agora_core::traits::QuotaCounterStore;

use super::AdmissionState;

/// Consumes one unit of the caller's daily quota for `policy.action`.
///
/// On admission the decision (limit, used, remaining) is recorded on the
/// context for handlers and response headers. Over-limit attempts still
/// increment the counter before being rejected.
///
/// # Errors
///
/// - [`AdmissionError::Unauthenticated`] when no caller was resolved; a
///   quota route is an authenticated route by definition.
/// - [`AdmissionError::QuotaExceeded`] once the day's allowance is spent.
/// - [`AdmissionError::Infrastructure`] when the counter store fails. An
///   unreachable store never admits the request.
pub async fn consume(
    state: &AdmissionState,
    ctx: &mut RequestContext,
    policy: &QuotaPolicy,
) -> Result<(), AdmissionError> {
    let Some(user) = ctx.user_id() else {
        return Err(AdmissionError::Unauthenticated);
    };

    let key = QuotaKey::new(user.clone(), policy.action.clone(), state.clock.today());
    let used = state.counters.increment_and_get(&key, COUNTER_TTL).await?;

    if used > u64::from(policy.daily_limit) {
        debug!(%key, used, limit = policy.daily_limit, "daily quota exhausted");
        return Err(AdmissionError::QuotaExceeded {
            action: policy.action.clone(),
            limit: policy.daily_limit,
        });
    }

    ctx.quota = Some(QuotaDecision::new(
        policy.action.clone(),
        policy.daily_limit,
        used,
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Local, Utc};

    use agora_core::clock::{ClockSource, ManualClock};
    use agora_core::context::SessionState;
    use agora_core::errors::StoreError;
    use agora_core::traits::QuotaCounterStore;
    use agora_core::types::{AuthVia, SessionId, SessionRecord, User, UserId};

    use super::*;
    use crate::admission::AdmissionConfig;
    use crate::store::{MemoryCounterStore, MemoryDirectory, MemorySessionStore};

    /// Counter store that fails every increment, as a partitioned backend
    /// would.
    struct FailingCounterStore;

    #[async_trait]
    impl QuotaCounterStore for FailingCounterStore {
        async fn increment_and_get(
            &self,
            _key: &QuotaKey,
            _ttl: Duration,
        ) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("counter store down".to_owned()))
        }
    }

    fn state_with(
        counters: Arc<dyn QuotaCounterStore>,
        clock: Arc<dyn ClockSource>,
    ) -> AdmissionState {
        AdmissionState::new(
            Arc::new(MemoryDirectory::new()),
            Arc::new(MemorySessionStore::new(Duration::from_secs(60))),
            counters,
            clock,
            AdmissionConfig::default(),
        )
    }

    fn fresh_state() -> AdmissionState {
        state_with(
            Arc::new(MemoryCounterStore::new()),
            Arc::new(ManualClock::new(Local::now())),
        )
    }

    fn ctx_for(user: &str) -> RequestContext {
        let now = Utc::now();
        let session = SessionState::existing(SessionRecord {
            id: SessionId::from("s-1"),
            csrf_key: [0u8; 32],
            created_at: now,
            expires_at: now + ChronoDuration::hours(1),
        });
        RequestContext::authenticated(
            session,
            User {
                id: UserId::from(user),
                display_name: user.to_owned(),
                blocked: false,
            },
            AuthVia::Session,
        )
    }

    fn policy(limit: u32) -> QuotaPolicy {
        QuotaPolicy::new("create_topic", limit)
    }

    #[tokio::test]
    async fn admits_up_to_the_limit_then_rejects() {
        let state = fresh_state();
        let mut ctx = ctx_for("u-1");

        for _ in 0..3 {
            consume(&state, &mut ctx, &policy(3)).await.unwrap();
        }
        let err = consume(&state, &mut ctx, &policy(3)).await.unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::QuotaExceeded { limit: 3, .. }
        ));
    }

    #[tokio::test]
    async fn decision_reports_used_and_remaining() {
        let state = fresh_state();
        let mut ctx = ctx_for("u-1");

        consume(&state, &mut ctx, &policy(5)).await.unwrap();
        consume(&state, &mut ctx, &policy(5)).await.unwrap();

        let decision = ctx.quota.as_ref().unwrap();
        assert_eq!(decision.used, 2);
        assert_eq!(decision.remaining, 3);
        assert_eq!(decision.limit, 5);
    }

    #[tokio::test]
    async fn rejected_attempts_keep_counting() {
        let counters = Arc::new(MemoryCounterStore::new());
        let clock = Arc::new(ManualClock::new(Local::now()));
        let state = state_with(counters.clone(), clock.clone());
        let mut ctx = ctx_for("u-1");

        consume(&state, &mut ctx, &policy(1)).await.unwrap();
        for _ in 0..4 {
            consume(&state, &mut ctx, &policy(1)).await.unwrap_err();
        }

        let key = QuotaKey::new(UserId::from("u-1"), "create_topic".to_owned(), clock.today());
        let used = counters.increment_and_get(&key, COUNTER_TTL).await.unwrap();
        assert_eq!(used, 6, "five consume calls plus this probe");
    }

    #[tokio::test]
    async fn quota_resets_on_day_rollover() {
        let clock = Arc::new(ManualClock::new(Local::now()));
        let state = state_with(Arc::new(MemoryCounterStore::new()), clock.clone());
        let mut ctx = ctx_for("u-1");

        consume(&state, &mut ctx, &policy(1)).await.unwrap();
        consume(&state, &mut ctx, &policy(1)).await.unwrap_err();

        clock.advance_days(1);
        consume(&state, &mut ctx, &policy(1)).await.unwrap();
        assert_eq!(ctx.quota.as_ref().unwrap().used, 1);
    }

    #[tokio::test]
    async fn actions_and_users_count_separately() {
        let state = fresh_state();
        let mut first = ctx_for("u-1");
        let mut second = ctx_for("u-2");

        consume(&state, &mut first, &policy(1)).await.unwrap();
        consume(&state, &mut first, &QuotaPolicy::new("create_reply", 1))
            .await
            .unwrap();
        consume(&state, &mut second, &policy(1)).await.unwrap();

        // Each of the three keys has seen exactly one admit.
        consume(&state, &mut first, &policy(1)).await.unwrap_err();
    }

    #[tokio::test]
    async fn anonymous_context_is_rejected_before_counting() {
        let counters = Arc::new(MemoryCounterStore::new());
        let state = state_with(counters.clone(), Arc::new(ManualClock::new(Local::now())));
        let now = Utc::now();
        let mut ctx = RequestContext::anonymous(SessionState::fresh(SessionRecord {
            id: SessionId::from("s-0"),
            csrf_key: [0u8; 32],
            created_at: now,
            expires_at: now + ChronoDuration::hours(1),
        }));

        let err = consume(&state, &mut ctx, &policy(1)).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Unauthenticated));
        assert!(counters.is_empty(), "no counter consumed for anonymous");
    }

    #[tokio::test]
    async fn counter_outage_never_admits() {
        let state = state_with(
            Arc::new(FailingCounterStore),
            Arc::new(ManualClock::new(Local::now())),
        );
        let mut ctx = ctx_for("u-1");

        let err = consume(&state, &mut ctx, &policy(1)).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Infrastructure(_)));
        assert!(ctx.quota.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_burst_admits_exactly_the_limit() {
        let limit = 16u32;
        let state = fresh_state();

        let mut tasks = Vec::new();
        for _ in 0..limit + 5 {
            let state = state.clone();
            tasks.push(tokio::spawn(async move {
                let mut ctx = ctx_for("u-1");
                consume(&state, &mut ctx, &policy(limit)).await.is_ok()
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, limit, "burst admits exactly the daily limit");
    }
}
