//! Daily counter keys and limiter decisions.
//!
//! A counter belongs to one (caller, action, local calendar day) triple.
//! Day rollover is expressed entirely through the key: a new day means a new
//! key, and yesterday's counter simply stops being consulted. Counter TTLs
//! exist only so abandoned keys get reclaimed; they are deliberately longer
//! than a day so expiry can never race the date change.

use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::UserId;

/// How long a counter may outlive its calendar day before reclamation.
///
/// 36 hours: a full day plus margin for clock skew and DST shifts, so a
/// counter is always reclaimed by TTL strictly *after* its day has ended.
pub const COUNTER_TTL: Duration = Duration::from_secs(36 * 60 * 60);

/// Identity of one daily counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaKey {
    /// The caller the counter belongs to.
    pub user: UserId,
    /// Action tag from the route's quota policy.
    pub action: String,
    /// Local calendar day the counter covers.
    pub day: NaiveDate,
}

impl QuotaKey {
    /// Builds the key for `user` performing `action` on `day`.
    #[must_use]
    pub fn new(user: UserId, action: impl Into<String>, day: NaiveDate) -> Self {
        Self {
            user,
            action: action.into(),
            day,
        }
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "quota:{}:{}:{}",
            self.action,
            self.user,
            self.day.format("%Y%m%d")
        )
    }
}

/// What the limiter recorded for an admitted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDecision {
    /// Action tag the decision covers.
    pub action: String,
    /// The route's configured daily ceiling.
    pub limit: u32,
    /// Counter value after this request's increment.
    pub used: u64,
    /// Attempts left today, after this request.
    pub remaining: u64,
}

impl QuotaDecision {
    /// Builds the decision for a counter that read `used` against `limit`.
    #[must_use]
    pub fn new(action: impl Into<String>, limit: u32, used: u64) -> Self {
        Self {
            action: action.into(),
            limit,
            used,
            remaining: u64::from(limit).saturating_sub(used),
        }
    }
}
