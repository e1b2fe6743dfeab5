//! Declarative per-route admission requirements.
//!
//! A route owns one [`RoutePolicy`]; the pipeline composer reads it once at
//! registration and fixes the stage list for that route. Policies say *what*
//! a route requires, never *in which order* checks run.

use serde::{Deserialize, Serialize};

/// Per-action daily ceiling enforced by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    /// Action tag the counter is keyed by, e.g. `create_topic`.
    pub action: String,
    /// Attempts allowed per caller per local calendar day.
    pub daily_limit: u32,
}

impl QuotaPolicy {
    /// Builds a quota policy for `action` with the given daily ceiling.
    #[must_use]
    pub fn new(action: impl Into<String>, daily_limit: u32) -> Self {
        Self {
            action: action.into(),
            daily_limit,
        }
    }
}

/// What a route demands from the admission pipeline.
///
/// The default policy admits everyone: no authentication requirement, no
/// quota, CSRF protection on (for mutating methods outside the exempt
/// namespace).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePolicy {
    /// Reject anonymous callers with 401 before the handler runs.
    pub requires_auth: bool,
    /// Daily quota each admitted request consumes, if any. Implies
    /// `requires_auth`: counters are keyed by user, so the composer refuses
    /// to run the limiter for anonymous callers.
    pub quota: Option<QuotaPolicy>,
    /// Skip CSRF issuance and verification for this route.
    pub csrf_exempt: bool,
}

impl RoutePolicy {
    /// Policy for a route anyone may call.
    #[must_use]
    pub fn open() -> Self {
        Self::default()
    }

    /// Policy for a route only resolved callers may reach.
    #[must_use]
    pub fn authenticated() -> Self {
        Self {
            requires_auth: true,
            ..Self::default()
        }
    }

    /// Adds a daily quota. Also turns on `requires_auth`.
    #[must_use]
    pub fn with_quota(mut self, action: impl Into<String>, daily_limit: u32) -> Self {
        self.quota = Some(QuotaPolicy::new(action, daily_limit));
        self.requires_auth = true;
        self
    }

    /// Opts the route out of CSRF handling entirely.
    #[must_use]
    pub fn exempt_from_csrf(mut self) -> Self {
        self.csrf_exempt = true;
        self
    }
}
