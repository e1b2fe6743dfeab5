//! Request admission pipeline.
//!
//! Every application route passes through the same fixed stage order before
//! its handler runs:
//!
//! 1. identity resolution (always)
//! 2. blocked-account gate (always)
//! 3. authentication requirement (when declared, or implied by a quota)
//! 4. daily quota (when declared)
//! 5. CSRF verification (mutating methods outside the exempt namespace)
//!
//! Routes choose *which* optional stages apply via
//! [`RoutePolicy`](agora_core::policy::RoutePolicy) declarations; they
//! cannot reorder them. [`pipeline::compose`] turns a [`RouteTable`] into an
//! axum router where each route carries its own [`AdmissionLayer`] running
//! exactly the stages its policy calls for.

pub mod config;
pub mod csrf;
pub mod gate;
pub mod identity;
pub mod layer;
pub mod pipeline;
pub mod quota;

pub use config::{AdmissionConfig, DEV_SESSION_SECRET};
pub use layer::AdmissionLayer;
pub use pipeline::{compose, RouteDecl, RouteTable, Stage, StagePlan};

use std::sync::Arc;

use agora_core::clock::ClockSource;
use agora_core::traits::{IdentityStore, QuotaCounterStore, SessionStore};

use crate::session::CookieCodec;

/// Shared handles the pipeline stages consult.
///
/// Holds client handles to external stores and the clock; no per-request
/// state lives here, so one value serves every route and request.
#[derive(Clone)]
pub struct AdmissionState {
    /// Account directory, read-only from the pipeline's point of view.
    pub identity: Arc<dyn IdentityStore>,
    /// Session lifecycle store.
    pub sessions: Arc<dyn SessionStore>,
    /// Shared daily counters.
    pub counters: Arc<dyn QuotaCounterStore>,
    /// Calendar clock for quota day bucketing.
    pub clock: Arc<dyn ClockSource>,
    /// Pipeline tunables.
    pub config: Arc<AdmissionConfig>,
    /// Signed session cookie codec, derived from the config.
    pub cookies: Arc<CookieCodec>,
}

impl AdmissionState {
    /// Wires the pipeline to its collaborators.
    #[must_use]
    pub fn new(
        identity: Arc<dyn IdentityStore>,
        sessions: Arc<dyn SessionStore>,
        counters: Arc<dyn QuotaCounterStore>,
        clock: Arc<dyn ClockSource>,
        config: AdmissionConfig,
    ) -> Self {
        let cookies = Arc::new(CookieCodec::new(
            config.session_cookie.clone(),
            &config.session_secret,
            config.session_ttl,
            config.secure_cookies,
        ));
        Self {
            identity,
            sessions,
            counters,
            clock,
            config: Arc::new(config),
            cookies,
        }
    }
}

impl std::fmt::Debug for AdmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionState")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
