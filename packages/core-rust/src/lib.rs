//! Agora Core — identity, route policy, quota keys, and admission errors.
//!
//! Transport-free building blocks for the request-admission pipeline: the
//! types a request resolves into ([`RequestContext`]), the requirements a
//! route declares ([`RoutePolicy`]), the keys daily counters live under
//! ([`QuotaKey`]), and the trait seams the pipeline consults
//! ([`IdentityStore`], [`QuotaCounterStore`], [`SessionStore`]).

pub mod clock;
pub mod context;
pub mod errors;
pub mod policy;
pub mod quota;
pub mod traits;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use context::{RequestContext, SessionState};
pub use errors::{AdmissionError, StoreError};
pub use policy::{QuotaPolicy, RoutePolicy};
pub use quota::{QuotaDecision, QuotaKey, COUNTER_TTL};
pub use traits::{IdentityStore, QuotaCounterStore, SessionStore};
pub use types::{AuthVia, Credential, SessionId, SessionRecord, User, UserId};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
