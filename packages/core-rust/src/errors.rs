//! Error taxonomy for the admission pipeline.
//!
//! Two layers: [`StoreError`] is what an external collaborator (identity
//! directory, counter store, session store) reports; [`AdmissionError`] is
//! what a pipeline stage reports when it stops a request. The first four
//! admission variants are expected policy outcomes; `Infrastructure` is an
//! outage and always fails closed.

/// Failure reported by an external store collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached, or the call timed out.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered, but with data the caller cannot use.
    #[error("store internal error: {0}")]
    Internal(String),
}

/// Why an admission stage stopped a request short of its handler.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// The route requires a resolved identity and the caller has none.
    #[error("authentication required")]
    Unauthenticated,
    /// The caller resolved to a blocked account.
    #[error("account is blocked")]
    Forbidden,
    /// The caller exhausted today's allowance for an action.
    #[error("daily limit of {limit} reached for {action}")]
    QuotaExceeded {
        /// Action tag whose counter is exhausted.
        action: String,
        /// The route's configured daily ceiling.
        limit: u32,
    },
    /// A mutating request outside the exempt namespace carried no token
    /// matching the session.
    #[error("csrf token missing or invalid")]
    CsrfInvalid,
    /// A store the decision depends on failed. Never resolved optimistically.
    #[error("admission store failure")]
    Infrastructure(#[from] StoreError),
}

impl AdmissionError {
    /// Stable machine-readable code carried in rejection bodies.
    ///
    /// Clients distinguish same-status outcomes (blocked vs. CSRF, both 403)
    /// by this code, so values here are a compatibility surface.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::Unauthenticated => "unauthenticated",
            AdmissionError::Forbidden => "forbidden",
            AdmissionError::QuotaExceeded { .. } => "quota_exceeded",
            AdmissionError::CsrfInvalid => "csrf_invalid",
            AdmissionError::Infrastructure(_) => "internal",
        }
    }

    /// True for policy outcomes a healthy deployment produces routinely.
    /// False only for `Infrastructure`, which should page someone.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        !matches!(self, AdmissionError::Infrastructure(_))
    }
}
