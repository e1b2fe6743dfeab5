//! Admission pipeline configuration.

use std::time::Duration;

/// Tunables for identity resolution, sessions, and the CSRF guard.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Secret the session cookie MAC key is derived from. The default is
    /// for development only; deployments must override it.
    pub session_secret: String,
    /// Name of the session cookie.
    pub session_cookie: String,
    /// How long a session lives past its last request.
    pub session_ttl: Duration,
    /// Mark session cookies `Secure` (HTTPS-only deployments).
    pub secure_cookies: bool,
    /// Path namespace exempt from CSRF handling. A path is exempt when it
    /// starts with `{prefix}/`; the bare prefix itself is protected. Empty
    /// disables the exemption.
    pub csrf_exempt_prefix: String,
}

/// Development fallback for [`AdmissionConfig::session_secret`].
pub const DEV_SESSION_SECRET: &str = "agora-dev-secret";

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            session_secret: DEV_SESSION_SECRET.to_owned(),
            session_cookie: "agora_sid".to_owned(),
            session_ttl: Duration::from_secs(14 * 24 * 60 * 60),
            secure_cookies: false,
            csrf_exempt_prefix: "/api".to_owned(),
        }
    }
}

impl AdmissionConfig {
    /// Whether the deployment still runs on the built-in secret.
    #[must_use]
    pub fn uses_dev_secret(&self) -> bool {
        self.session_secret == DEV_SESSION_SECRET
    }
}
