//! HTTP handler definitions for the Agora server.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports the built-in handler functions used when
//! building the router.

pub mod health;

pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use crate::admission::AdmissionState;

use super::{NetworkConfig, ShutdownController};

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Stores and configuration the admission pipeline runs against.
    /// Handlers use it for session lifecycle work such as sign-out.
    pub admission: AdmissionState,
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Network configuration (bind address, TLS, timeouts, body limits).
    pub config: Arc<NetworkConfig>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
