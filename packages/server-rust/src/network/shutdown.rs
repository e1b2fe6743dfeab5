//! Graceful shutdown with in-flight request accounting.
//!
//! The admission layer refuses new work once draining starts, so shutdown
//! is a two-step handshake: flip the health state, then wait until the
//! guards of already-admitted requests have all dropped. Health state lives
//! in an `ArcSwap` so the per-request read never takes a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle phase of the server.
///
/// Transitions run one way: Starting, Ready, Draining, Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Bound but not yet serving.
    Starting,
    /// Accepting and admitting requests.
    Ready,
    /// Refusing new requests while admitted ones finish.
    Draining,
    /// Fully drained.
    Stopped,
}

impl HealthState {
    /// Lowercase tag for health endpoints and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Ready => "ready",
            HealthState::Draining => "draining",
            HealthState::Stopped => "stopped",
        }
    }

    /// Whether the admission layer should let new requests in.
    #[must_use]
    pub fn is_accepting(self) -> bool {
        self == HealthState::Ready
    }
}

/// Coordinates the drain handshake between the serve loop, the admission
/// layer, and background tasks.
///
/// - the admission layer consults [`health_state`](Self::health_state) and
///   holds an [`InFlightGuard`] per admitted request
/// - background tasks subscribe via
///   [`shutdown_receiver`](Self::shutdown_receiver)
/// - the serve loop calls [`trigger_shutdown`](Self::trigger_shutdown) and
///   then [`wait_for_drain`](Self::wait_for_drain)
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    health: ArcSwap<HealthState>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            health: ArcSwap::from_pointee(HealthState::Starting),
        }
    }

    /// Marks the server ready to admit requests.
    pub fn set_ready(&self) {
        self.health.store(Arc::new(HealthState::Ready));
    }

    /// Subscription handle for tasks that should stop when draining starts.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Starts draining: new requests are refused from this point on, and
    /// every shutdown receiver is woken.
    pub fn trigger_shutdown(&self) {
        self.health.store(Arc::new(HealthState::Draining));
        // Receivers may all be gone already; that is fine.
        let _ = self.shutdown_signal.send(true);
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health.load()
    }

    /// Registers one in-flight request. Dropping the guard deregisters it,
    /// during unwinding included.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Number of requests currently holding a guard.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits until all guards are released, up to `timeout`.
    ///
    /// Returns `true` and transitions to `Stopped` on a clean drain;
    /// returns `false` leaving the state at `Draining` when the timeout
    /// lapses first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.health.store(Arc::new(HealthState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII registration of one in-flight request.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
