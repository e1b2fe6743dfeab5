//! Network module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` creates resources,
//! `start()` binds the TCP listener, and `serve()` starts accepting
//! connections. This separation allows the rest of the application to
//! seed stores and spawn background tasks between `start()` and
//! `serve()`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::admission::{compose, AdmissionState, RouteTable};

use super::config::NetworkConfig;
use super::handlers::{health_handler, liveness_handler, readiness_handler, AppState};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;

/// Manages the full HTTP server lifecycle.
///
/// Follows the deferred startup pattern:
/// 1. `new()` -- takes the admission state and the declared route table
/// 2. `start()` -- binds TCP listener to the configured address
/// 3. `serve()` -- begins accepting connections until shutdown is signalled
///
/// The shutdown controller is shared via `Arc` so other parts of the
/// application (signal handlers, background tasks) can reference it
/// after construction.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    admission: AdmissionState,
    routes: RouteTable,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    ///
    /// The shutdown controller is allocated immediately so it can be
    /// shared with background tasks before the server starts.
    #[must_use]
    pub fn new(config: NetworkConfig, admission: AdmissionState, routes: RouteTable) -> Self {
        Self {
            config,
            listener: None,
            admission,
            routes,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Returns a shared reference to the shutdown controller.
    ///
    /// Other tasks use this to check health state or trigger shutdown.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the axum router: admission-guarded application routes
    /// from the route table, plus health endpoints that sit outside the
    /// pipeline.
    ///
    /// Built-in routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- Kubernetes liveness probe
    /// - `GET /health/ready` -- Kubernetes readiness probe
    pub fn build_router(&self) -> Router {
        let state = AppState {
            admission: self.admission.clone(),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            start_time: Instant::now(),
        };

        let (outer_layers, inner_layers) = build_http_layers(&self.config);

        // Inner half first: with `Router::layer`, the last layer added is
        // the outermost one.
        compose(self.routes.clone(), &self.admission, &self.shutdown)
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .layer(inner_layers)
            .layer(outer_layers)
            .with_state(state)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Starts serving connections until the shutdown signal fires.
    ///
    /// Consumes `self` because the listener is moved into the server.
    /// Panics if `start()` was not called first.
    ///
    /// After the shutdown signal:
    /// 1. Health state transitions to Draining, so the admission layer
    ///    rejects new requests on keep-alive connections with 503
    /// 2. Waits up to 30 seconds for in-flight requests to complete
    /// 3. Health state transitions to Stopped
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a fatal I/O error.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router();
        let listener = self
            .listener
            .expect("start() must be called before serve()");
        let shutdown_ctrl = self.shutdown;
        let config = self.config;

        // Transition to Ready so readiness probes pass and the admission
        // layer starts accepting requests.
        shutdown_ctrl.set_ready();

        // Relay the caller's shutdown future through the controller so the
        // health state flips to Draining the moment it fires, not only
        // after the server loop unwinds.
        let relay = Arc::clone(&shutdown_ctrl);
        let graceful = async move {
            shutdown.await;
            relay.trigger_shutdown();
        };

        if let Some(ref tls_config) = config.tls {
            serve_tls(listener, router, tls_config, graceful).await?;
        } else {
            serve_plain(listener, router, graceful).await?;
        }

        drain_in_flight(&shutdown_ctrl).await;
        Ok(())
    }
}

/// Serves plain HTTP connections using axum's built-in server.
async fn serve_plain(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("Serving plain HTTP connections");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Serves TLS connections using `axum-server` with rustls.
///
/// Reuses the pre-bound TCP listener by converting it to a `std::net::TcpListener`.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls_config: &super::config::TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls_config.cert_path, &tls_config.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    // Spawn a task that waits for the shutdown signal and triggers graceful
    // shutdown on the axum-server handle.
    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!("Serving TLS connections on {}", addr);

    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;

    Ok(())
}

/// Waits for in-flight requests to complete, then transitions to Stopped.
///
/// Gives stragglers up to 30 seconds before giving up.
async fn drain_in_flight(shutdown_ctrl: &ShutdownController) {
    shutdown_ctrl.trigger_shutdown();

    let in_flight = shutdown_ctrl.in_flight_count();
    if in_flight > 0 {
        info!("Draining {} in-flight requests", in_flight);
    }

    let drained = shutdown_ctrl.wait_for_drain(Duration::from_secs(30)).await;
    if drained {
        info!("All in-flight requests drained");
    } else {
        warn!("Drain timeout expired with in-flight requests remaining");
    }
}
