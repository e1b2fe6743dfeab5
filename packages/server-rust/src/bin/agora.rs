//! Agora server binary.
//!
//! Boots the admission pipeline over in-memory stores and serves the
//! forum's API v1 surface: topic and reply creation behind per-user daily
//! quotas, plus collect and message endpoints behind authentication. The
//! web-side routes (`/`, `/whoami`, `/signout`) exercise the CSRF guard.
//! Handlers are thin; the admission layer in front of them is the product.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use clap::Parser;
use http::StatusCode;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use agora_core::clock::SystemClock;
use agora_core::context::RequestContext;
use agora_core::policy::RoutePolicy;
use agora_core::traits::SessionStore;
use agora_core::types::{AuthVia, User, UserId};
use agora_server::admission::{
    AdmissionConfig, AdmissionState, RouteDecl, RouteTable, DEV_SESSION_SECRET,
};
use agora_server::network::{AppState, NetworkConfig, NetworkModule, ShutdownController};
use agora_server::store::{MemoryCounterStore, MemoryDirectory, MemorySessionStore};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Agora forum gateway.
#[derive(Parser, Debug)]
#[command(name = "agora", version, about, long_about = None)]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (0 picks an ephemeral port).
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Secret the session cookie MAC key derives from.
    #[arg(
        long,
        env = "AGORA_SESSION_SECRET",
        default_value = DEV_SESSION_SECRET,
        hide_env_values = true
    )]
    session_secret: String,

    /// Topics each user may create per day.
    #[arg(long, default_value_t = 1000)]
    create_topic_per_day: u32,

    /// Replies each user may post per day.
    #[arg(long, default_value_t = 2000)]
    create_reply_per_day: u32,

    /// Expose Prometheus metrics over HTTP on this port.
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Seed a demo account and print its API credential.
    #[arg(long)]
    seed_demo_user: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    if let Some(port) = args.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!("Prometheus exporter listening on {addr}");
    }

    let admission_config = AdmissionConfig {
        session_secret: args.session_secret,
        ..AdmissionConfig::default()
    };
    if admission_config.uses_dev_secret() {
        warn!("Running with the built-in development session secret; set AGORA_SESSION_SECRET");
    }

    let directory = Arc::new(MemoryDirectory::new());
    let sessions = Arc::new(MemorySessionStore::new(admission_config.session_ttl));
    let counters = Arc::new(MemoryCounterStore::new());

    if args.seed_demo_user {
        seed_demo_user(&directory);
    }

    let admission = AdmissionState::new(
        directory,
        sessions,
        // `.clone()` rather than `Arc::clone` so the concrete Arc can
        // unsize-coerce to the `Arc<dyn QuotaCounterStore>` parameter.
        counters.clone(),
        Arc::new(SystemClock),
        admission_config,
    );

    let routes = forum_routes(args.create_topic_per_day, args.create_reply_per_day);

    let network_config = NetworkConfig {
        host: args.host,
        port: args.port,
        ..NetworkConfig::default()
    };

    let mut module = NetworkModule::new(network_config, admission, routes);
    spawn_counter_janitor(counters, &module.shutdown_controller());

    let port = module.start().await?;
    info!("Agora serving on port {port}");

    module.serve(shutdown_signal()).await
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// Structured logging per `RUST_LOG`, defaulting to info.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Inserts a demo account and prints its API credential.
///
/// The credential goes to stdout, not the log stream: logs never carry
/// raw credentials.
fn seed_demo_user(directory: &MemoryDirectory) {
    let id = UserId::from("demo");
    directory.insert_user(User {
        id: id.clone(),
        display_name: "Demo User".to_owned(),
        blocked: false,
    });
    let credential = directory.issue_credential(&id);
    info!("Seeded demo account `demo`");
    println!("demo API credential: {credential}");
}

/// Hourly sweep that drops quota counters past their retention window.
fn spawn_counter_janitor(counters: Arc<MemoryCounterStore>, shutdown: &ShutdownController) {
    let mut shutdown_rx = shutdown.shutdown_receiver();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60 * 60));
        // The first tick completes immediately; consume it so the sweep
        // starts one interval from now.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = counters.purge_expired();
                    debug!(purged, "quota counter sweep");
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    });
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

// ---------------------------------------------------------------------------
// Route table
// ---------------------------------------------------------------------------

/// The forum's route table: the API v1 surface plus the web-side routes
/// that exercise the CSRF guard.
///
/// Everything under `/api/v1` opts out of CSRF handling; callers there
/// authenticate with API credentials, not cookies.
fn forum_routes(topics_per_day: u32, replies_per_day: u32) -> RouteTable {
    RouteTable::new()
        .route(RouteDecl::get("/", index, RoutePolicy::open()))
        .route(RouteDecl::get("/whoami", whoami, RoutePolicy::open()))
        .route(RouteDecl::post(
            "/signout",
            signout,
            RoutePolicy::authenticated(),
        ))
        .route(RouteDecl::get(
            "/api/v1/topics",
            list_topics,
            RoutePolicy::open().exempt_from_csrf(),
        ))
        .route(RouteDecl::post(
            "/api/v1/topics",
            create_topic,
            RoutePolicy::open()
                .with_quota("create_topic", topics_per_day)
                .exempt_from_csrf(),
        ))
        .route(RouteDecl::get(
            "/api/v1/topic/{id}",
            show_topic,
            RoutePolicy::open().exempt_from_csrf(),
        ))
        .route(RouteDecl::post(
            "/api/v1/topic/{topic_id}/replies",
            create_reply,
            RoutePolicy::open()
                .with_quota("create_reply", replies_per_day)
                .exempt_from_csrf(),
        ))
        .route(RouteDecl::post(
            "/api/v1/topic_collect/collect",
            collect_topic,
            RoutePolicy::authenticated().exempt_from_csrf(),
        ))
        .route(RouteDecl::post(
            "/api/v1/topic_collect/de_collect",
            de_collect_topic,
            RoutePolicy::authenticated().exempt_from_csrf(),
        ))
        .route(RouteDecl::get(
            "/api/v1/user/{loginname}",
            show_user,
            RoutePolicy::open().exempt_from_csrf(),
        ))
        .route(RouteDecl::post(
            "/api/v1/accesstoken",
            accesstoken_probe,
            RoutePolicy::authenticated().exempt_from_csrf(),
        ))
        .route(RouteDecl::get(
            "/api/v1/message/count",
            message_count,
            RoutePolicy::authenticated().exempt_from_csrf(),
        ))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WhoamiResponse {
    authenticated: bool,
    user: Option<String>,
    name: Option<String>,
    via: Option<&'static str>,
}

#[derive(Serialize)]
struct CreatedResponse {
    success: bool,
    id: String,
    quota_remaining: Option<u64>,
}

#[derive(Serialize)]
struct ReplyCreatedResponse {
    success: bool,
    id: String,
    topic_id: String,
    quota_remaining: Option<u64>,
}

#[derive(Serialize)]
struct AccessTokenResponse {
    success: bool,
    id: Option<String>,
    name: Option<String>,
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "name": "agora",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn whoami(Extension(ctx): Extension<RequestContext>) -> Json<WhoamiResponse> {
    Json(WhoamiResponse {
        authenticated: ctx.is_authenticated(),
        user: ctx.caller.as_ref().map(|u| u.id.to_string()),
        name: ctx.caller.as_ref().map(|u| u.display_name.clone()),
        via: ctx.auth_via.map(AuthVia::as_str),
    })
}

async fn signout(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    if let Err(err) = state.admission.sessions.destroy(&ctx.session.record.id).await {
        error!(?err, "session destroy failed during sign-out");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(json!({ "success": true })).into_response()
}

async fn list_topics() -> Json<serde_json::Value> {
    Json(json!({ "success": true, "topics": [] }))
}

async fn create_topic(Extension(ctx): Extension<RequestContext>) -> Json<CreatedResponse> {
    Json(CreatedResponse {
        success: true,
        id: Uuid::new_v4().simple().to_string(),
        quota_remaining: ctx.quota.as_ref().map(|q| q.remaining),
    })
}

async fn show_topic(Path(id): Path<String>) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "topic": { "id": id } }))
}

async fn create_reply(
    Path(topic_id): Path<String>,
    Extension(ctx): Extension<RequestContext>,
) -> Json<ReplyCreatedResponse> {
    Json(ReplyCreatedResponse {
        success: true,
        id: Uuid::new_v4().simple().to_string(),
        topic_id,
        quota_remaining: ctx.quota.as_ref().map(|q| q.remaining),
    })
}

async fn collect_topic() -> Json<serde_json::Value> {
    Json(json!({ "success": true }))
}

async fn de_collect_topic() -> Json<serde_json::Value> {
    Json(json!({ "success": true }))
}

async fn show_user(Path(loginname): Path<String>) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "user": { "loginname": loginname } }))
}

async fn accesstoken_probe(Extension(ctx): Extension<RequestContext>) -> Json<AccessTokenResponse> {
    Json(AccessTokenResponse {
        success: true,
        id: ctx.caller.as_ref().map(|u| u.id.to_string()),
        name: ctx.caller.as_ref().map(|u| u.display_name.clone()),
    })
}

async fn message_count() -> Json<serde_json::Value> {
    Json(json!({ "success": true, "data": 0 }))
}
