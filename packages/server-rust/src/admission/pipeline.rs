//! Stage planning and route composition.
//!
//! Routes declare *what* they require ([`RoutePolicy`]); the composer fixes
//! *when* checks run. [`stage_plan`] translates one policy into the ordered
//! stage list for a route, computed once at registration, and [`compose`]
//! wraps every declared route in an [`AdmissionLayer`] carrying that plan.
//! Per-request work never rebuilds or reorders a plan.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::handler::Handler;
use axum::routing::{self, MethodRouter};
use axum::Router;
use http::Method;

use agora_core::policy::{QuotaPolicy, RoutePolicy};

use super::csrf;
use super::layer::AdmissionLayer;
use super::AdmissionState;
use crate::network::{AppState, ShutdownController};

// ---------------------------------------------------------------------------
// Stage plans
// ---------------------------------------------------------------------------

/// One checkpoint of the admission pipeline.
///
/// Identity resolution is not listed: it runs unconditionally before any
/// stage, because every stage reads the context it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// Reject resolved callers whose account is blocked. Always present.
    RejectBlocked,
    /// Reject anonymous callers.
    RequireAuth,
    /// Consume one unit of the caller's daily allowance for an action.
    ConsumeQuota(QuotaPolicy),
    /// Check the double-submit CSRF token. Always the last stage.
    VerifyCsrf,
}

/// The fixed, ordered stage list for one (route, method) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    /// Stages in execution order.
    pub stages: Vec<Stage>,
    /// Whether responses on this route carry a freshly minted CSRF token.
    /// Independent of [`Stage::VerifyCsrf`]: safe methods issue without
    /// verifying, so the token is in hand before the first mutating call.
    pub issues_csrf: bool,
}

/// Fixes the stage list for `policy` on a route served with `method`.
///
/// Policies choose inclusion only. The order is decided here and is the
/// same for every route: blocked gate, authentication, quota, CSRF. A
/// declared quota forces the authentication stage even when the policy
/// forgot to ask for it, since counters are keyed by user.
#[must_use]
pub fn stage_plan(policy: &RoutePolicy, method: &Method) -> StagePlan {
    let mut stages = vec![Stage::RejectBlocked];
    if policy.requires_auth || policy.quota.is_some() {
        stages.push(Stage::RequireAuth);
    }
    if let Some(quota) = &policy.quota {
        stages.push(Stage::ConsumeQuota(quota.clone()));
    }
    if !policy.csrf_exempt && csrf::enforces(method) {
        stages.push(Stage::VerifyCsrf);
    }
    StagePlan {
        stages,
        issues_csrf: !policy.csrf_exempt,
    }
}

// ---------------------------------------------------------------------------
// Route declarations
// ---------------------------------------------------------------------------

/// One route: method, path, admission policy, and handler.
#[derive(Clone)]
pub struct RouteDecl {
    /// HTTP method the declaration covers.
    pub method: Method,
    /// Path in axum syntax, e.g. `/api/v1/topic/{id}`.
    pub path: String,
    /// Admission requirements for this route.
    pub policy: RoutePolicy,
    handler: MethodRouter<AppState>,
}

impl RouteDecl {
    /// Declares a GET route.
    pub fn get<H, T>(path: impl Into<String>, handler: H, policy: RoutePolicy) -> Self
    where
        H: Handler<T, AppState>,
        T: 'static,
    {
        Self {
            method: Method::GET,
            path: path.into(),
            policy,
            handler: routing::get(handler),
        }
    }

    /// Declares a POST route.
    pub fn post<H, T>(path: impl Into<String>, handler: H, policy: RoutePolicy) -> Self
    where
        H: Handler<T, AppState>,
        T: 'static,
    {
        Self {
            method: Method::POST,
            path: path.into(),
            policy,
            handler: routing::post(handler),
        }
    }
}

impl std::fmt::Debug for RouteDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteDecl")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Ordered collection of route declarations for one server.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<RouteDecl>,
}

impl RouteTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one declaration.
    #[must_use]
    pub fn route(mut self, decl: RouteDecl) -> Self {
        self.routes.push(decl);
        self
    }

    /// Declared routes, in declaration order.
    #[must_use]
    pub fn routes(&self) -> &[RouteDecl] {
        &self.routes
    }

    /// Number of declarations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table has no declarations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// Builds the application router from a route table.
///
/// Each declaration gets its own [`AdmissionLayer`] carrying the plan for
/// its (policy, method) pair, so two methods on one path can differ in
/// policy while sharing the path match.
///
/// # Panics
///
/// Panics if two declarations share a path and method; the conflict is a
/// startup bug, not a runtime condition.
#[must_use]
pub fn compose(
    table: RouteTable,
    admission: &AdmissionState,
    shutdown: &Arc<ShutdownController>,
) -> Router<AppState> {
    let mut by_path: BTreeMap<String, MethodRouter<AppState>> = BTreeMap::new();

    for decl in table.routes {
        let plan = stage_plan(&decl.policy, &decl.method);
        let layer = AdmissionLayer::new(admission.clone(), shutdown.clone(), plan);
        let guarded = decl.handler.layer(layer);
        let combined = match by_path.remove(&decl.path) {
            Some(existing) => existing.merge(guarded),
            None => guarded,
        };
        by_path.insert(decl.path, combined);
    }

    let mut router = Router::new();
    for (path, methods) in by_path {
        router = router.route(&path, methods);
    }
    router
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::response::Response;
    use axum::Extension;
    use http::header::{COOKIE, SET_COOKIE};
    use http::{Request, StatusCode};
    use tower::ServiceExt;

    use agora_core::clock::SystemClock;
    use agora_core::context::RequestContext;
    use agora_core::errors::StoreError;
    use agora_core::traits::{IdentityStore, SessionStore};
    use agora_core::types::{SessionId, User, UserId};

    use super::*;
    use crate::admission::csrf::CSRF_HEADER;
    use crate::admission::AdmissionConfig;
    use crate::network::NetworkConfig;
    use crate::store::{MemoryCounterStore, MemoryDirectory, MemorySessionStore};

    // -- plan unit tests ----------------------------------------------------

    #[test]
    fn blocked_gate_is_in_every_plan() {
        let plan = stage_plan(&RoutePolicy::open(), &Method::GET);
        assert_eq!(plan.stages, vec![Stage::RejectBlocked]);
        assert!(plan.issues_csrf);
    }

    #[test]
    fn stages_follow_the_canonical_order() {
        let policy = RoutePolicy::authenticated().with_quota("create_topic", 5);
        let plan = stage_plan(&policy, &Method::POST);
        assert_eq!(
            plan.stages,
            vec![
                Stage::RejectBlocked,
                Stage::RequireAuth,
                Stage::ConsumeQuota(QuotaPolicy::new("create_topic", 5)),
                Stage::VerifyCsrf,
            ]
        );
    }

    #[test]
    fn a_quota_forces_the_auth_stage() {
        // Hand-built policy that skipped the builder normalization.
        let policy = RoutePolicy {
            requires_auth: false,
            quota: Some(QuotaPolicy::new("create_reply", 3)),
            csrf_exempt: false,
        };
        let plan = stage_plan(&policy, &Method::POST);
        let auth = plan
            .stages
            .iter()
            .position(|s| *s == Stage::RequireAuth)
            .unwrap();
        let quota = plan
            .stages
            .iter()
            .position(|s| matches!(s, Stage::ConsumeQuota(_)))
            .unwrap();
        assert!(auth < quota, "auth resolves before the limiter runs");
    }

    #[test]
    fn safe_methods_issue_but_never_verify_csrf() {
        let plan = stage_plan(&RoutePolicy::authenticated(), &Method::GET);
        assert!(!plan.stages.contains(&Stage::VerifyCsrf));
        assert!(plan.issues_csrf);
    }

    #[test]
    fn route_exemption_disables_csrf_entirely() {
        let policy = RoutePolicy::open().exempt_from_csrf();
        let plan = stage_plan(&policy, &Method::POST);
        assert!(!plan.stages.contains(&Stage::VerifyCsrf));
        assert!(!plan.issues_csrf);
    }

    // -- composed router tests ----------------------------------------------

    async fn ok() -> &'static str {
        "ok"
    }

    async fn whoami(Extension(ctx): Extension<RequestContext>) -> String {
        ctx.user_id()
            .map_or_else(|| "anonymous".to_owned(), |id| id.as_str().to_owned())
    }

    fn forum_table() -> RouteTable {
        RouteTable::new()
            .route(RouteDecl::get("/open", ok, RoutePolicy::open()))
            .route(RouteDecl::get("/whoami", whoami, RoutePolicy::open()))
            .route(RouteDecl::get("/private", ok, RoutePolicy::authenticated()))
            .route(RouteDecl::post("/form", ok, RoutePolicy::open()))
            .route(RouteDecl::post(
                "/guarded",
                ok,
                RoutePolicy::open().with_quota("create_topic", 2),
            ))
            .route(RouteDecl::get(
                "/api/v1/topics",
                ok,
                RoutePolicy::open().exempt_from_csrf(),
            ))
            .route(RouteDecl::post(
                "/api/v1/topics",
                ok,
                RoutePolicy::open()
                    .with_quota("create_topic", 2)
                    .exempt_from_csrf(),
            ))
    }

    struct TestBed {
        app: Router,
        admission: AdmissionState,
        directory: Arc<MemoryDirectory>,
        counters: Arc<MemoryCounterStore>,
        shutdown: Arc<ShutdownController>,
    }

    fn testbed(table: RouteTable) -> TestBed {
        let directory = Arc::new(MemoryDirectory::new());
        let counters = Arc::new(MemoryCounterStore::new());
        let admission = AdmissionState::new(
            directory.clone(),
            Arc::new(MemorySessionStore::new(Duration::from_secs(3600))),
            counters.clone(),
            Arc::new(SystemClock),
            AdmissionConfig::default(),
        );
        let shutdown = Arc::new(ShutdownController::new());
        shutdown.set_ready();
        let app = compose(table, &admission, &shutdown).with_state(AppState {
            admission: admission.clone(),
            shutdown: shutdown.clone(),
            config: Arc::new(NetworkConfig::default()),
            start_time: Instant::now(),
        });
        TestBed {
            app,
            admission,
            directory,
            counters,
            shutdown,
        }
    }

    fn seeded(bed: &TestBed, id: &str, blocked: bool) {
        bed.directory.insert_user(User {
            id: UserId::from(id),
            display_name: id.to_owned(),
            blocked,
        });
    }

    async fn send(bed: &TestBed, req: Request<Body>) -> Response {
        bed.app.clone().oneshot(req).await.unwrap()
    }

    async fn get(bed: &TestBed, uri: &str) -> Response {
        send(bed, Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Session cookie for a session bound to `user`, as a `Cookie` value.
    async fn login_cookie(bed: &TestBed, user: &str) -> String {
        let record = bed.admission.sessions.create().await.unwrap();
        bed.directory.bind_session(&record.id, &UserId::from(user));
        cookie_pair(bed, &record.id)
    }

    fn cookie_pair(bed: &TestBed, sid: &SessionId) -> String {
        format!(
            "{}={}",
            bed.admission.config.session_cookie,
            bed.admission.cookies.encode(sid)
        )
    }

    /// The session cookie a response set, ready to send back.
    fn returned_cookie(resp: &Response) -> String {
        resp.headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .unwrap()
            .to_owned()
    }

    #[tokio::test]
    async fn open_routes_admit_anonymous_callers() {
        let bed = testbed(forum_table());
        let resp = get(&bed, "/open").await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers().contains_key(SET_COOKIE),
            "first contact establishes a session"
        );
        assert!(
            resp.headers().contains_key(CSRF_HEADER),
            "non-exempt responses carry a token"
        );
    }

    #[tokio::test]
    async fn auth_required_routes_reject_anonymous_with_401() {
        let bed = testbed(forum_table());
        let resp = get(&bed, "/private").await;

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(resp).await;
        assert_eq!(body["error"], "unauthenticated");
    }

    #[tokio::test]
    async fn blocked_accounts_are_rejected_even_on_open_routes() {
        let bed = testbed(forum_table());
        seeded(&bed, "u-banned", true);
        let cookie = login_cookie(&bed, "u-banned").await;

        let req = Request::get("/open")
            .header(COOKIE, cookie)
            .body(Body::empty())
            .unwrap();
        let resp = send(&bed, req).await;

        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(resp).await["error"], "forbidden");
    }

    #[tokio::test]
    async fn blocked_accounts_never_reach_the_limiter() {
        let bed = testbed(forum_table());
        seeded(&bed, "u-banned", true);
        let token = bed.directory.issue_credential(&UserId::from("u-banned"));

        let req = Request::post("/api/v1/topics")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let resp = send(&bed, req).await;

        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(bed.counters.is_empty(), "no quota consumed by a blocked caller");
    }

    #[tokio::test]
    async fn quota_routes_admit_then_reject_with_429() {
        let bed = testbed(forum_table());
        seeded(&bed, "u-1", false);
        let token = bed.directory.issue_credential(&UserId::from("u-1"));

        fn topic_post(token: &str) -> Request<Body> {
            Request::post("/api/v1/topics")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap()
        }

        let first = send(&bed, topic_post(&token)).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-quota-limit"], "2");
        assert_eq!(first.headers()["x-quota-remaining"], "1");

        let second = send(&bed, topic_post(&token)).await;
        assert_eq!(second.headers()["x-quota-remaining"], "0");

        let third = send(&bed, topic_post(&token)).await;
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = json_body(third).await;
        assert_eq!(body["error"], "quota_exceeded");
        assert_eq!(body["action"], "create_topic");
        assert_eq!(body["limit"], 2);
    }

    #[tokio::test]
    async fn csrf_protected_form_round_trip() {
        let bed = testbed(forum_table());

        // First contact: collect the session cookie and its token.
        let bootstrap = get(&bed, "/open").await;
        let cookie = returned_cookie(&bootstrap);
        let token = bootstrap.headers()[CSRF_HEADER].to_str().unwrap().to_owned();

        let accepted = send(
            &bed,
            Request::post("/form")
                .header(COOKIE, &cookie)
                .header(CSRF_HEADER, &token)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(accepted.status(), StatusCode::OK);

        // Same cookie, no token.
        let rejected = send(
            &bed,
            Request::post("/form")
                .header(COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(rejected.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(rejected).await["error"], "csrf_invalid");
    }

    #[tokio::test]
    async fn csrf_token_does_not_transfer_between_sessions() {
        let bed = testbed(forum_table());

        let victim = get(&bed, "/open").await;
        let victim_token = victim.headers()[CSRF_HEADER].to_str().unwrap().to_owned();

        // Attacker session presenting the victim's token.
        let attacker = get(&bed, "/open").await;
        let attacker_cookie = returned_cookie(&attacker);

        let resp = send(
            &bed,
            Request::post("/form")
                .header(COOKIE, attacker_cookie)
                .header(CSRF_HEADER, victim_token)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn rejections_still_carry_a_fresh_csrf_token() {
        let bed = testbed(forum_table());

        // Anonymous POST to a quota route fails authentication, yet the
        // browser still needs a token for its next attempt after login.
        let resp = send(
            &bed,
            Request::post("/guarded").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().contains_key(CSRF_HEADER));
    }

    #[tokio::test]
    async fn exempt_namespace_posts_skip_csrf() {
        let bed = testbed(forum_table());
        seeded(&bed, "u-1", false);
        let token = bed.directory.issue_credential(&UserId::from("u-1"));

        let resp = send(
            &bed,
            Request::post("/api/v1/topics")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            !resp.headers().contains_key(CSRF_HEADER),
            "exempt routes issue no token"
        );
    }

    #[tokio::test]
    async fn methods_on_one_path_keep_their_own_policies() {
        let bed = testbed(forum_table());

        // GET /api/v1/topics is open; POST on the same path needs auth.
        let read = get(&bed, "/api/v1/topics").await;
        assert_eq!(read.status(), StatusCode::OK);

        let write = send(
            &bed,
            Request::post("/api/v1/topics").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(write.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn session_cookie_outranks_api_credential() {
        let bed = testbed(forum_table());
        seeded(&bed, "u-session", false);
        seeded(&bed, "u-token", false);
        let cookie = login_cookie(&bed, "u-session").await;
        let token = bed.directory.issue_credential(&UserId::from("u-token"));

        let resp = send(
            &bed,
            Request::get("/whoami")
                .header(COOKIE, cookie)
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"u-session");
    }

    #[tokio::test]
    async fn draining_server_turns_requests_away() {
        let bed = testbed(forum_table());
        bed.shutdown.trigger_shutdown();

        let resp = get(&bed, "/open").await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(resp).await["error"], "draining");
    }

    /// Directory that fails every lookup.
    struct FailingDirectory;

    #[async_trait]
    impl IdentityStore for FailingDirectory {
        async fn lookup_by_session(
            &self,
            _session: &SessionId,
        ) -> Result<Option<User>, StoreError> {
            Err(StoreError::Unavailable("directory down".to_owned()))
        }

        async fn lookup_by_credential(
            &self,
            _credential: &str,
        ) -> Result<Option<User>, StoreError> {
            Err(StoreError::Unavailable("directory down".to_owned()))
        }
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_generic_internal_error() {
        let admission = AdmissionState::new(
            Arc::new(FailingDirectory),
            Arc::new(MemorySessionStore::new(Duration::from_secs(3600))),
            Arc::new(MemoryCounterStore::new()),
            Arc::new(SystemClock),
            AdmissionConfig::default(),
        );
        let shutdown = Arc::new(ShutdownController::new());
        shutdown.set_ready();
        let app = compose(forum_table(), &admission, &shutdown).with_state(AppState {
            admission: admission.clone(),
            shutdown: shutdown.clone(),
            config: Arc::new(NetworkConfig::default()),
            start_time: Instant::now(),
        });

        let resp = app
            .oneshot(
                Request::get("/open")
                    .header("authorization", "Bearer aaaabbbbcccc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert_eq!(body["error"], "internal");
        assert_eq!(
            body["message"], "internal server error",
            "store detail never leaks to the caller"
        );
    }
}
