//! Tower middleware that runs a route's admission plan.
//!
//! One [`AdmissionLayer`] wraps one route's handler with the stage plan the
//! composer fixed for it. Per request: resolve identity, mint the CSRF
//! token if the route issues one, run the plan's stages in order, and only
//! then call the handler. The first failing stage short-circuits into the
//! status/JSON contract without reaching the handler.
//!
//! Session cookie, CSRF token, and quota headers ride on *every* outcome of
//! a request, rejections included, so browsers stay able to retry.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::{header, HeaderMap, HeaderValue, Request, StatusCode, Uri};
use metrics::counter;
use serde_json::json;
use tower::{Layer, Service};
use tracing::{debug, error};

use agora_core::context::RequestContext;
use agora_core::errors::AdmissionError;

use super::csrf::{self, CSRF_HEADER};
use super::pipeline::{Stage, StagePlan};
use super::{gate, identity, quota, AdmissionState};
use crate::network::ShutdownController;

/// Response header carrying the route's daily ceiling.
pub const QUOTA_LIMIT_HEADER: &str = "x-quota-limit";

/// Response header carrying the caller's remaining allowance today.
pub const QUOTA_REMAINING_HEADER: &str = "x-quota-remaining";

// ---------------------------------------------------------------------------
// AdmissionLayer
// ---------------------------------------------------------------------------

/// Tower layer binding one stage plan to one route.
#[derive(Clone)]
pub struct AdmissionLayer {
    state: AdmissionState,
    shutdown: Arc<ShutdownController>,
    plan: Arc<StagePlan>,
}

impl AdmissionLayer {
    /// Creates a layer running `plan` against `state`.
    #[must_use]
    pub fn new(state: AdmissionState, shutdown: Arc<ShutdownController>, plan: StagePlan) -> Self {
        Self {
            state,
            shutdown,
            plan: Arc::new(plan),
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
            plan: self.plan.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// AdmissionService
// ---------------------------------------------------------------------------

/// Service wrapper that admits or rejects each request before the handler.
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    state: AdmissionState,
    shutdown: Arc<ShutdownController>,
    plan: Arc<StagePlan>,
}

impl<S> Service<Request<Body>> for AdmissionService<S>
where
    S: Service<Request<Body>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        // The handler runs after async store calls, so take the service that
        // was polled ready and leave a clone behind for the next request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        let plan = self.plan.clone();

        Box::pin(async move {
            if !shutdown.health_state().is_accepting() {
                counter!("admission_rejected_total", "reason" => "draining").increment(1);
                return Ok(draining_response());
            }
            // Keeps the drain phase waiting until this request completes.
            let _guard = shutdown.in_flight_guard();

            let path = req.uri().path().to_owned();
            let mut ctx = match identity::resolve(&state, req.headers(), req.uri()).await {
                Ok(ctx) => ctx,
                Err(err) => return Ok(finish_rejection(&state, &err, None, &path)),
            };

            // Minted before the stages run, so rejected responses carry a
            // usable token too.
            if plan.issues_csrf {
                csrf::issue(&mut ctx, &path, &state.config.csrf_exempt_prefix);
            }

            if let Err(err) = run_stages(&state, &plan, &mut ctx, req.headers(), req.uri()).await {
                return Ok(finish_rejection(&state, &err, Some(&ctx), &path));
            }

            req.extensions_mut().insert(ctx.clone());
            let response = inner.call(req).await?;
            counter!("admission_allowed_total").increment(1);
            Ok(attach_context_headers(&state, response, &ctx))
        })
    }
}

/// Runs the plan's stages in order, stopping at the first rejection.
///
/// Takes the request's headers and URI rather than the request itself:
/// borrowing the whole `Request<Body>` across the quota await would make
/// the admission future non-`Send`, because `Body` is not `Sync`.
async fn run_stages(
    state: &AdmissionState,
    plan: &StagePlan,
    ctx: &mut RequestContext,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<(), AdmissionError> {
    for stage in &plan.stages {
        match stage {
            Stage::RejectBlocked => gate::reject_blocked(ctx)?,
            Stage::RequireAuth => gate::require_auth(ctx)?,
            Stage::ConsumeQuota(policy) => quota::consume(state, ctx, policy).await?,
            Stage::VerifyCsrf => {
                csrf::verify(ctx, headers, uri, &state.config.csrf_exempt_prefix)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Logs, counts, and renders one rejection.
fn finish_rejection(
    state: &AdmissionState,
    err: &AdmissionError,
    ctx: Option<&RequestContext>,
    path: &str,
) -> Response {
    if err.is_expected() {
        debug!(code = err.code(), path, "request rejected");
    } else {
        error!(?err, path, "admission infrastructure failure");
    }
    counter!("admission_rejected_total", "reason" => err.code()).increment(1);

    let response = rejection_response(err);
    match ctx {
        Some(ctx) => attach_context_headers(state, response, ctx),
        None => response,
    }
}

/// Maps one admission error onto the status/JSON contract.
///
/// The `error` field values and the status codes are stable client-facing
/// identifiers; the `message` text is advisory and may change.
fn rejection_response(err: &AdmissionError) -> Response {
    let status = match err {
        AdmissionError::Unauthenticated => StatusCode::UNAUTHORIZED,
        AdmissionError::Forbidden | AdmissionError::CsrfInvalid => StatusCode::FORBIDDEN,
        AdmissionError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        AdmissionError::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = match err {
        AdmissionError::QuotaExceeded { action, limit } => json!({
            "error": err.code(),
            "message": err.to_string(),
            "action": action,
            "limit": limit,
        }),
        // Store detail stays in the logs.
        AdmissionError::Infrastructure(_) => json!({
            "error": err.code(),
            "message": "internal server error",
        }),
        _ => json!({
            "error": err.code(),
            "message": err.to_string(),
        }),
    };
    (status, Json(body)).into_response()
}

fn draining_response() -> Response {
    let body = json!({
        "error": "draining",
        "message": "server is shutting down",
    });
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}

/// Copies the context's session cookie, CSRF token, and quota decision onto
/// the response headers.
fn attach_context_headers(
    state: &AdmissionState,
    mut response: Response,
    ctx: &RequestContext,
) -> Response {
    let headers = response.headers_mut();

    if ctx.session.fresh {
        match HeaderValue::from_str(&state.cookies.set_cookie(&ctx.session.record.id)) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(err) => error!(%err, "session cookie is not header-safe"),
        }
    }

    // Token and counters are URL-safe / numeric, always header-safe.
    if let Some(token) = &ctx.csrf_token {
        if let Ok(value) = HeaderValue::from_str(token) {
            headers.insert(CSRF_HEADER, value);
        }
    }
    if let Some(quota) = &ctx.quota {
        if let Ok(value) = HeaderValue::from_str(&quota.limit.to_string()) {
            headers.insert(QUOTA_LIMIT_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&quota.remaining.to_string()) {
            headers.insert(QUOTA_REMAINING_HEADER, value);
        }
    }

    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
