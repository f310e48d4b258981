//! Agent-facing HTTP API.
//!
//! Serves `/api/2/task/{task_id}/{op}` plus the Prometheus `/metrics`
//! route. Authentication is header-based (task secret, host id + secret);
//! the hot-path operations (`next_task`, `heartbeat`) never take a global
//! lock; coordination is entirely compare-and-swap in storage.

mod auth;
mod error;
mod task_routes;

pub use error::ApiError;
pub use task_routes::{Ack, TestLogIdResponse};

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, MatchedPath, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use mci_core::wire::MAX_TEST_LOG_BYTES;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::env::Env;
use crate::metrics::SharedMetrics;

/// Shared state behind every handler.
pub struct ApiState {
    /// Control-plane environment.
    pub env: Env,

    /// Server metrics.
    pub metrics: SharedMetrics,
}

/// Build the API router.
#[must_use]
pub fn router(state: Arc<ApiState>) -> Router {
    let upload_limit = DefaultBodyLimit::max(MAX_TEST_LOG_BYTES);

    Router::new()
        .route("/api/2/task/{task_id}", get(task_routes::get_task_doc))
        .route("/api/2/task/{task_id}/distro", get(task_routes::get_distro))
        .route(
            "/api/2/task/{task_id}/project",
            get(task_routes::get_project),
        )
        .route(
            "/api/2/task/{task_id}/fetch_vars",
            get(task_routes::fetch_vars),
        )
        .route("/api/2/task/{task_id}/start", post(task_routes::start_task))
        .route(
            "/api/2/task/{task_id}/heartbeat",
            post(task_routes::heartbeat),
        )
        .route("/api/2/task/{task_id}/end", post(task_routes::end_task))
        .route(
            "/api/2/task/{task_id}/next_task",
            post(task_routes::next_task),
        )
        .route(
            "/api/2/task/{task_id}/log",
            post(task_routes::append_log).layer(upload_limit.clone()),
        )
        .route(
            "/api/2/task/{task_id}/system_info",
            post(task_routes::post_system_info),
        )
        .route(
            "/api/2/task/{task_id}/process_info",
            post(task_routes::post_process_info),
        )
        .route(
            "/api/2/task/{task_id}/results",
            post(task_routes::attach_results),
        )
        .route(
            "/api/2/task/{task_id}/test_logs",
            post(task_routes::upload_test_log).layer(upload_limit),
        )
        .route("/metrics", get(metrics_text))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            track_requests,
        ))
        .with_state(state)
}

/// Serve the API until the cancellation token fires.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(
    state: Arc<ApiState>,
    addr: &str,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "API server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

/// Per-request metrics middleware.
async fn track_requests(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |path| path.as_str().to_string());
    let response = next.run(request).await;
    state
        .metrics
        .api_request(&endpoint, response.status().as_u16());
    response
}

/// `GET /metrics`: Prometheus text exposition.
async fn metrics_text(State(state): State<Arc<ApiState>>) -> Result<String, StatusCode> {
    state
        .metrics
        .encode_text()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
