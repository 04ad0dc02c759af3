//! REST API handlers.
//!
//! Job handlers go through `JobManager`; the supervisor notices the
//! change on its own and reconciles workers.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use relay_core::{JobPatch, NewJob};
use relaygrid_state::JobError;
use relaygrid_supervisor::SupervisorError;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn job_error(e: JobError) -> Response {
    let status = match &e {
        JobError::Config(_) => StatusCode::BAD_REQUEST,
        JobError::DuplicateName(_) => StatusCode::CONFLICT,
        JobError::NotFound(_) => StatusCode::NOT_FOUND,
        JobError::State(_) => {
            error!(error = %e, "job registry failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&e.to_string(), status).into_response()
}

fn bad_body(rejection: JsonRejection) -> Response {
    error_response(&rejection.body_text(), StatusCode::BAD_REQUEST).into_response()
}

// ── Service ────────────────────────────────────────────────────

/// GET /
pub async fn index() -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({
        "name": "relaygrid",
        "description": "Forwards public channel posts to webhook destinations",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "GET /health": "process health",
            "GET /jobs": "list jobs",
            "POST /jobs": "create a job",
            "GET /jobs/{name}": "get a job",
            "PATCH /jobs/{name}": "update a job",
            "DELETE /jobs/{name}": "delete a job",
            "GET /jobs/{name}/health": "job health",
            "GET /logs?job=": "recent log lines",
            "GET /metrics": "Prometheus metrics",
        },
    }))
}

/// GET /health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.supervisor.health_report().await)
}

// ── Jobs ───────────────────────────────────────────────────────

/// GET /jobs
pub async fn list_jobs(State(state): State<ApiState>) -> Response {
    match state.jobs().list() {
        Ok(jobs) => ApiResponse::ok(jobs).into_response(),
        Err(e) => job_error(e),
    }
}

/// POST /jobs
pub async fn create_job(
    State(state): State<ApiState>,
    body: Result<Json<NewJob>, JsonRejection>,
) -> Response {
    let Json(new_job) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    match state.jobs().create(new_job) {
        Ok(job) => (StatusCode::CREATED, ApiResponse::ok(job)).into_response(),
        Err(e) => job_error(e),
    }
}

/// GET /jobs/{name}
pub async fn get_job(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.jobs().get(&name) {
        Ok(job) => ApiResponse::ok(job).into_response(),
        Err(e) => job_error(e),
    }
}

/// PATCH /jobs/{name}
pub async fn update_job(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Result<Json<JobPatch>, JsonRejection>,
) -> Response {
    let Json(patch) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    match state.jobs().update(&name, &patch) {
        Ok(job) => ApiResponse::ok(job).into_response(),
        Err(e) => job_error(e),
    }
}

/// DELETE /jobs/{name}
pub async fn delete_job(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.jobs().delete(&name) {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => job_error(e),
    }
}

/// GET /jobs/{name}/health
pub async fn job_health(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.supervisor.job_health(&name).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(SupervisorError::Job(e)) => job_error(e),
        Err(e) => {
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshots = state.supervisor.metrics().snapshot().await;
    let body = relaygrid_metrics::render_prometheus(&snapshots);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
