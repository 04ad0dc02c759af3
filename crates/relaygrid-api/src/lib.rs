//! relaygrid-api: REST API for the relay daemon.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/` | Service information (public) |
//! | GET | `/health` | Process-wide health report (public, always 200) |
//! | GET | `/jobs` | List all jobs |
//! | POST | `/jobs` | Create a job |
//! | GET | `/jobs/{name}` | Get a job |
//! | PATCH | `/jobs/{name}` | Partially update a job |
//! | DELETE | `/jobs/{name}` | Delete a job and its cursors |
//! | GET | `/jobs/{name}/health` | Health of one job |
//! | GET | `/logs?job=` | Last 1000 log lines, system-wide or for one job |
//! | GET | `/metrics` | Prometheus exposition |
//!
//! Everything except `/` and `/health` requires
//! `Authorization: Bearer <token>`.

pub mod auth;
pub mod handlers;
pub mod logs;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::get;

use relaygrid_state::JobManager;
use relaygrid_supervisor::Supervisor;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Arc<Supervisor>,
    /// Secret expected in the bearer header.
    pub auth_token: Arc<str>,
    /// Operator log file read back by `/logs`. Daily rotations sit next
    /// to it as `<name>.<date>`; the newest one is read.
    pub log_path: PathBuf,
}

impl ApiState {
    pub fn jobs(&self) -> &JobManager {
        self.supervisor.jobs()
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/jobs", get(handlers::list_jobs).post(handlers::create_job))
        .route(
            "/jobs/{name}",
            get(handlers::get_job)
                .patch(handlers::update_job)
                .delete(handlers::delete_job),
        )
        .route("/jobs/{name}/health", get(handlers::job_health))
        .route("/logs", get(logs::view_logs))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .merge(protected)
        .with_state(state)
}
