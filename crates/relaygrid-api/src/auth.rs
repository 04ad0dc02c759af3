//! Bearer token check for protected routes.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::ApiState;
use crate::handlers::error_response;

/// Missing or malformed header → 401, wrong token → 403.
pub async fn require_auth(State(state): State<ApiState>, req: Request<Body>, next: Next) -> Response {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let Some(token) = presented else {
        return error_response(
            "missing or malformed Authorization header, use: Bearer <token>",
            StatusCode::UNAUTHORIZED,
        )
        .into_response();
    };

    if token != &*state.auth_token {
        warn!(path = %req.uri().path(), "rejected request with invalid token");
        return error_response("invalid token", StatusCode::FORBIDDEN).into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, middleware, routing::get};
    use tower::util::ServiceExt;

    use crate::test_support;

    fn protected_app() -> Router {
        let state = test_support::state();
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .with_state(state)
    }

    async fn status_with(header: Option<&str>) -> StatusCode {
        let mut req = Request::builder().uri("/ping");
        if let Some(value) = header {
            req = req.header("authorization", value);
        }
        protected_app()
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        assert_eq!(status_with(None).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_header_is_unauthorized() {
        assert_eq!(status_with(Some("Basic abc")).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status_with(Some("Bearer ")).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status_with(Some(test_support::TOKEN)).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_is_forbidden() {
        assert_eq!(status_with(Some("Bearer nope")).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn valid_token_passes() {
        let header = format!("Bearer {}", test_support::TOKEN);
        assert_eq!(status_with(Some(&header)).await, StatusCode::OK);
    }
}
