//! HTTP Server for Health and Metrics Endpoints
//!
//! Monitoring side channel, served on its own port next to the chat socket.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use crate::metrics::RelayMetrics;
use crate::token_registry::TokenRegistry;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub metrics: RelayMetrics,
    pub metrics_token: Option<String>,
    pub registry: Arc<TokenRegistry>,
    pub started: Instant,
}

/// Middleware to check bearer token for metrics endpoint.
async fn metrics_auth_middleware(
    State(state): State<HttpState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if request.uri().path() == "/metrics" {
        if let Some(ref expected_token) = state.metrics_token {
            let is_authorized = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
                .is_some_and(|token| token == expected_token);

            if !is_authorized {
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    "Unauthorized",
                )
                    .into_response();
            }
        }
    }

    next.run(request).await
}

/// Creates the HTTP router with health and metrics endpoints.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics_auth_middleware,
        ))
        .with_state(state)
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "chat-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/metrics"]
    }))
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started.elapsed().as_secs(),
        "online_sessions": state.registry.online_count(),
    }))
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    state
        .metrics
        .sessions_online
        .set(state.registry.online_count() as i64);

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn create_test_state(metrics_token: Option<&str>) -> HttpState {
        HttpState {
            metrics: RelayMetrics::new(),
            metrics_token: metrics_token.map(str::to_string),
            registry: Arc::new(TokenRegistry::new()),
            started: Instant::now(),
        }
    }

    async fn get_request(app: Router, uri: &str, bearer: Option<&str>) -> Response {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        app.oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = create_router(create_test_state(None));
        let response = get_request(app, "/metrics", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reports_online_sessions() {
        let state = create_test_state(None);
        let (tx, _rx) = mpsc::channel(1);
        state.registry.register("tok", "alice", tx).unwrap();

        let response = get_request(create_router(state), "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["online_sessions"], 1);
    }

    #[tokio::test]
    async fn test_metrics_requires_token_when_configured() {
        let state = create_test_state(Some("s3cret"));

        let response = get_request(create_router(state.clone()), "/metrics", None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = get_request(create_router(state.clone()), "/metrics", Some("nope")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = get_request(create_router(state.clone()), "/metrics", Some("s3cret")).await;
        assert_eq!(response.status(), StatusCode::OK);

        // Health stays open
        let response = get_request(create_router(state), "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_root_lists_endpoints() {
        let response = get_request(create_router(create_test_state(None)), "/", None).await;
        let json = body_json(response).await;
        assert_eq!(json["service"], "chat-relay");
    }
}
