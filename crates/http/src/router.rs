use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use engine::{AuthConfig, ExecutionRuntime, IngressLimits, Sandbox};
use envelope::KeyStore;
use pool::WarmupStatus;
use runtime_core::{BoxError, ErrorKind};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::auth::require_bearer;
use crate::ingress::execute;
use crate::response::ApiError;

/// Everything a handler needs, shared across requests.
pub struct AppState<R: ExecutionRuntime> {
    pub sandbox: Arc<Sandbox<R>>,
    pub keys: Arc<KeyStore>,
    pub ingress: IngressLimits,
    pub auth: Arc<AuthConfig>,
}

impl<R: ExecutionRuntime> Clone for AppState<R> {
    fn clone(&self) -> Self {
        Self {
            sandbox: Arc::clone(&self.sandbox),
            keys: Arc::clone(&self.keys),
            ingress: self.ingress.clone(),
            auth: Arc::clone(&self.auth),
        }
    }
}

pub fn app_router<R: ExecutionRuntime>(state: AppState<R>) -> Router {
    let internal = Router::new()
        .route("/execute", post(execute::<R>))
        .route("/metrics", get(metrics::<R>))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.auth),
            require_bearer,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz::<R>))
        .route("/public-key", get(public_key::<R>))
        .merge(internal)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

async fn readyz<R: ExecutionRuntime>(State(state): State<AppState<R>>) -> Response {
    let reason = match state.sandbox.pool().status() {
        WarmupStatus::Ready if state.keys.is_ready() => None,
        WarmupStatus::Ready => Some("keys not ready"),
        WarmupStatus::Pending => Some("pool warming up"),
        WarmupStatus::Disabled => Some("pool disabled"),
    };
    match reason {
        None => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
        Some(reason) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "reason": reason })),
        )
            .into_response(),
    }
}

async fn public_key<R: ExecutionRuntime>(State(state): State<AppState<R>>) -> Response {
    match state.keys.public_key_hex() {
        Some(public_key) => Json(json!({ "ok": true, "publicKey": public_key })).into_response(),
        None => ApiError(BoxError::new(ErrorKind::NotReady, "Server Keys Not Ready")).into_response(),
    }
}

async fn metrics<R: ExecutionRuntime>(State(state): State<AppState<R>>) -> Json<serde_json::Value> {
    let pool = state.sandbox.pool();
    let stats = pool.stats();
    Json(json!({
        "pool": pool.metrics().to_json(),
        "stats": {
            "idle": stats.idle,
            "active": stats.active,
            "queued": stats.queued,
            "status": stats.status.as_str(),
        },
        "executions": state.sandbox.metrics().to_json(),
    }))
}
