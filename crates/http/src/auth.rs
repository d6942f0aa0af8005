use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use engine::AuthConfig;
use runtime_core::{BoxError, ErrorKind};
use subtle::ConstantTimeEq;

use crate::response::ApiError;

/// Bearer-token gate for internal routes.
pub async fn require_bearer(
    State(auth): State<Arc<AuthConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = auth.internal_auth_key.as_deref() else {
        if auth.strict {
            return ApiError(BoxError::new(
                ErrorKind::Internal,
                "Service Misconfigured: Auth Key Missing",
            ))
            .into_response();
        }
        tracing::warn!("No INTERNAL_AUTH_KEY set, allowing request");
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match presented {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => {
            next.run(request).await
        }
        _ => ApiError(BoxError::new(
            ErrorKind::Unauthorized,
            "Unauthorized Service Access",
        ))
        .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use engine::AuthConfig;
    use envelope::KeyStore;
    use serde_json::json;

    use crate::testing::{Harness, get, open_auth, post_json, send, token_auth};

    fn keys() -> KeyStore {
        KeyStore::from_settings(None, None, false)
    }

    #[tokio::test]
    async fn matching_token_is_let_through() {
        let harness = Harness::new(token_auth("s3cret"), keys()).await;
        let (status, _) = send(
            harness.router(),
            post_json("/execute", &json!({ "code": "main" }), Some("s3cret")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_or_missing_token_is_401() {
        let harness = Harness::new(token_auth("s3cret"), keys()).await;
        for token in [None, Some("nope"), Some("s3cret-but-longer")] {
            let (status, body) = send(
                harness.router(),
                post_json("/execute", &json!({ "code": "main" }), token),
            )
            .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{token:?}");
            assert_eq!(body["error"]["code"], json!("ERR_UNAUTHORIZED"));
            assert_eq!(body["error"]["message"], json!("Unauthorized Service Access"));
        }
        let (status, _) = send(harness.router(), get("/metrics", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn public_routes_skip_auth() {
        let harness = Harness::new(token_auth("s3cret"), keys()).await;
        for path in ["/healthz", "/readyz", "/public-key"] {
            let (status, _) = send(harness.router(), get(path, None)).await;
            assert_eq!(status, StatusCode::OK, "{path}");
        }
    }

    #[tokio::test]
    async fn missing_key_depends_on_strictness() {
        let harness = Harness::new(open_auth(), keys()).await;
        let (status, _) =
            send(harness.router(), post_json("/execute", &json!({ "code": "main" }), None)).await;
        assert_eq!(status, StatusCode::OK);

        let strict = AuthConfig {
            internal_auth_key: None,
            strict: true,
        };
        let harness = Harness::new(strict, keys()).await;
        let (status, body) =
            send(harness.router(), post_json("/execute", &json!({ "code": "main" }), None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body["error"]["message"],
            json!("Service Misconfigured: Auth Key Missing")
        );
    }
}
