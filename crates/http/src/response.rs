use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use runtime_core::{BoxError, ExecutionResult};

/// A classified failure on its way out of a handler.
#[derive(Debug)]
pub struct ApiError(pub BoxError);

impl From<BoxError> for ApiError {
    fn from(err: BoxError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), message = %self.0.message, "Request failed");
        } else {
            tracing::warn!(code = self.0.code(), message = %self.0.message, "Request rejected");
        }
        (status, Json(self.0.to_body())).into_response()
    }
}

pub fn success(result: &ExecutionResult) -> Response {
    (StatusCode::OK, Json(result.to_body())).into_response()
}
