//! HTTP error type and JSON error responses.

use atlas_engine::EngineError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// No `apikey` parameter, or a wrong `authkey`.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The request body or a path segment could not be parsed.
    #[error("{0}")]
    BadRequest(String),

    /// An error from the command dispatcher.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl HttpError {
    /// Map to an HTTP status code.
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Engine(e) => match e {
                EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::BadRequest(_) => StatusCode::BAD_REQUEST,
                EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(%status, error = %self, "request failed");
        } else {
            tracing::debug!(%status, error = %self, "request rejected");
        }
        let body = json!({"status": "error", "message": self.to_string()});
        (status, Json(body)).into_response()
    }
}
