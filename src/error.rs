use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors surfaced at the HTTP boundary as `{"status": "error", "message": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid session ID")]
    SessionNotFound,
    #[error("No active WebSocket connection")]
    NotConnected,
    #[error("Provider and model must be selected")]
    SelectionMissing,
    #[error("A request is already running for this session")]
    Busy,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::SessionNotFound => StatusCode::NOT_FOUND,
            ApiError::NotConnected | ApiError::Busy => StatusCode::CONFLICT,
            ApiError::SelectionMissing | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            ApiError::Internal(e) => format!("{:#}", e),
            other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(%status, "{}", message);
        } else {
            tracing::debug!(%status, "{}", message);
        }
        (status, Json(json!({ "status": "error", "message": message }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<crate::agent::SessionError> for ApiError {
    fn from(err: crate::agent::SessionError) -> Self {
        match err {
            crate::agent::SessionError::NotFound => ApiError::SessionNotFound,
            crate::agent::SessionError::Busy => ApiError::Busy,
        }
    }
}
