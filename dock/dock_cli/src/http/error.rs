//! Mapping of host errors to HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dock_core::{DeployError, DispatchError};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use super::payload::PayloadRejection;

/// Errors returned by the HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Payload(#[from] PayloadRejection),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    /// HTTP status for the error
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Deploy(e) if e.is_artifact_error() => StatusCode::BAD_REQUEST,
            ApiError::Deploy(DeployError::AddressConflict { .. }) => StatusCode::CONFLICT,
            ApiError::Deploy(DeployError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Deploy(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Dispatch(DispatchError::AddressNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Dispatch(DispatchError::HandlerFailed { .. }) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Payload(rejection) => rejection.status(),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), "{}", self);
        }

        let body = match &self {
            ApiError::Payload(rejection) => rejection.body(),
            other => json!({"error": other.to_string()}),
        };
        (status, Json(body)).into_response()
    }
}
