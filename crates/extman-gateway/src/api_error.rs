//! Maps controller errors onto HTTP status codes and the JSON error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use extman_core::{ControllerError, ErrorKind};
use serde::{Deserialize, Serialize};

/// Error body returned by every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub code: u16,
    pub message: String,
}

/// HTTP-facing error rendered as [`ApiErrorBody`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {message}"),
        )
    }

    pub fn body(&self) -> ApiErrorBody {
        ApiErrorBody {
            code: self.status.as_u16(),
            message: self.message.clone(),
        }
    }
}

impl From<ControllerError> for ApiError {
    fn from(error: ControllerError) -> Self {
        let status = match error.kind() {
            ErrorKind::Validation | ErrorKind::ForbiddenStatement | ErrorKind::InvalidArgument => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::ExtensionNotFound | ErrorKind::EntryPointMissing | ErrorKind::FileNotFound => {
                StatusCode::NOT_FOUND
            }
            ErrorKind::Cancelled => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::NotInstalled => StatusCode::PRECONDITION_FAILED,
            ErrorKind::ExtensionExecution => match guest_status(&error) {
                Some(status) => status,
                None => return Self::internal(&error),
            },
            _ => return Self::internal(&error),
        };
        Self::new(status, error.to_string())
    }
}

/// Status attached by the guest, if it is a client or server error code.
fn guest_status(error: &ControllerError) -> Option<StatusCode> {
    let ControllerError::ExtensionExecution { source, .. } = error.primary() else {
        return None;
    };
    source
        .status
        .and_then(|status| StatusCode::from_u16(status).ok())
        .filter(|status| status.is_client_error() || status.is_server_error())
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), message = %self.message, "request failed");
        } else {
            tracing::debug!(status = self.status.as_u16(), message = %self.message, "request rejected");
        }
        (self.status, Json(self.body())).into_response()
    }
}
