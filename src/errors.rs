use crate::services::error::FileError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<FileError> for AppError {
    fn from(err: FileError) -> Self {
        let status = match &err {
            FileError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            FileError::NotFound(_) => StatusCode::NOT_FOUND,
            FileError::AlreadyExists(_) => StatusCode::CONFLICT,
            e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::StorageError;
    use std::time::Duration;
    use zip::result::ZipError;

    #[test]
    fn file_errors_map_to_statuses() {
        let cases = [
            (FileError::invalid("bad"), StatusCode::BAD_REQUEST),
            (FileError::not_found("x"), StatusCode::NOT_FOUND),
            (FileError::AlreadyExists("x".into()), StatusCode::CONFLICT),
            (
                FileError::Backend(StorageError::Timeout {
                    op: "list",
                    after: Duration::from_secs(120),
                }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (FileError::Consistency("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                FileError::Archive(ZipError::FileNotFound),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }
}
