use crate::{
    services::{
        delivery_service::DeliveryError,
        upload_service::{FieldError, UploadError},
    },
    storage::StorageError,
};
use axum::{
    Json,
    extract::multipart::MultipartError,
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
    /// Per-field validation failures, rendered only when present.
    pub errors: Vec<FieldError>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            errors: Vec::new(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// 400 carrying the rejected fields.
    pub fn invalid(errors: Vec<FieldError>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "Invalid upload request".into(),
            errors,
        }
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
        let body = if self.errors.is_empty() {
            json!({
                "error": self.message,
                "status": self.status.as_u16()
            })
        } else {
            json!({
                "error": self.message,
                "status": self.status.as_u16(),
                "errors": self.errors
            })
        };

        (self.status, Json(body)).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Validation(errors) => AppError::invalid(errors),
            UploadError::Storage(StorageError::InvalidName { field, .. }) => {
                AppError::invalid(vec![FieldError::new(field, "Contains unsupported characters")])
            }
            other => {
                tracing::error!("upload failed: {}", other);
                AppError::internal("Upload failed")
            }
        }
    }
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::NotFound(_) => AppError::not_found("Media not found"),
            other => {
                tracing::error!("media delivery failed: {}", other);
                AppError::internal("Media delivery failed")
            }
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::new(err.status(), err.body_text())
    }
}
