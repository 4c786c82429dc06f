//! Error types for the DriftSync server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::sync::{StoreError, TimestampError};

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Request field a validation failure refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InvalidField {
    Cursor,
    AssumedModifiedAt,
}

/// Why a timestamp field was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidReason {
    InvalidFormat,
    FutureTimestamp,
    Missing,
}

impl From<TimestampError> for InvalidReason {
    fn from(err: TimestampError) -> Self {
        match err {
            TimestampError::InvalidTimestamp => InvalidReason::InvalidFormat,
            TimestampError::FutureTimestamp => InvalidReason::FutureTimestamp,
        }
    }
}

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid {field:?}: {reason:?}")]
    Validation {
        field: InvalidField,
        reason: InvalidReason,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl AppError {
    pub fn invalid_timestamp(field: InvalidField, err: TimestampError) -> Self {
        AppError::Validation {
            field,
            reason: err.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            AppError::Store(StoreError::AlreadyExists { .. }) => StatusCode::CONFLICT,
            AppError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Body for timestamp validation failures
#[derive(Serialize)]
struct ValidationResponse {
    field: InvalidField,
    reason: InvalidReason,
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let (error_type, message) = match &self {
            AppError::Validation { field, reason } => {
                tracing::debug!(?field, ?reason, "Rejected client timestamp");
                return (status, Json(ValidationResponse { field: *field, reason: *reason }))
                    .into_response();
            }
            AppError::NotFound(msg) => ("not_found", msg.clone()),
            AppError::BadRequest(msg) => ("bad_request", msg.clone()),
            AppError::Store(StoreError::NotFound { collection, id }) => (
                "not_found",
                format!("Record not found: {}/{}", collection, id),
            ),
            AppError::Store(StoreError::AlreadyExists { collection, id }) => (
                "already_exists",
                format!("Record already exists: {}/{}", collection, id),
            ),
            AppError::Store(e) => {
                tracing::error!("Record store error: {}", e);
                (
                    "collection_unavailable",
                    "Collection is temporarily unavailable".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}
