//! API error handling
//!
//! Author: hephaex@gmail.com

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kbpo_core::KbpoError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// API error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Error code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn not_found(resource: &str) -> Self {
        Self::new("NOT_FOUND", format!("{resource} not found"))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }

    pub fn internal_error() -> Self {
        Self::new("INTERNAL_ERROR", "Internal server error")
    }
}

/// Application error type
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    /// Input parsed but was rejected
    Unprocessable(String),
    /// Resource is not in a state that allows the request
    Conflict(String),
    Internal(String),
    Database(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ApiError::not_found(&msg)),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ApiError::bad_request(msg)),
            AppError::Unprocessable(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ApiError::new("VALIDATION_FAILED", msg),
            ),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, ApiError::new("INVALID_STATE", msg)),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::internal_error().with_details(msg),
            ),
            AppError::Database(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::new("DATABASE_ERROR", "Database operation failed").with_details(msg),
            ),
        };

        (status, Json(error)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<KbpoError> for AppError {
    fn from(err: KbpoError) -> Self {
        match err {
            KbpoError::NotFound(msg) => AppError::NotFound(msg),
            KbpoError::Validation(msg) => AppError::Unprocessable(msg),
            err @ KbpoError::InvalidState { .. } => AppError::Conflict(err.to_string()),
            KbpoError::Config(msg) => AppError::BadRequest(format!("Invalid parameter: {msg}")),
            KbpoError::Database(msg) => AppError::Database(msg),
            KbpoError::Sampling(msg) => AppError::Internal(format!("Sampling error: {msg}")),
            KbpoError::Aggregation(msg) => AppError::Internal(format!("Aggregation error: {msg}")),
            KbpoError::Scoring(msg) => AppError::Internal(format!("Scoring error: {msg}")),
            KbpoError::Crowd(msg) => AppError::Internal(format!("Crowd error: {msg}")),
            KbpoError::Other(err) => AppError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (KbpoError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (KbpoError::Validation("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                KbpoError::InvalidState {
                    entity: "submission".into(),
                    expected: "pending-scoring".into(),
                    found: "done".into(),
                },
                StatusCode::CONFLICT,
            ),
            (KbpoError::Crowd("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).into_response().status(), status);
        }
    }
}
