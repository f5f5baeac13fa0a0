//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type; one variant per wire-visible category.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Ambiguous(String),
    Forbidden(String),
    Conflict(String),
    Exhausted(String),
    Timeout(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            // Ambiguous prefixes are a client addressing problem.
            ApiError::Ambiguous(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::PRECONDITION_FAILED, msg),
            ApiError::Exhausted(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<joblet_core::Error> for ApiError {
    fn from(err: joblet_core::Error) -> Self {
        use joblet_core::Error;
        match err {
            Error::InvalidArgument(msg) => ApiError::BadRequest(msg),
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::AmbiguousReference(msg) => ApiError::Ambiguous(msg),
            Error::PermissionDenied(msg) => ApiError::Forbidden(msg),
            Error::ResourceExhausted(msg) => ApiError::Exhausted(msg),
            Error::Precondition(msg) => ApiError::Conflict(msg),
            Error::Timeout(msg) => ApiError::Timeout(msg),
            Error::Cancelled => ApiError::Conflict("cancelled".into()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
