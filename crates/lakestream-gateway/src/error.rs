//! API error types and response formatting.

use axum::Json;
use axum::extract::rejection::BytesRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::gateway::IngestError;

/// API error type that converts to appropriate HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The event failed validation.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The request body exceeds the configured limit.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// The event could not be delivered to the log.
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::InvalidEvent(e) => Self::InvalidEvent(e.to_string()),
            IngestError::DeliveryFailed { .. } | IngestError::Unavailable(_) => {
                Self::DeliveryFailed(err.to_string())
            }
            IngestError::Serialization(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<BytesRejection> for ApiError {
    fn from(rejection: BytesRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge(rejection.body_text())
        } else {
            Self::InvalidEvent(rejection.body_text())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason, message) = match self {
            Self::InvalidEvent(msg) => (StatusCode::BAD_REQUEST, "invalid_event", Some(msg)),
            Self::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, "invalid_event", Some(msg)),
            Self::DeliveryFailed(msg) => {
                tracing::warn!(error = %msg, "delivery failed");
                (StatusCode::BAD_GATEWAY, "delivery_failed", Some(msg))
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    Some("An internal error occurred".to_string()),
                )
            }
        };

        (status, Json(ErrorResponse { reason, message })).into_response()
    }
}
