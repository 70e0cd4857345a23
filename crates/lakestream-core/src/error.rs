//! Error types for the lakestream event model.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Hard validation failure: the event cannot be routed or identified.
///
/// Raised when `event_id`, `event_type` or `session_id` is missing, empty,
/// or not a string, or when the document is not a JSON object at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidEvent {
    /// One or more required fields are missing or empty.
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    /// The document is not a JSON object.
    #[error("event must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// The payload could not be parsed as JSON.
    #[error("malformed JSON: {0}")]
    MalformedJson(String),
}

/// Errors that can occur while handling events.
#[derive(Error, Debug)]
pub enum Error {
    /// The event failed the required-field check.
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] InvalidEvent),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
