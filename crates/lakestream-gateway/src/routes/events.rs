//! Event ingestion endpoint.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::rejection::BytesRejection;
use axum::http::StatusCode;
use serde::Serialize;

use crate::error::ApiError;
use crate::gateway::IngestAck;
use crate::state::AppState;

/// Acknowledgment returned for an accepted event.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    event_id: String,
    partition: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
    status: &'static str,
}

/// `POST /events`
///
/// The body is read as raw bytes so that non-JSON payloads are reported as
/// `invalid_event` rather than as an extractor rejection. A body over the
/// size limit gets the same JSON error shape with status 413.
pub async fn ingest(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let body = body?;
    let ack = state.gateway.ingest(&body).await?;

    let response = match ack {
        IngestAck::Enqueued {
            event_id,
            partition,
        } => (
            StatusCode::ACCEPTED,
            IngestResponse {
                event_id,
                partition,
                offset: None,
                status: "enqueued",
            },
        ),
        IngestAck::Delivered {
            event_id,
            partition,
            offset,
        } => (
            StatusCode::OK,
            IngestResponse {
                event_id,
                partition,
                offset: Some(offset),
                status: "delivered",
            },
        ),
    };

    Ok((response.0, Json(response.1)))
}
