//! API route definitions.

mod events;
mod health;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};

use crate::state::AppState;

/// Build the complete API router.
///
/// # Route Structure
///
/// - `POST /events` - Ingest one JSON event
/// - `GET /health` - Health check
pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_body_bytes;

    Router::new()
        .route("/events", post(events::ingest))
        .route("/health", get(health::health_check))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
