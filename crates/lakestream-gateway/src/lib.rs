//! Lakestream Gateway - HTTP ingestion for user-activity events
//!
//! Accepts one JSON event per request, validates it, and publishes it to the
//! durable log keyed by `session_id`.
//!
//! # Architecture
//!
//! - **Gateway**: validation plus publish, independent of HTTP
//! - **AppState**: shared state handed to request handlers
//! - **Routes**: `POST /events`, `GET /health`
//! - **Generator**: synthetic shopping sessions for load testing

mod error;
mod gateway;
pub mod generator;
mod routes;
mod state;

pub use self::error::ApiError;
pub use self::gateway::{Gateway, IngestAck, IngestError};
pub use self::routes::router;
pub use self::state::{AppState, GatewayConfig};
