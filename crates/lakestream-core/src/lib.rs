//! Core types, validation, and shared utilities for the lakestream pipeline.
//!
//! This crate provides:
//! - The canonical [`Event`] shape with an open `extra` mapping
//! - Permissive parsing ([`RawEvent`]) and the hard required-field check ([`validate`])
//! - ISO-8601 timestamp parsing shared by the gateway and the stream job
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
pub mod metrics;
mod time;
mod validate;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Default topic that ingested events are published to.
pub const DEFAULT_TOPIC: &str = "ecommerce_events";

/// Field names that make up the fixed part of the event shape.
///
/// Any other top-level key of an incoming document lands in [`Event::extra`].
pub const FIXED_FIELDS: [&str; 7] = [
    "event_id",
    "event_type",
    "user_id",
    "session_id",
    "location",
    "device",
    "timestamp",
];

/// Fields that must be present and non-empty for an event to be accepted.
pub const REQUIRED_FIELDS: [&str; 3] = ["event_id", "event_type", "session_id"];

pub use error::{Error, InvalidEvent, Result};
pub use event::{Descriptor, Event, UserId};
pub use time::{event_date, parse_timestamp};
pub use validate::{FieldIssue, IssueKind, RawEvent, validate, validate_slice};
