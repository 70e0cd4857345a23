//! The canonical event shape.
//!
//! An [`Event`] is a fixed set of named attributes plus an explicit open
//! mapping ([`Event::extra`]) for everything else the client sent. The
//! mapping is flattened back to top-level keys on serialization, so the
//! wire representation matches what the client posted.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::time;

/// A user identifier: clients send either an integer or a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum UserId {
    Int(i64),
    Text(String),
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// A descriptive field (`location`, `device`) that is either free-form text
/// or a structured object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Descriptor {
    Text(String),
    Structured(Map<String, Value>),
}

impl Descriptor {
    /// Render the descriptor as a single text value (objects as compact JSON).
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Structured(map) => Value::Object(map.clone()).to_string(),
        }
    }
}

/// A validated user-activity event.
///
/// Invariant: `event_id`, `event_type` and `session_id` are non-empty.
/// Construct through [`crate::validate`] or [`crate::RawEvent::into_event`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Opaque unique identifier, used for downstream deduplication.
    pub event_id: String,

    /// Open-ended event type (`page_view`, `add_to_cart`, `purchase`, ...).
    pub event_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,

    /// Partition key: every event of a session lands on the same log partition.
    pub session_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Descriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Descriptor>,

    /// Event time as sent by the client (ISO-8601), only kept when parseable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Every additional field, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Event {
    /// Create an event with only the required fields set.
    pub fn new(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            user_id: None,
            session_id: session_id.into(),
            location: None,
            device: None,
            timestamp: None,
            extra: BTreeMap::new(),
        }
    }

    /// The partition key used on the durable log.
    pub fn partition_key(&self) -> &[u8] {
        self.session_id.as_bytes()
    }

    /// Typed event time, if the timestamp is present and parseable.
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_deref().and_then(time::parse_timestamp)
    }

    /// Day of the event time (UTC), the table's date partition value.
    pub fn event_date(&self) -> Option<NaiveDate> {
        self.event_time().map(|ts| ts.date_naive())
    }

    /// Serialize to the JSON wire representation (extra fields flattened).
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Serialize to a JSON value (extra fields flattened).
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
