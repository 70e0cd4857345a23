//! Permissive event parsing and the required-field check.
//!
//! Parsing is split in two so that both the gateway and the stream job can
//! share it:
//!
//! 1. [`RawEvent::from_value`] never rejects a JSON object. Malformed optional
//!    fields are coerced to absent and reported as [`FieldIssue`]s.
//! 2. [`RawEvent::into_event`] applies the hard check: `event_id`,
//!    `event_type` and `session_id` must be non-empty strings.
//!
//! [`validate`] runs both steps.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::InvalidEvent;
use crate::event::{Descriptor, Event, UserId};
use crate::time::parse_timestamp;
use crate::{FIXED_FIELDS, REQUIRED_FIELDS};

/// Category of a soft, field-level data-quality defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// The field was absent or null.
    Missing,
    /// The field had a JSON type the model does not accept.
    WrongType,
    /// The field was a string that could not be parsed (e.g. a timestamp).
    Unparseable,
}

/// A soft defect on a single field. The field is set to absent, the event
/// is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub field: &'static str,
    pub kind: IssueKind,
    pub detail: String,
}

impl FieldIssue {
    fn new(field: &'static str, kind: IssueKind, detail: impl Into<String>) -> Self {
        Self {
            field,
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?} ({})", self.field, self.kind, self.detail)
    }
}

/// A leniently parsed event whose required fields may still be missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEvent {
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub user_id: Option<UserId>,
    pub session_id: Option<String>,
    pub location: Option<Descriptor>,
    pub device: Option<Descriptor>,
    pub timestamp: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

impl RawEvent {
    /// Leniently parse a JSON document.
    ///
    /// Only a non-object document is rejected; every field-level problem is
    /// reported through the returned issues instead.
    pub fn from_value(value: Value) -> Result<(Self, Vec<FieldIssue>), InvalidEvent> {
        match value {
            Value::Object(map) => Ok(Self::from_map(map)),
            other => Err(InvalidEvent::NotAnObject(json_type(&other))),
        }
    }

    /// Leniently parse a JSON object.
    pub fn from_map(mut map: Map<String, Value>) -> (Self, Vec<FieldIssue>) {
        let mut issues = Vec::new();

        let event_id = take_required(&mut map, "event_id", &mut issues);
        let event_type = take_required(&mut map, "event_type", &mut issues);
        let session_id = take_required(&mut map, "session_id", &mut issues);
        let user_id = take_user_id(&mut map, &mut issues);
        let location = take_descriptor(&mut map, "location", &mut issues);
        let device = take_descriptor(&mut map, "device", &mut issues);
        let timestamp = take_timestamp(&mut map, &mut issues);

        debug_assert!(FIXED_FIELDS.iter().all(|f| !map.contains_key(*f)));
        let extra = map.into_iter().collect();

        let raw = Self {
            event_id,
            event_type,
            user_id,
            session_id,
            location,
            device,
            timestamp,
            extra,
        };
        (raw, issues)
    }

    /// Names of required fields that are missing or empty.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let present = [&self.event_id, &self.event_type, &self.session_id];
        REQUIRED_FIELDS
            .iter()
            .zip(present)
            .filter(|(_, value)| value.as_deref().is_none_or(str::is_empty))
            .map(|(name, _)| *name)
            .collect()
    }

    /// Apply the hard required-field check.
    pub fn into_event(self) -> Result<Event, InvalidEvent> {
        let missing = self.missing_required();
        if !missing.is_empty() {
            return Err(InvalidEvent::MissingFields(missing));
        }

        match (self.event_id, self.event_type, self.session_id) {
            (Some(event_id), Some(event_type), Some(session_id)) => Ok(Event {
                event_id,
                event_type,
                user_id: self.user_id,
                session_id,
                location: self.location,
                device: self.device,
                timestamp: self.timestamp,
                extra: self.extra,
            }),
            _ => Err(InvalidEvent::MissingFields(REQUIRED_FIELDS.to_vec())),
        }
    }
}

/// Validate a loosely typed JSON document into an [`Event`].
///
/// Fails only when the document is not an object or a required field is
/// missing; everything else is coerced and reported as issues.
pub fn validate(raw: Value) -> Result<(Event, Vec<FieldIssue>), InvalidEvent> {
    let (raw, issues) = RawEvent::from_value(raw)?;
    Ok((raw.into_event()?, issues))
}

/// Validate a raw JSON payload.
pub fn validate_slice(payload: &[u8]) -> Result<(Event, Vec<FieldIssue>), InvalidEvent> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| InvalidEvent::MalformedJson(e.to_string()))?;
    validate(value)
}

fn take_required(
    map: &mut Map<String, Value>,
    field: &'static str,
    issues: &mut Vec<FieldIssue>,
) -> Option<String> {
    match map.remove(field) {
        Some(Value::String(s)) => Some(s),
        None | Some(Value::Null) => None,
        Some(other) => {
            issues.push(FieldIssue::new(
                field,
                IssueKind::WrongType,
                format!("expected string, got {}", json_type(&other)),
            ));
            None
        }
    }
}

fn take_user_id(map: &mut Map<String, Value>, issues: &mut Vec<FieldIssue>) -> Option<UserId> {
    match map.remove("user_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(UserId::Text(s)),
        Some(Value::Number(n)) if n.as_i64().is_some() => n.as_i64().map(UserId::Int),
        Some(other) => {
            issues.push(FieldIssue::new(
                "user_id",
                IssueKind::WrongType,
                format!("expected integer or string, got {other}"),
            ));
            None
        }
    }
}

fn take_descriptor(
    map: &mut Map<String, Value>,
    field: &'static str,
    issues: &mut Vec<FieldIssue>,
) -> Option<Descriptor> {
    match map.remove(field) {
        Some(Value::String(s)) => Some(Descriptor::Text(s)),
        Some(Value::Object(obj)) => Some(Descriptor::Structured(obj)),
        None | Some(Value::Null) => {
            issues.push(FieldIssue::new(field, IssueKind::Missing, "absent"));
            None
        }
        Some(other) => {
            issues.push(FieldIssue::new(
                field,
                IssueKind::WrongType,
                format!("expected string or object, got {}", json_type(&other)),
            ));
            None
        }
    }
}

fn take_timestamp(map: &mut Map<String, Value>, issues: &mut Vec<FieldIssue>) -> Option<String> {
    match map.remove("timestamp") {
        Some(Value::String(s)) if parse_timestamp(&s).is_some() => Some(s),
        Some(Value::String(s)) => {
            issues.push(FieldIssue::new(
                "timestamp",
                IssueKind::Unparseable,
                format!("not an ISO-8601 timestamp: {s:?}"),
            ));
            None
        }
        None | Some(Value::Null) => {
            issues.push(FieldIssue::new("timestamp", IssueKind::Missing, "absent"));
            None
        }
        Some(other) => {
            issues.push(FieldIssue::new(
                "timestamp",
                IssueKind::WrongType,
                format!("expected string, got {other}"),
            ));
            None
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
