//! PARSE, DERIVE and VALIDATE stages of a micro-batch.
//!
//! Each stage maps one row to one row; no stage drops input. Rows that
//! cannot become table rows end up as [`InvalidRecord`]s carrying their
//! source position, so every record read is accounted for.

use chrono::{DateTime, NaiveDate, Utc};
use lakestream_core::{FieldIssue, IssueKind, RawEvent};
use lakestream_log::LogRecord;
use serde_json::Value;

use crate::invalid::{InvalidReason, InvalidRecord};
use crate::table::TableRow;

/// Where a row came from on the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
    pub partition: u32,
    pub offset: u64,
}

/// Output of PARSE.
#[derive(Debug, Clone)]
pub struct ParsedRow {
    pub position: SourcePosition,

    /// The raw record value, kept for auditing invalid rows.
    pub value: Vec<u8>,

    pub body: RowBody,
}

#[derive(Debug, Clone)]
pub enum RowBody {
    /// A JSON object, leniently parsed. `payload` is the object as read.
    Parsed {
        raw: RawEvent,
        issues: Vec<FieldIssue>,
        payload: Value,
    },

    /// Not UTF-8, not JSON, or not an object.
    Corrupt { corrupt_record: String, error: String },
}

/// Output of DERIVE.
#[derive(Debug, Clone)]
pub struct DerivedRow {
    pub parsed: ParsedRow,
    pub event_time: Option<DateTime<Utc>>,
    pub event_date: Option<NaiveDate>,
}

/// Output of VALIDATE.
#[derive(Debug, Clone)]
pub enum Validated {
    Valid(TableRow),
    Invalid(InvalidRecord),
}

/// Deserialize a log record with the gateway's permissive policy.
pub fn parse(record: LogRecord) -> ParsedRow {
    let position = SourcePosition {
        partition: record.partition,
        offset: record.offset,
    };

    let body = match std::str::from_utf8(&record.value) {
        Err(e) => corrupt(&record.value, format!("invalid UTF-8: {e}")),
        Ok(text) => match serde_json::from_str::<Value>(text) {
            Err(e) => corrupt(&record.value, format!("malformed JSON: {e}")),
            Ok(value) => match RawEvent::from_value(value.clone()) {
                Ok((raw, issues)) => RowBody::Parsed {
                    raw,
                    issues,
                    payload: value,
                },
                Err(e) => corrupt(&record.value, e.to_string()),
            },
        },
    };

    ParsedRow {
        position,
        value: record.value,
        body,
    }
}

fn corrupt(value: &[u8], error: String) -> RowBody {
    RowBody::Corrupt {
        corrupt_record: String::from_utf8_lossy(value).into_owned(),
        error,
    }
}

/// Compute the event time and its UTC day.
pub fn derive(parsed: ParsedRow) -> DerivedRow {
    let event_time = match &parsed.body {
        RowBody::Parsed { raw, .. } => raw
            .timestamp
            .as_deref()
            .and_then(lakestream_core::parse_timestamp),
        RowBody::Corrupt { .. } => None,
    };

    DerivedRow {
        event_date: event_time.map(|ts| ts.date_naive()),
        event_time,
        parsed,
    }
}

/// Re-check required fields and the derived partition date.
pub fn validate(derived: DerivedRow) -> Validated {
    let DerivedRow {
        parsed,
        event_time,
        event_date,
    } = derived;
    let position = parsed.position;

    let (raw, issues, payload) = match parsed.body {
        RowBody::Corrupt {
            corrupt_record,
            error,
        } => {
            return Validated::Invalid(InvalidRecord {
                partition: position.partition,
                offset: position.offset,
                reason: InvalidReason::CorruptRecord,
                detail: error,
                event_id: None,
                event_date: None,
                payload: None,
                corrupt_record: Some(corrupt_record),
            });
        }
        RowBody::Parsed {
            raw,
            issues,
            payload,
        } => (raw, issues, payload),
    };

    let event_id = raw.event_id.clone().filter(|id| !id.is_empty());
    let invalid = |reason, detail| {
        Validated::Invalid(InvalidRecord {
            partition: position.partition,
            offset: position.offset,
            reason,
            detail,
            event_id: event_id.clone(),
            event_date,
            payload: Some(payload.clone()),
            corrupt_record: None,
        })
    };

    let event = match raw.into_event() {
        Ok(event) => event,
        Err(e) => return invalid(InvalidReason::MissingRequiredFields, e.to_string()),
    };

    match (event_time, event_date) {
        (Some(event_time), Some(event_date)) => Validated::Valid(TableRow {
            event,
            event_time,
            event_date,
        }),
        _ => invalid(InvalidReason::MissingEventDate, timestamp_detail(&issues)),
    }
}

fn timestamp_detail(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .find(|issue| issue.field == "timestamp")
        .map(|issue| match issue.kind {
            IssueKind::Missing => "timestamp is missing".to_string(),
            _ => format!("timestamp rejected: {}", issue.detail),
        })
        .unwrap_or_else(|| "timestamp is missing".to_string())
}

/// Run PARSE, DERIVE and VALIDATE over one record.
pub fn transform(record: LogRecord) -> Validated {
    validate(derive(parse(record)))
}

/// Transform a batch on up to `workers` threads. Output order matches input.
pub fn transform_batch(records: Vec<LogRecord>, workers: usize) -> Vec<Validated> {
    par_map(records, workers, transform)
}

/// PARSE a batch on up to `workers` threads.
pub fn parse_batch(records: Vec<LogRecord>, workers: usize) -> Vec<ParsedRow> {
    par_map(records, workers, parse)
}

/// DERIVE a batch on up to `workers` threads.
pub fn derive_batch(rows: Vec<ParsedRow>, workers: usize) -> Vec<DerivedRow> {
    par_map(rows, workers, derive)
}

/// VALIDATE a batch on up to `workers` threads.
pub fn validate_batch(rows: Vec<DerivedRow>, workers: usize) -> Vec<Validated> {
    par_map(rows, workers, validate)
}

/// Apply `f` to contiguous chunks on scoped threads, keeping input order.
fn par_map<T: Send, U: Send>(items: Vec<T>, workers: usize, f: fn(T) -> U) -> Vec<U> {
    let workers = workers.max(1);
    if workers == 1 || items.len() < workers * 2 {
        return items.into_iter().map(f).collect();
    }

    let chunk_size = items.len().div_ceil(workers);
    let mut chunks: Vec<Vec<T>> = Vec::with_capacity(workers);
    let mut items = items.into_iter();
    loop {
        let chunk: Vec<T> = items.by_ref().take(chunk_size).collect();
        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);
    }

    std::thread::scope(|scope| {
        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| scope.spawn(move || chunk.into_iter().map(f).collect::<Vec<_>>()))
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| match handle.join() {
                Ok(rows) => rows,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(offset: u64, value: &[u8]) -> LogRecord {
        LogRecord {
            partition: 1,
            offset,
            timestamp_ms: 0,
            key: b"s1".to_vec(),
            value: value.to_vec(),
        }
    }

    fn json_record(offset: u64, value: Value) -> LogRecord {
        record(offset, &serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn test_valid_event() {
        let rec = json_record(
            7,
            json!({
                "event_id": "e1",
                "event_type": "purchase",
                "session_id": "s1",
                "timestamp": "2024-05-01T23:30:00-02:00",
                "amount": 3
            }),
        );

        let Validated::Valid(row) = transform(rec) else {
            panic!("expected a valid row");
        };
        assert_eq!(row.event.event_id, "e1");
        assert_eq!(row.event.extra["amount"], 3);
        // 23:30 at -02:00 is the next UTC day
        assert_eq!(row.event_date, NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
    }

    #[test]
    fn test_malformed_json_is_corrupt_record() {
        let Validated::Invalid(invalid) = transform(record(3, b"{\"event_id\": ")) else {
            panic!("expected an invalid row");
        };
        assert_eq!(invalid.reason, InvalidReason::CorruptRecord);
        assert_eq!(invalid.offset, 3);
        assert_eq!(invalid.corrupt_record.as_deref(), Some("{\"event_id\": "));
        assert!(invalid.detail.contains("malformed JSON"));
    }

    #[test]
    fn test_non_utf8_and_non_object_are_corrupt() {
        let parsed = parse(record(0, &[0xff, 0xfe]));
        assert!(matches!(parsed.body, RowBody::Corrupt { .. }));

        let parsed = parse(record(0, b"[1, 2]"));
        let RowBody::Corrupt { error, .. } = parsed.body else {
            panic!("expected corrupt");
        };
        assert!(error.contains("array"));
    }

    #[test]
    fn test_bad_timestamp_flags_invalid_with_null_date() {
        let rec = json_record(
            0,
            json!({"event_id": "e1", "event_type": "login", "session_id": "s1", "timestamp": "yesterday"}),
        );

        let derived = derive(parse(rec));
        assert!(derived.event_date.is_none());

        let Validated::Invalid(invalid) = validate(derived) else {
            panic!("expected an invalid row");
        };
        assert_eq!(invalid.reason, InvalidReason::MissingEventDate);
        assert_eq!(invalid.event_date, None);
        assert_eq!(invalid.event_id.as_deref(), Some("e1"));
        assert!(invalid.detail.contains("yesterday"), "{}", invalid.detail);
        assert_eq!(invalid.payload.unwrap()["timestamp"], "yesterday");
    }

    #[test]
    fn test_missing_required_field() {
        let rec = json_record(0, json!({"event_id": "e1", "session_id": "", "timestamp": "2024-05-01"}));
        let Validated::Invalid(invalid) = transform(rec) else {
            panic!("expected an invalid row");
        };
        assert_eq!(invalid.reason, InvalidReason::MissingRequiredFields);
        assert!(invalid.detail.contains("event_type"));
        assert!(invalid.detail.contains("session_id"));
    }

    #[test]
    fn test_batch_preserves_order_across_workers() {
        let records: Vec<_> = (0..50)
            .map(|i| {
                json_record(
                    i,
                    json!({"event_id": format!("e{i}"), "event_type": "t", "session_id": "s", "timestamp": "2024-05-01"}),
                )
            })
            .collect();

        let out = transform_batch(records, 4);
        let ids: Vec<_> = out
            .iter()
            .map(|v| match v {
                Validated::Valid(row) => row.event.event_id.clone(),
                Validated::Invalid(_) => panic!("unexpected invalid row"),
            })
            .collect();
        let expected: Vec<_> = (0..50).map(|i| format!("e{i}")).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_stage_batches_match_single_record_path() {
        let records: Vec<_> = (0..20)
            .map(|i| {
                let timestamp = if i % 3 == 0 { "never" } else { "2024-05-01T10:00:00Z" };
                json_record(
                    i,
                    json!({"event_id": format!("e{i}"), "event_type": "t", "session_id": "s", "timestamp": timestamp}),
                )
            })
            .collect();

        let staged = validate_batch(derive_batch(parse_batch(records.clone(), 3), 3), 3);
        let direct = transform_batch(records, 1);
        assert_eq!(staged.len(), direct.len());
        for (a, b) in staged.iter().zip(&direct) {
            match (a, b) {
                (Validated::Valid(a), Validated::Valid(b)) => assert_eq!(a.event.event_id, b.event.event_id),
                (Validated::Invalid(a), Validated::Invalid(b)) => assert_eq!(a.offset, b.offset),
                _ => panic!("stages disagree"),
            }
        }
    }

    #[test]
    fn test_parse_keeps_payload_for_invalid_rows() {
        let rec = json_record(0, json!({"event_id": "e1", "session_id": "s1", "note": {"a": 1}}));
        let parsed = parse(rec);
        let RowBody::Parsed { payload, .. } = &parsed.body else {
            panic!("expected a parsed row");
        };
        assert_eq!(payload["note"]["a"], 1);
        assert_eq!(payload["event_id"], "e1");

        let Validated::Invalid(invalid) = validate(derive(parsed)) else {
            panic!("expected an invalid row");
        };
        assert_eq!(invalid.payload, Some(json!({"event_id": "e1", "session_id": "s1", "note": {"a": 1}})));
    }
}
