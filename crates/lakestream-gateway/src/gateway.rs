//! Validation and publishing of single events.

use std::sync::Arc;

use lakestream_core::metrics::{increment, increment_with_reason};
use lakestream_core::{InvalidEvent, validate_slice};
use lakestream_log::{AckLevel, DeliveryResult, LogError, Producer};
use thiserror::Error;
use tracing::debug;

/// Successful ingest outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestAck {
    /// Handed to the producer; delivery not awaited (`none` ack level).
    Enqueued { event_id: String, partition: u32 },

    /// Stored by the broker at `offset`.
    Delivered {
        event_id: String,
        partition: u32,
        offset: u64,
    },
}

/// Ingest failure.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The event was rejected by validation. Nothing was published.
    #[error(transparent)]
    InvalidEvent(#[from] InvalidEvent),

    /// The producer gave up on the record.
    #[error("delivery to partition {partition} failed: {reason}")]
    DeliveryFailed { partition: u32, reason: String },

    /// The producer no longer accepts records.
    #[error("producer unavailable: {0}")]
    Unavailable(#[from] LogError),

    /// The validated event could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(#[from] lakestream_core::Error),
}

/// Validates events and publishes them through a shared [`Producer`].
///
/// Holds no per-request state; concurrent calls only share the producer.
pub struct Gateway {
    producer: Arc<Producer>,
    ack_level: AckLevel,
}

impl Gateway {
    pub fn new(producer: Arc<Producer>) -> Self {
        let ack_level = producer.config().ack_level;
        Self {
            producer,
            ack_level,
        }
    }

    pub fn producer(&self) -> &Arc<Producer> {
        &self.producer
    }

    /// Validate one JSON payload and publish it keyed by `session_id`.
    ///
    /// Waits for the delivery result unless the ack level is `none`.
    pub async fn ingest(&self, payload: &[u8]) -> Result<IngestAck, IngestError> {
        increment("gateway_events_received_total", 1);

        let (event, issues) = match validate_slice(payload) {
            Ok(validated) => validated,
            Err(e) => {
                increment_with_reason("gateway_events_rejected_total", "invalid_event", 1);
                debug!("Rejected event: {}", e);
                return Err(e.into());
            }
        };

        for issue in &issues {
            debug!(event_id = %event.event_id, "Field issue: {}", issue);
            metrics::counter!("gateway_field_issues_total", "field" => issue.field).increment(1);
        }

        let value = event.to_json_bytes()?;
        let key = event.partition_key().to_vec();
        let handle = self.producer.publish(key, value).await?;
        increment("gateway_events_accepted_total", 1);

        let partition = handle.partition();
        if !self.ack_level.waits_for_delivery() {
            return Ok(IngestAck::Enqueued {
                event_id: event.event_id,
                partition,
            });
        }

        match handle.wait().await {
            DeliveryResult::Acked { partition, offset } => Ok(IngestAck::Delivered {
                event_id: event.event_id,
                partition,
                offset,
            }),
            DeliveryResult::Failed {
                partition, reason, ..
            } => {
                increment_with_reason("gateway_events_rejected_total", "delivery_failed", 1);
                Err(IngestError::DeliveryFailed { partition, reason })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakestream_log::{MemoryLog, ProducerConfig, partition_for_key};
    use std::time::Duration;

    fn gateway_with(log: Arc<MemoryLog>, ack_level: AckLevel) -> Gateway {
        let config = ProducerConfig {
            ack_level,
            max_retries: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..Default::default()
        };
        Gateway::new(Arc::new(Producer::new(log, config)))
    }

    const VALID: &[u8] = br#"{
        "event_id": "e-1",
        "event_type": "add_to_cart",
        "session_id": "s1",
        "user_id": 7,
        "timestamp": "2024-05-01T10:00:00Z",
        "product_id": "P1234"
    }"#;

    #[tokio::test]
    async fn test_valid_event_produces_one_record() {
        let log = Arc::new(MemoryLog::new("events", 3));
        let gateway = gateway_with(log.clone(), AckLevel::Leader);

        let ack = gateway.ingest(VALID).await.unwrap();
        let partition = partition_for_key(b"s1", 3);
        assert_eq!(
            ack,
            IngestAck::Delivered {
                event_id: "e-1".into(),
                partition,
                offset: 0
            }
        );

        assert_eq!(log.len(), 1);
        let record = &log.records(partition)[0];
        assert_eq!(record.key, b"s1");
        let value: serde_json::Value = serde_json::from_slice(&record.value).unwrap();
        assert_eq!(value["product_id"], "P1234");
    }

    #[tokio::test]
    async fn test_missing_required_field_produces_nothing() {
        let log = Arc::new(MemoryLog::new("events", 3));
        let gateway = gateway_with(log.clone(), AckLevel::Leader);

        let payloads: [&[u8]; 4] = [
            br#"{"event_type": "page_view", "session_id": "s1"}"#,
            br#"{"event_id": "e", "session_id": "s1"}"#,
            br#"{"event_id": "e", "event_type": "page_view"}"#,
            b"not json",
        ];
        for payload in payloads {
            let err = gateway.ingest(payload).await.unwrap_err();
            assert!(matches!(err, IngestError::InvalidEvent(_)));
        }
        assert!(log.is_empty());
        assert_eq!(log.append_attempts(), 0);
    }

    #[tokio::test]
    async fn test_fire_and_forget_returns_enqueued() {
        let log = Arc::new(MemoryLog::new("events", 1));
        let gateway = gateway_with(log.clone(), AckLevel::None);

        let ack = gateway.ingest(VALID).await.unwrap();
        assert!(matches!(ack, IngestAck::Enqueued { partition: 0, .. }));

        gateway.producer().close().await;
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_surfaces() {
        let log = Arc::new(MemoryLog::new("events", 1));
        log.set_unavailable(true);
        let gateway = gateway_with(log.clone(), AckLevel::All);

        let err = gateway.ingest(VALID).await.unwrap_err();
        assert!(matches!(err, IngestError::DeliveryFailed { partition: 0, .. }));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_closed_producer_is_unavailable() {
        let log = Arc::new(MemoryLog::new("events", 1));
        let gateway = gateway_with(log, AckLevel::Leader);
        gateway.producer().close().await;

        assert!(matches!(
            gateway.ingest(VALID).await,
            Err(IngestError::Unavailable(LogError::Closed))
        ));
    }
}
