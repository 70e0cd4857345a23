//! At-least-once producer.
//!
//! Records are routed to a partition by key and queued on that partition's
//! worker. Each worker delivers its queue strictly in order: a record is not
//! attempted until the one before it has been acknowledged or has failed, so
//! records sharing a key reach the log in publish order even across retries.
//!
//! Transient broker errors are retried with exponential backoff, bounded by
//! both a retry count and a total delivery timeout measured from `publish`.
//! An append still running when the timeout fires is waited for before the
//! worker moves on, and its outcome is what gets reported.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{AckLevel, LogBroker};
use crate::error::{LogError, Result};
use crate::partitioner::partition_for_key;

/// Configuration for the producer.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Durability required before a record counts as delivered.
    /// Default: leader
    pub ack_level: AckLevel,

    /// Retries after the first attempt.
    /// Default: 5
    pub max_retries: u32,

    /// Delay before the first retry; doubles on every further retry.
    /// Default: 100 ms
    pub initial_backoff: Duration,

    /// Upper bound on a single backoff delay.
    /// Default: 5 seconds
    pub max_backoff: Duration,

    /// Total time a record may spend between publish and delivery.
    /// Default: 30 seconds
    pub delivery_timeout: Duration,

    /// Records queued per partition before `publish` waits.
    /// Default: 10,000
    pub queue_capacity: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            ack_level: AckLevel::Leader,
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(30),
            queue_capacity: 10_000,
        }
    }
}

impl ProducerConfig {
    /// Delay before retry number `retry` (1-based).
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Final outcome of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The broker stored the record at `offset`.
    Acked { partition: u32, offset: u64 },

    /// The record was not delivered.
    Failed {
        partition: u32,
        reason: String,
        attempts: u32,
    },
}

impl DeliveryResult {
    pub fn is_acked(&self) -> bool {
        matches!(self, Self::Acked { .. })
    }

    pub fn partition(&self) -> u32 {
        match self {
            Self::Acked { partition, .. } | Self::Failed { partition, .. } => *partition,
        }
    }
}

/// Handle to the outcome of one publish.
#[derive(Debug)]
pub struct DeliveryHandle {
    partition: u32,
    rx: oneshot::Receiver<DeliveryResult>,
}

impl DeliveryHandle {
    /// Partition the record was routed to.
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Wait for the delivery outcome.
    pub async fn wait(self) -> DeliveryResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => DeliveryResult::Failed {
                partition: self.partition,
                reason: "producer stopped before delivery".to_string(),
                attempts: 0,
            },
        }
    }
}

struct OutboundRecord {
    key: Vec<u8>,
    value: Vec<u8>,
}

struct QueuedRecord {
    record: Arc<OutboundRecord>,
    enqueued_at: Instant,
    reply: oneshot::Sender<DeliveryResult>,
}

/// At-least-once producer over a [`LogBroker`].
///
/// Safe to share between many concurrent callers.
pub struct Producer {
    broker: Arc<dyn LogBroker>,
    config: ProducerConfig,
    queues: RwLock<Option<Vec<mpsc::Sender<QueuedRecord>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Producer {
    /// Start a producer with one worker task per partition.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(broker: Arc<dyn LogBroker>, config: ProducerConfig) -> Self {
        let partitions = broker.partitions();
        let mut queues = Vec::with_capacity(partitions as usize);
        let mut workers = Vec::with_capacity(partitions as usize);

        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            queues.push(tx);
            workers.push(tokio::spawn(run_partition_worker(
                Arc::clone(&broker),
                partition,
                config.clone(),
                rx,
            )));
        }

        info!(
            "Producer started: topic={}, partitions={}, ack={}, max_retries={}, delivery_timeout={:?}",
            broker.topic(),
            partitions,
            config.ack_level,
            config.max_retries,
            config.delivery_timeout
        );

        Self {
            broker,
            config,
            queues: RwLock::new(Some(queues)),
            workers: Mutex::new(workers),
        }
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Partition a key maps to.
    pub fn partition_for(&self, key: &[u8]) -> u32 {
        partition_for_key(key, self.broker.partitions())
    }

    /// Queue a record for delivery.
    ///
    /// Waits only while the partition queue is full. Fails with
    /// [`LogError::Closed`] after [`close`](Self::close).
    pub async fn publish(&self, key: Vec<u8>, value: Vec<u8>) -> Result<DeliveryHandle> {
        let partition = self.partition_for(&key);
        let queue = self
            .queues
            .read()
            .as_ref()
            .and_then(|queues| queues.get(partition as usize).cloned())
            .ok_or(LogError::Closed)?;

        let (reply, rx) = oneshot::channel();
        let queued = QueuedRecord {
            record: Arc::new(OutboundRecord { key, value }),
            enqueued_at: Instant::now(),
            reply,
        };
        queue.send(queued).await.map_err(|_| LogError::Closed)?;

        Ok(DeliveryHandle { partition, rx })
    }

    /// Stop accepting records and wait until every queued record is resolved.
    pub async fn close(&self) {
        let queues = self.queues.write().take();
        drop(queues);

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Producer worker ended abnormally: {}", e);
            }
        }
        info!("Producer closed");
    }
}

async fn run_partition_worker(
    broker: Arc<dyn LogBroker>,
    partition: u32,
    config: ProducerConfig,
    mut rx: mpsc::Receiver<QueuedRecord>,
) {
    while let Some(queued) = rx.recv().await {
        let result = deliver(&broker, partition, &config, &queued).await;

        match &result {
            DeliveryResult::Acked { .. } => {
                metrics::counter!("producer_records_acked_total").increment(1);
            }
            DeliveryResult::Failed {
                reason, attempts, ..
            } => {
                metrics::counter!("producer_records_failed_total").increment(1);
                warn!(
                    "Delivery to partition {} failed after {} attempts: {}",
                    partition, attempts, reason
                );
            }
        }
        metrics::histogram!("producer_delivery_duration_seconds")
            .record(queued.enqueued_at.elapsed().as_secs_f64());

        // The caller may have stopped waiting (fire-and-forget)
        let _ = queued.reply.send(result);
    }
    debug!("Producer worker for partition {} drained", partition);
}

async fn deliver(
    broker: &Arc<dyn LogBroker>,
    partition: u32,
    config: &ProducerConfig,
    queued: &QueuedRecord,
) -> DeliveryResult {
    let deadline = queued.enqueued_at + config.delivery_timeout;
    let mut attempts = 0u32;

    let failed = |reason: String, attempts: u32| DeliveryResult::Failed {
        partition,
        reason,
        attempts,
    };

    loop {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return failed("delivery timeout exceeded".to_string(), attempts);
        };
        attempts += 1;

        let broker = Arc::clone(broker);
        let record = Arc::clone(&queued.record);
        let ack = config.ack_level;
        let mut append = tokio::task::spawn_blocking(move || {
            broker.append(partition, &record.key, &record.value, ack)
        });

        let joined = match tokio::time::timeout(remaining, &mut append).await {
            Ok(joined) => joined,
            Err(_) => {
                // A blocking append cannot be cancelled
                let joined = append.await;
                if let Ok(Ok(offset)) = joined {
                    warn!(
                        "Append to partition {} finished after the delivery timeout (offset {})",
                        partition, offset
                    );
                    return DeliveryResult::Acked { partition, offset };
                }
                return failed("delivery timeout exceeded".to_string(), attempts);
            }
        };

        let error = match joined {
            Ok(Ok(offset)) => return DeliveryResult::Acked { partition, offset },
            Ok(Err(e)) => e,
            Err(join_err) => return failed(format!("append task failed: {join_err}"), attempts),
        };

        if !error.is_transient() {
            return failed(error.to_string(), attempts);
        }
        if attempts > config.max_retries {
            return failed(format!("retries exhausted: {error}"), attempts);
        }

        let delay = config.backoff(attempts);
        if Instant::now() + delay >= deadline {
            return failed(format!("delivery timeout exceeded: {error}"), attempts);
        }

        metrics::counter!("producer_retries_total").increment(1);
        debug!(
            "Retrying partition {} in {:?} (attempt {}): {}",
            partition, delay, attempts, error
        );
        tokio::time::sleep(delay).await;
    }
}
