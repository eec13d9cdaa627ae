//! Kafka consumer
//!
//! Assigns the configured topic partition directly (no group rebalancing),
//! with auto-commit disabled. Offsets are committed explicitly for exactly
//! the messages delivered since the previous commit, and a rewind seeks back
//! to the first of them.

use super::{PollBatch, QueueConsumer, QueueMessage, batch_len};
use crate::error::QueueError;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use services_common::LoaderConfig;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivered-but-unacknowledged range of one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    first: i64,
    next: i64,
}

/// [`QueueConsumer`] over an rdkafka [`StreamConsumer`]
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
    max_poll_records: usize,
    pending: BTreeMap<i32, Cursor>,
}

impl fmt::Debug for KafkaConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaConsumer")
            .field("topic", &self.topic)
            .field("max_poll_records", &self.max_poll_records)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl KafkaConsumer {
    /// Create the consumer and assign `config.partition` of `config.topic_name`
    ///
    /// Consumption resumes from the group's committed offset, or from the
    /// earliest retained message when none exists.
    ///
    /// # Errors
    /// [`QueueError::Setup`] when the client cannot be created or assigned.
    pub fn new(config: &LoaderConfig) -> Result<Self, QueueError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_name)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| QueueError::Setup(e.to_string()))?;

        let mut assignment = TopicPartitionList::new();
        assignment.add_partition(&config.topic_name, config.partition);
        consumer
            .assign(&assignment)
            .map_err(|e| QueueError::Setup(e.to_string()))?;

        info!(
            "Assigned {}[{}] for group {}",
            config.topic_name, config.partition, config.group_name
        );

        Ok(Self {
            consumer,
            topic: config.topic_name.clone(),
            max_poll_records: config.max_poll_records,
            pending: BTreeMap::new(),
        })
    }
}

fn record(pending: &mut BTreeMap<i32, Cursor>, batch: &mut PollBatch, message: QueueMessage) {
    pending
        .entry(message.partition)
        .and_modify(|cursor| cursor.next = message.offset + 1)
        .or_insert(Cursor {
            first: message.offset,
            next: message.offset + 1,
        });
    batch.entry(message.partition).or_default().push(message);
}

#[async_trait]
impl QueueConsumer for KafkaConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<PollBatch, QueueError> {
        let mut batch = PollBatch::new();

        let first = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(batch),
            Ok(received) => received.map_err(|e| QueueError::Poll(e.to_string()))?,
        };
        record(&mut self.pending, &mut batch, owned(&first));
        drop(first);

        // drain what is already buffered without waiting again
        while batch_len(&batch) < self.max_poll_records {
            match tokio::time::timeout(Duration::ZERO, self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    let message = owned(&message);
                    record(&mut self.pending, &mut batch, message);
                }
                Ok(Err(e)) => {
                    warn!("Kafka error while draining poll: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(batch)
    }

    async fn commit(&mut self) -> Result<(), QueueError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut offsets = TopicPartitionList::new();
        for (&partition, cursor) in &self.pending {
            offsets
                .add_partition_offset(&self.topic, partition, Offset::Offset(cursor.next))
                .map_err(|e| QueueError::Commit(e.to_string()))?;
        }
        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| QueueError::Commit(e.to_string()))?;

        self.pending.clear();
        Ok(())
    }

    async fn rewind(&mut self) -> Result<(), QueueError> {
        for (&partition, cursor) in &self.pending {
            self.consumer
                .seek(&self.topic, partition, Offset::Offset(cursor.first), SEEK_TIMEOUT)
                .map_err(|e| QueueError::Rewind(e.to_string()))?;
            info!("Rewound {}[{}] to offset {}", self.topic, partition, cursor.first);
        }
        self.pending.clear();
        Ok(())
    }
}

fn owned<M: Message>(message: &M) -> QueueMessage {
    QueueMessage {
        partition: message.partition(),
        offset: message.offset(),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}
