//! Queue consumer abstraction
//!
//! A consumer delivers raw payloads grouped by partition and acknowledges
//! everything delivered so far with `commit`. `rewind` drops the delivered
//! but unacknowledged messages so the next poll returns them again.

pub mod kafka;

use crate::error::QueueError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// One delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Partition it was read from
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Opaque payload
    pub payload: Vec<u8>,
}

/// Messages of one poll, ordered per partition
pub type PollBatch = BTreeMap<i32, Vec<QueueMessage>>;

/// Checkpointing queue consumer
#[async_trait]
pub trait QueueConsumer: Send {
    /// Wait up to `timeout` for messages; an empty batch means none arrived
    async fn poll(&mut self, timeout: Duration) -> Result<PollBatch, QueueError>;

    /// Acknowledge every message delivered since the previous commit
    async fn commit(&mut self) -> Result<(), QueueError>;

    /// Re-deliver every message since the previous commit on the next poll
    async fn rewind(&mut self) -> Result<(), QueueError>;
}

/// Total message count of a batch
#[must_use]
pub fn batch_len(batch: &PollBatch) -> usize {
    batch.values().map(Vec::len).sum()
}
