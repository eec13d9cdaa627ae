//! Order-book snapshot loader
//!
//! Consumes one instrument's order-book stream from a message queue and
//! persists every snapshot into a day-partitioned Postgres table, creating
//! tables and partitions on first use.
//!
//! Features:
//! - Idempotent upserts keyed by `(event_time, event_date)`
//! - Commit every `commit_count` writes, checkpoint only after a durable flush
//! - Lazy table/partition provisioning with repair-and-retry
//! - Rollback, rewind and reconnect on transaction or connection faults

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod error;
pub mod metrics;
pub mod normalizer;
pub mod pipeline;
pub mod queue;
pub mod recovery;
pub mod schema;
pub mod store;
pub mod writer;

pub use error::{LoaderError, LoaderResult, QueueError, StoreFault};
pub use metrics::{LoaderStats, LoaderStatsSnapshot};
pub use normalizer::EventNormalizer;
pub use pipeline::{CycleOutcome, CycleState, IngestionLoop};
pub use queue::{PollBatch, QueueConsumer, QueueMessage};
pub use recovery::{RecoveryOutcome, RecoveryState, RecoveryStateMachine};
pub use schema::{TableName, ensure_partition, ensure_table, name_for};
pub use store::{DatabaseSession, Statement};
pub use writer::WriteBatcher;
