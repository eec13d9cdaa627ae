//! Error types for the order-book loader
//!
//! Three layers:
//! - [`StoreFault`]: the fault categories a database session can raise
//! - [`QueueError`]: transport faults of the queue consumer
//! - [`LoaderError`]: the pipeline taxonomy the recovery state machine dispatches on

use chrono::NaiveDate;
use thiserror::Error;

/// Fault categories raised by a [`DatabaseSession`](crate::store::DatabaseSession)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreFault {
    /// Statement referenced a relation that does not exist
    #[error("Undefined relation: {0}")]
    UndefinedRelation(String),

    /// Row could not be routed to any partition of its table
    #[error("No partition for row: {0}")]
    PartitionRouting(String),

    /// Object already exists or a concurrent creation raced
    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    /// Any other transactional error (deadlock, query error, type mismatch)
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The connection or the driver interface failed
    #[error("Connection failure: {0}")]
    Connection(String),
}

/// Queue transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Polling for messages failed
    #[error("Queue poll failed: {0}")]
    Poll(String),

    /// Acknowledging the checkpoint failed
    #[error("Queue commit failed: {0}")]
    Commit(String),

    /// Seeking back to the last checkpoint failed
    #[error("Queue rewind failed: {0}")]
    Rewind(String),

    /// Consumer could not be created or subscribed
    #[error("Queue setup failed: {0}")]
    Setup(String),
}

/// Pipeline error taxonomy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    /// Message cannot be turned into a snapshot; dropped, never retried
    #[error("Malformed event: {reason}")]
    MalformedEvent {
        /// What is wrong with the payload
        reason: String,
    },

    /// Target table does not exist
    #[error("Table {table} does not exist")]
    TableMissing {
        /// Table name
        table: String,
    },

    /// Table exists but no partition covers the row's date
    #[error("Table {table} has no partition for {event_date}")]
    PartitionMissing {
        /// Table name
        table: String,
        /// Date that needs a partition
        event_date: NaiveDate,
    },

    /// Transaction failed; unflushed writes are lost and re-delivered
    #[error("Transaction aborted: {reason}")]
    TransactionAborted {
        /// Driver message
        reason: String,
    },

    /// Store connection failed; session must be rebuilt
    #[error("Store connection lost: {reason}")]
    ConnectionLost {
        /// Driver message
        reason: String,
    },

    /// Concurrent schema creation raced; benign
    #[error("Schema conflict: {reason}")]
    SchemaConflict {
        /// Driver message
        reason: String,
    },

    /// Queue transport failure
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl LoaderError {
    /// Shorthand for a malformed-event error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            reason: reason.into(),
        }
    }
}

impl From<StoreFault> for LoaderError {
    /// Generic mapping; writers refine `UndefinedRelation` / `PartitionRouting`
    /// with the table and date they were writing
    fn from(fault: StoreFault) -> Self {
        match fault {
            StoreFault::UndefinedRelation(reason)
            | StoreFault::PartitionRouting(reason)
            | StoreFault::Transaction(reason) => Self::TransactionAborted { reason },
            StoreFault::SchemaConflict(reason) => Self::SchemaConflict { reason },
            StoreFault::Connection(reason) => Self::ConnectionLost { reason },
        }
    }
}

/// Type alias for loader results
pub type LoaderResult<T> = Result<T, LoaderError>;
