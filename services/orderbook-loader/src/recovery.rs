//! Recovery state machine
//!
//! Every fault raised while writing a poll batch is dispatched here. Schema
//! faults are repaired in place and the failed write is retried; batch-level
//! faults discard the open transaction so the queue re-delivers the batch.
//! Each path ends with a fixed cooldown before returning to `Normal`.

use crate::error::LoaderError;
use crate::metrics::LoaderStats;
use crate::schema;
use crate::store::DatabaseSession;
use crate::writer::WriteBatcher;
use services_common::OrderbookSnapshot;
use std::time::Duration;
use tracing::{error, info, warn};

/// Recovery states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// No fault pending
    Normal,
    /// Creating a missing table (and its partition)
    RepairingSchema,
    /// Creating a missing partition
    RepairingPartition,
    /// Rebuilding the store connection
    ResettingConnection,
    /// Discarding the transaction after a failed write
    Backoff,
}

/// Result of handling one fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The failed write succeeded after repair; writes rolled back by the
    /// repair must be re-applied
    Repaired,
    /// The poll batch must be re-delivered by the queue
    BatchAbandoned,
}

/// Fault dispatcher, owned by the ingestion loop
#[derive(Debug)]
pub struct RecoveryStateMachine {
    state: RecoveryState,
    cooldown: Duration,
}

impl RecoveryStateMachine {
    /// New machine in `Normal`
    #[must_use]
    pub const fn new(cooldown: Duration) -> Self {
        Self {
            state: RecoveryState::Normal,
            cooldown,
        }
    }

    /// Current state; `Normal` between faults
    #[must_use]
    pub const fn state(&self) -> RecoveryState {
        self.state
    }

    /// Configured cooldown
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Handle a fault raised while writing `snapshot`
    pub async fn handle<S: DatabaseSession>(
        &mut self,
        fault: &LoaderError,
        snapshot: &OrderbookSnapshot,
        writer: &mut WriteBatcher<S>,
        stats: &LoaderStats,
    ) -> RecoveryOutcome {
        let outcome = match fault {
            LoaderError::TableMissing { table } => {
                warn!("Table {} missing, provisioning", table);
                self.state = RecoveryState::RepairingSchema;
                self.repair(snapshot, writer, stats, true).await
            }
            LoaderError::PartitionMissing { table, event_date } => {
                warn!("Partition of {} for {} missing, provisioning", table, event_date);
                self.state = RecoveryState::RepairingPartition;
                self.repair(snapshot, writer, stats, false).await
            }
            LoaderError::SchemaConflict { reason } => {
                warn!("Schema conflict while writing, retrying: {}", reason);
                self.state = RecoveryState::RepairingSchema;
                match writer.abort().await {
                    Ok(()) => RecoveryOutcome::Repaired,
                    Err(e) => self.escalate(&e, writer, stats).await,
                }
            }
            other => self.dispatch(other, writer, stats).await,
        };

        self.finish().await;
        outcome
    }

    /// Handle a fault not tied to one snapshot (a failed flush); never repairs
    pub async fn handle_batch_fault<S: DatabaseSession>(
        &mut self,
        fault: &LoaderError,
        writer: &mut WriteBatcher<S>,
        stats: &LoaderStats,
    ) -> RecoveryOutcome {
        let outcome = self.dispatch(fault, writer, stats).await;
        self.finish().await;
        outcome
    }

    /// Log a fault outside the store (queue transport) and cool down
    pub async fn pause_after(&mut self, fault: &LoaderError) {
        error!("Cycle failed: {}", fault);
        self.finish().await;
    }

    async fn dispatch<S: DatabaseSession>(
        &mut self,
        fault: &LoaderError,
        writer: &mut WriteBatcher<S>,
        stats: &LoaderStats,
    ) -> RecoveryOutcome {
        match fault {
            LoaderError::ConnectionLost { reason } => {
                error!("Store connection lost: {}", reason);
                self.reset_connection(writer, stats).await
            }
            LoaderError::TransactionAborted { .. }
            | LoaderError::TableMissing { .. }
            | LoaderError::PartitionMissing { .. }
            | LoaderError::SchemaConflict { .. } => {
                error!(
                    "Transaction aborted, discarding {} unflushed writes: {}",
                    writer.unflushed(),
                    fault
                );
                self.back_off(writer, stats).await
            }
            other => {
                error!("Abandoning cycle: {}", other);
                RecoveryOutcome::BatchAbandoned
            }
        }
    }

    async fn repair<S: DatabaseSession>(
        &mut self,
        snapshot: &OrderbookSnapshot,
        writer: &mut WriteBatcher<S>,
        stats: &LoaderStats,
        with_table: bool,
    ) -> RecoveryOutcome {
        if let Err(e) = writer.abort().await {
            return self.escalate(&e, writer, stats).await;
        }

        if with_table {
            if let Err(e) = provision_table(snapshot, writer).await {
                return self.escalate(&e, writer, stats).await;
            }
        }

        let event_date = snapshot.event_date;
        let partition = match provision_partition(snapshot, writer).await {
            Err(LoaderError::TableMissing { table }) if !with_table => {
                warn!("Table {} missing while provisioning a partition", table);
                self.state = RecoveryState::RepairingSchema;
                match provision_table(snapshot, writer).await {
                    Ok(()) => provision_partition(snapshot, writer).await,
                    Err(e) => Err(e),
                }
            }
            other => other,
        };
        if let Err(e) = partition {
            return self.escalate(&e, writer, stats).await;
        }

        match writer.upsert(snapshot).await {
            Ok(()) => {
                LoaderStats::incr(&stats.schema_repairs);
                LoaderStats::incr(&stats.snapshots_written);
                info!("Repaired schema for {} on {}", snapshot.instrument, event_date);
                RecoveryOutcome::Repaired
            }
            Err(e) => self.escalate(&e, writer, stats).await,
        }
    }

    /// A repair step failed: reset on connection loss, otherwise discard the transaction
    async fn escalate<S: DatabaseSession>(
        &mut self,
        fault: &LoaderError,
        writer: &mut WriteBatcher<S>,
        stats: &LoaderStats,
    ) -> RecoveryOutcome {
        error!("Recovery step failed in {:?}: {}", self.state, fault);
        if matches!(fault, LoaderError::ConnectionLost { .. }) {
            self.reset_connection(writer, stats).await
        } else {
            self.back_off(writer, stats).await
        }
    }

    async fn back_off<S: DatabaseSession>(
        &mut self,
        writer: &mut WriteBatcher<S>,
        stats: &LoaderStats,
    ) -> RecoveryOutcome {
        self.state = RecoveryState::Backoff;
        match writer.abort().await {
            Ok(()) => RecoveryOutcome::BatchAbandoned,
            Err(LoaderError::ConnectionLost { reason }) => {
                warn!("Rollback failed on a dead connection: {}", reason);
                self.reset_connection(writer, stats).await
            }
            Err(e) => {
                error!("Rollback failed: {}", e);
                RecoveryOutcome::BatchAbandoned
            }
        }
    }

    async fn reset_connection<S: DatabaseSession>(
        &mut self,
        writer: &mut WriteBatcher<S>,
        stats: &LoaderStats,
    ) -> RecoveryOutcome {
        self.state = RecoveryState::ResettingConnection;
        match writer.reset_connection().await {
            Ok(()) => {
                LoaderStats::incr(&stats.connection_resets);
                info!("Store connection re-established");
            }
            Err(e) => error!("Reconnect failed, retrying next cycle: {}", e),
        }
        RecoveryOutcome::BatchAbandoned
    }

    async fn finish(&mut self) {
        if !self.cooldown.is_zero() {
            info!("Cooling down for {:?}", self.cooldown);
            tokio::time::sleep(self.cooldown).await;
        }
        self.state = RecoveryState::Normal;
    }
}

/// Create the instrument table; a creation race counts as success
async fn provision_table<S: DatabaseSession>(
    snapshot: &OrderbookSnapshot,
    writer: &mut WriteBatcher<S>,
) -> Result<(), LoaderError> {
    tolerate_conflict(schema::ensure_table(writer.session_mut(), &snapshot.instrument).await)
}

async fn provision_partition<S: DatabaseSession>(
    snapshot: &OrderbookSnapshot,
    writer: &mut WriteBatcher<S>,
) -> Result<(), LoaderError> {
    let (event_date, next_date) = snapshot.partition_range();
    let partition = schema::ensure_partition(
        writer.session_mut(),
        &snapshot.instrument,
        event_date,
        next_date,
    )
    .await;
    tolerate_conflict(partition)
}

/// A creation race means the object exists
fn tolerate_conflict<T>(result: Result<T, LoaderError>) -> Result<(), LoaderError> {
    match result {
        Ok(_) => Ok(()),
        Err(LoaderError::SchemaConflict { reason }) => {
            info!("Schema object created concurrently: {}", reason);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
