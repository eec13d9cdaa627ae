//! Ingestion loop
//!
//! Poll → normalize → upsert → flush → acknowledge, one cycle at a time. A
//! batch is acknowledged only after all of its writes are durable; a batch
//! that cannot be written is rolled back and rewound for re-delivery.

use crate::error::LoaderError;
use crate::metrics::LoaderStats;
use crate::normalizer::EventNormalizer;
use crate::queue::{PollBatch, QueueConsumer, batch_len};
use crate::recovery::{RecoveryOutcome, RecoveryStateMachine};
use crate::store::DatabaseSession;
use crate::writer::WriteBatcher;
use services_common::{LoaderConfig, OrderbookSnapshot};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, error, info, warn};

/// Process-local cycle state, owned by the loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleState {
    /// Writes issued since the last durable commit
    pub unflushed: usize,
    /// Snapshot most recently handed to the writer
    pub last_snapshot: Option<OrderbookSnapshot>,
}

/// What one cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Poll returned nothing; no writes, no checkpoint
    Idle,
    /// Batch durable and checkpoint acknowledged
    Acknowledged {
        /// Snapshots in the batch that were written
        written: usize,
        /// Messages dropped as malformed
        dropped: usize,
    },
    /// Batch rolled back; the queue will re-deliver it
    Abandoned,
}

#[derive(Debug, Default)]
struct BatchWrite {
    written: usize,
    dropped: usize,
}

/// The single-threaded ingestion loop of one instrument instance
#[derive(Debug)]
pub struct IngestionLoop<Q, S> {
    queue: Q,
    writer: WriteBatcher<S>,
    normalizer: EventNormalizer,
    recovery: RecoveryStateMachine,
    poll_timeout: Duration,
    state: CycleState,
    rewind_pending: bool,
    stats: Arc<LoaderStats>,
}

impl<Q, S> IngestionLoop<Q, S>
where
    Q: QueueConsumer,
    S: DatabaseSession,
{
    /// Build a loop over already-connected handles
    pub fn new(config: &LoaderConfig, queue: Q, session: S) -> Self {
        Self {
            queue,
            writer: WriteBatcher::new(session, config.commit_count),
            normalizer: EventNormalizer::new(config.utc_offset),
            recovery: RecoveryStateMachine::new(config.cooldown),
            poll_timeout: config.poll_timeout,
            state: CycleState::default(),
            rewind_pending: false,
            stats: Arc::new(LoaderStats::default()),
        }
    }

    /// Shared counters
    #[must_use]
    pub fn stats(&self) -> Arc<LoaderStats> {
        Arc::clone(&self.stats)
    }

    /// Current cycle state
    #[must_use]
    pub const fn cycle_state(&self) -> &CycleState {
        &self.state
    }

    /// The writer
    #[must_use]
    pub const fn writer(&self) -> &WriteBatcher<S> {
        &self.writer
    }

    /// Run cycles until `shutdown` fires or its sender is dropped
    ///
    /// Shutdown is observed between cycles; a cycle in progress always
    /// finishes.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "Ingestion loop started (poll timeout {:?}, cooldown {:?})",
            self.poll_timeout,
            self.recovery.cooldown()
        );

        loop {
            match shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) | Err(TryRecvError::Closed | TryRecvError::Lagged(_)) => break,
            }

            let outcome = self.run_cycle().await;
            debug!("Cycle finished: {:?}", outcome);
        }

        let stats = self.stats.snapshot();
        info!("Ingestion loop stopped: {:?}", stats);
    }

    /// Run exactly one poll cycle
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if self.rewind_pending {
            if let Err(e) = self.queue.rewind().await {
                self.recovery.pause_after(&LoaderError::Queue(e)).await;
                return CycleOutcome::Abandoned;
            }
            self.rewind_pending = false;
        }

        let batch = match self.queue.poll(self.poll_timeout).await {
            Ok(batch) => batch,
            Err(e) => {
                self.recovery.pause_after(&LoaderError::Queue(e)).await;
                return CycleOutcome::Idle;
            }
        };

        let total = batch_len(&batch);
        if total == 0 {
            return CycleOutcome::Idle;
        }
        LoaderStats::add(&self.stats.messages_received, total as u64);
        debug!("Polled {} messages from {} partitions", total, batch.len());

        let (snapshots, dropped) = self.normalize_batch(&batch);
        let outcome = match self.write_batch(&snapshots).await {
            Some(write) => {
                // counted once per batch, not once per replay
                LoaderStats::add(&self.stats.malformed_dropped, write.dropped as u64);
                self.acknowledge(write.written, dropped + write.dropped).await
            }
            None => self.abandon().await,
        };

        self.state.unflushed = self.writer.unflushed();
        self.stats.commits.store(self.writer.commits(), Ordering::Relaxed);
        outcome
    }

    fn normalize_batch(&self, batch: &PollBatch) -> (Vec<OrderbookSnapshot>, usize) {
        let mut snapshots = Vec::with_capacity(batch_len(batch));
        let mut dropped = 0;

        for message in batch.values().flatten() {
            match self.normalizer.normalize(&message.payload) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    warn!(
                        "Dropping message at partition {} offset {}: {}",
                        message.partition, message.offset, e
                    );
                    LoaderStats::incr(&self.stats.malformed_dropped);
                    dropped += 1;
                }
            }
        }
        (snapshots, dropped)
    }

    /// Write every snapshot; `None` when the batch was abandoned
    async fn write_batch(&mut self, snapshots: &[OrderbookSnapshot]) -> Option<BatchWrite> {
        let max_repairs = snapshots
            .iter()
            .map(|s| (s.instrument.as_str(), s.event_date))
            .collect::<BTreeSet<_>>()
            .len()
            + 1;
        let mut repairs = 0;
        let mut result = BatchWrite::default();
        let mut index = 0;

        while let Some(snapshot) = snapshots.get(index) {
            self.state.last_snapshot = Some(snapshot.clone());

            match self.writer.upsert(snapshot).await {
                Ok(()) => {
                    LoaderStats::incr(&self.stats.snapshots_written);
                    index += 1;
                }
                Err(LoaderError::MalformedEvent { reason }) => {
                    warn!("Dropping snapshot of {}: {}", snapshot.instrument, reason);
                    result.dropped += 1;
                    index += 1;
                }
                Err(fault) => {
                    let outcome = self
                        .recovery
                        .handle(&fault, snapshot, &mut self.writer, &self.stats)
                        .await;
                    match outcome {
                        RecoveryOutcome::Repaired => {
                            repairs += 1;
                            if repairs > max_repairs {
                                error!("Gave up after {} schema repairs in one batch", repairs);
                                return None;
                            }
                            // the repair rolled back everything since the last commit
                            index = 0;
                            result.dropped = 0;
                        }
                        RecoveryOutcome::BatchAbandoned => return None,
                    }
                }
            }
            self.state.unflushed = self.writer.unflushed();
        }

        result.written = snapshots.len() - result.dropped;
        Some(result)
    }

    async fn acknowledge(&mut self, written: usize, dropped: usize) -> CycleOutcome {
        if let Err(fault) = self.writer.flush().await {
            self.recovery
                .handle_batch_fault(&fault, &mut self.writer, &self.stats)
                .await;
            return self.abandon().await;
        }

        match self.queue.commit().await {
            Ok(()) => {
                LoaderStats::incr(&self.stats.checkpoints);
                debug!("Checkpoint acknowledged ({} written, {} dropped)", written, dropped);
                CycleOutcome::Acknowledged { written, dropped }
            }
            Err(e) => {
                // writes are durable; re-delivery only replays them
                self.recovery.pause_after(&LoaderError::Queue(e)).await;
                self.abandon().await
            }
        }
    }

    async fn abandon(&mut self) -> CycleOutcome {
        if let Err(e) = self.writer.abort().await {
            warn!("Rollback of abandoned batch failed: {}", e);
        }
        if let Err(e) = self.queue.rewind().await {
            error!("Rewind failed, retrying before next poll: {}", e);
            self.rewind_pending = true;
        }
        LoaderStats::incr(&self.stats.abandoned_batches);
        warn!("Batch abandoned for re-delivery");
        CycleOutcome::Abandoned
    }
}
