//! Write batching
//!
//! Upserts snapshots into the open transaction and commits every
//! `commit_count` writes. Re-applying a snapshot overwrites its row, so
//! writes lost to a rollback can always be replayed.

use crate::error::{LoaderError, LoaderResult, StoreFault};
use crate::schema::{TableName, level_columns, name_for};
use crate::store::{DatabaseSession, Statement};
use services_common::OrderbookSnapshot;
use tracing::debug;

/// `INSERT ... ON CONFLICT (event_time, event_date) DO UPDATE` for a parent table
///
/// Binds: `$1` event_time, `$2` event_date, `$3..$22` level values in
/// [`level_columns`] order.
#[must_use]
pub fn upsert_sql(table: &TableName) -> String {
    let columns: Vec<String> = level_columns().collect();
    let placeholders: Vec<String> = (1..=columns.len() + 2).map(|i| format!("${i}")).collect();
    let updates: Vec<String> = columns.iter().map(|c| format!("{c} = EXCLUDED.{c}")).collect();

    format!(
        "INSERT INTO {} (event_time, event_date, {}) VALUES ({}) \
         ON CONFLICT (event_time, event_date) DO UPDATE SET {}",
        table.quoted(),
        columns.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    )
}

/// Transactional upsert writer with count-based commits
#[derive(Debug)]
pub struct WriteBatcher<S> {
    session: S,
    commit_count: usize,
    unflushed: usize,
    commits: u64,
}

impl<S: DatabaseSession> WriteBatcher<S> {
    /// Wrap a session; `commit_count` is clamped to at least 1
    pub fn new(session: S, commit_count: usize) -> Self {
        Self {
            session,
            commit_count: commit_count.max(1),
            unflushed: 0,
            commits: 0,
        }
    }

    /// Writes issued since the last durable commit
    #[must_use]
    pub const fn unflushed(&self) -> usize {
        self.unflushed
    }

    /// Durable commits performed so far
    #[must_use]
    pub const fn commits(&self) -> u64 {
        self.commits
    }

    /// Underlying session, for schema provisioning
    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Insert or overwrite the row of `snapshot`; commits when the threshold is reached
    ///
    /// # Errors
    /// - [`LoaderError::TableMissing`] when the instrument table does not exist
    /// - [`LoaderError::PartitionMissing`] when no partition covers `event_date`
    /// - [`LoaderError::ConnectionLost`] when the connection failed
    /// - [`LoaderError::TransactionAborted`] on any other store fault
    pub async fn upsert(&mut self, snapshot: &OrderbookSnapshot) -> LoaderResult<()> {
        let table = name_for(&snapshot.instrument, None)?;
        let statement = Statement::UpsertSnapshot {
            table: table.clone(),
            snapshot,
        };

        if let Err(fault) = self.session.execute(&statement).await {
            return Err(match fault {
                StoreFault::UndefinedRelation(_) => LoaderError::TableMissing {
                    table: table.to_string(),
                },
                StoreFault::PartitionRouting(_) => LoaderError::PartitionMissing {
                    table: table.to_string(),
                    event_date: snapshot.event_date,
                },
                other => LoaderError::from(other),
            });
        }

        self.unflushed += 1;
        if self.unflushed >= self.commit_count {
            self.commit().await?;
        }
        Ok(())
    }

    /// Commit any unflushed writes regardless of the threshold
    ///
    /// Returns how many writes became durable.
    ///
    /// # Errors
    /// Mapped store fault when the commit fails; the writes stay unflushed.
    pub async fn flush(&mut self) -> LoaderResult<usize> {
        if self.unflushed == 0 {
            return Ok(0);
        }
        let flushed = self.unflushed;
        self.commit().await?;
        Ok(flushed)
    }

    /// Roll back the open transaction and forget unflushed writes
    ///
    /// # Errors
    /// Mapped store fault when the rollback itself fails; the counter is
    /// zeroed either way.
    pub async fn abort(&mut self) -> LoaderResult<()> {
        let discarded = std::mem::take(&mut self.unflushed);
        if discarded > 0 {
            debug!("Discarding {} unflushed writes", discarded);
        }
        self.session.rollback().await.map_err(LoaderError::from)
    }

    /// Rebuild the store connection and forget unflushed writes
    ///
    /// # Errors
    /// [`LoaderError::ConnectionLost`] when the new connection cannot be established.
    pub async fn reset_connection(&mut self) -> LoaderResult<()> {
        self.unflushed = 0;
        self.session.reconnect().await.map_err(LoaderError::from)
    }

    async fn commit(&mut self) -> LoaderResult<()> {
        self.session.commit().await.map_err(LoaderError::from)?;
        debug!("Committed {} writes", self.unflushed);
        self.unflushed = 0;
        self.commits += 1;
        Ok(())
    }
}
