//! Database session abstraction
//!
//! The pipeline talks to storage only through [`DatabaseSession`]: typed
//! [`Statement`]s executed inside an implicit transaction that is closed by
//! `commit` or `rollback`. [`postgres::PgSession`] is the production
//! implementation.

pub mod postgres;

use crate::error::StoreFault;
use crate::schema::{self, TableName};
use crate::writer;
use async_trait::async_trait;
use chrono::NaiveDate;
use services_common::OrderbookSnapshot;

/// A statement the pipeline can issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement<'a> {
    /// Create the range-partitioned parent table of an instrument
    CreateTable {
        /// Parent table
        table: TableName,
    },
    /// Create the daily partition `[from, to)` of a parent table
    CreatePartition {
        /// Existing parent table
        parent: TableName,
        /// Partition table
        partition: TableName,
        /// Inclusive lower bound
        from: NaiveDate,
        /// Exclusive upper bound
        to: NaiveDate,
    },
    /// Insert or overwrite one snapshot row
    UpsertSnapshot {
        /// Parent table
        table: TableName,
        /// Row contents
        snapshot: &'a OrderbookSnapshot,
    },
}

impl Statement<'_> {
    /// SQL text; binds (upserts only) follow column order
    #[must_use]
    pub fn sql(&self) -> String {
        match self {
            Self::CreateTable { table } => schema::create_table_sql(table),
            Self::CreatePartition {
                parent,
                partition,
                from,
                to,
            } => schema::create_partition_sql(parent, partition, *from, *to),
            Self::UpsertSnapshot { table, .. } => writer::upsert_sql(table),
        }
    }

    /// Table the statement targets
    #[must_use]
    pub const fn table(&self) -> &TableName {
        match self {
            Self::CreateTable { table } | Self::UpsertSnapshot { table, .. } => table,
            Self::CreatePartition { partition, .. } => partition,
        }
    }

    /// Schema-definition statement
    #[must_use]
    pub const fn is_ddl(&self) -> bool {
        !matches!(self, Self::UpsertSnapshot { .. })
    }
}

/// Transactional database session
///
/// The first `execute` after a `commit`/`rollback` opens a new transaction.
#[async_trait]
pub trait DatabaseSession: Send {
    /// Execute a statement inside the current transaction, returning affected rows
    async fn execute(&mut self, statement: &Statement<'_>) -> Result<u64, StoreFault>;

    /// Durably commit the current transaction (no-op when none is open)
    async fn commit(&mut self) -> Result<(), StoreFault>;

    /// Discard the current transaction (no-op when none is open)
    async fn rollback(&mut self) -> Result<(), StoreFault>;

    /// Drop the connection and establish a fresh one
    async fn reconnect(&mut self) -> Result<(), StoreFault>;
}
