//! Postgres session
//!
//! One pooled connection, one lazily opened transaction held across writes
//! until `commit` or `rollback`. Driver errors are classified by SQLSTATE into
//! [`StoreFault`] categories.

use super::{DatabaseSession, Statement};
use crate::error::StoreFault;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Postgres-backed [`DatabaseSession`]
pub struct PgSession {
    database_url: String,
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl fmt::Debug for PgSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the url may carry credentials
        f.debug_struct("PgSession")
            .field("pool_size", &self.pool.size())
            .field("in_transaction", &self.tx.is_some())
            .finish_non_exhaustive()
    }
}

impl PgSession {
    /// Connect to `database_url`
    ///
    /// # Errors
    /// [`StoreFault::Connection`] when no connection can be established.
    pub async fn connect(database_url: &str) -> Result<Self, StoreFault> {
        let pool = open_pool(database_url).await?;
        info!("Connected to Postgres");
        Ok(Self {
            database_url: database_url.to_string(),
            pool,
            tx: None,
        })
    }

    async fn transaction(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreFault> {
        if self.tx.is_none() {
            let tx = self.pool.begin().await.map_err(|e| classify(&e, false))?;
            self.tx = Some(tx);
        }
        self.tx
            .as_mut()
            .ok_or_else(|| StoreFault::Connection("transaction unavailable".to_string()))
    }
}

async fn open_pool(database_url: &str) -> Result<PgPool, StoreFault> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await
        .map_err(|e| StoreFault::Connection(e.to_string()))
}

#[async_trait]
impl DatabaseSession for PgSession {
    async fn execute(&mut self, statement: &Statement<'_>) -> Result<u64, StoreFault> {
        let sql = statement.sql();
        let ddl = statement.is_ddl();
        let tx = self.transaction().await?;

        let mut query = sqlx::query(&sql);
        if let Statement::UpsertSnapshot { snapshot, .. } = statement {
            query = query.bind(snapshot.event_time).bind(snapshot.event_date);
            for value in snapshot.level_values() {
                query = query.bind(value);
            }
        }

        let result = query.execute(&mut **tx).await.map_err(|e| classify(&e, ddl))?;
        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> Result<(), StoreFault> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await.map_err(|e| classify(&e, false))?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreFault> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await.map_err(|e| classify(&e, false))?;
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), StoreFault> {
        self.tx = None;
        let pool = open_pool(&self.database_url).await?;
        let stale = std::mem::replace(&mut self.pool, pool);
        tokio::spawn(async move { stale.close().await });
        warn!("Postgres connection replaced");
        Ok(())
    }
}

/// Classify a driver error; `ddl` marks schema-definition statements
#[must_use]
pub fn classify(error: &sqlx::Error, ddl: bool) -> StoreFault {
    match error {
        sqlx::Error::Database(db) => classify_code(db.code().as_deref(), db.message(), ddl),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreFault::Connection(error.to_string()),
        _ => StoreFault::Transaction(error.to_string()),
    }
}

/// Classify a server error by SQLSTATE
#[must_use]
pub fn classify_code(code: Option<&str>, message: &str, ddl: bool) -> StoreFault {
    let message = message.to_string();
    match code {
        // undefined_table
        Some("42P01") => StoreFault::UndefinedRelation(message),
        Some(code) if code.starts_with("23") && message.contains("no partition of relation") => {
            StoreFault::PartitionRouting(message)
        }
        // duplicate_table, or the catalog unique index losing a creation race
        Some("42P07" | "23505") if ddl => StoreFault::SchemaConflict(message),
        Some(code) if code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03") => {
            StoreFault::Connection(message)
        }
        _ => StoreFault::Transaction(message),
    }
}
