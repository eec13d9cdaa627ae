//! Schema provisioning
//!
//! One range-partitioned table per instrument, one partition per venue-local
//! calendar day. Names come from [`name_for`] and are the only dynamic text
//! ever interpolated into DDL.

use crate::error::{LoaderError, LoaderResult, StoreFault};
use crate::store::{DatabaseSession, Statement};
use chrono::NaiveDate;
use services_common::BOOK_DEPTH;
use std::fmt;
use tracing::{debug, info};

/// Suffix shared by every loader table
pub const TABLE_SUFFIX: &str = "upbit_orderbook";

/// Postgres identifier limit (NAMEDATALEN - 1)
const MAX_IDENTIFIER_LEN: usize = 63;

/// Validated table identifier, `[a-z0-9_]` only
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName(String);

impl TableName {
    /// Bare name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted identifier for SQL text
    #[must_use]
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic table name for an instrument, or for one of its daily
/// partitions when `date` is given
///
/// `("BTC", None)` → `btc_upbit_orderbook`,
/// `("BTC", 2023-11-15)` → `btc_upbit_orderbook_20231115`.
///
/// # Errors
/// [`LoaderError::MalformedEvent`] when the instrument contains characters
/// outside `[A-Za-z0-9]` or the name would exceed the identifier limit.
pub fn name_for(instrument: &str, date: Option<NaiveDate>) -> LoaderResult<TableName> {
    if instrument.is_empty() || !instrument.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(LoaderError::malformed(format!(
            "instrument '{instrument}' cannot name a table"
        )));
    }

    let mut name = format!("{}_{TABLE_SUFFIX}", instrument.to_ascii_lowercase());
    if let Some(date) = date {
        name.push('_');
        name.push_str(&date.format("%Y%m%d").to_string());
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(LoaderError::malformed(format!("table name '{name}' too long")));
    }
    debug_assert!(name.chars().all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_')));

    Ok(TableName(name))
}

/// Level column names in storage order: `up_bid_price1, up_bid_vol1, up_ask_price1, ...`
pub fn level_columns() -> impl Iterator<Item = String> {
    (1..=BOOK_DEPTH).flat_map(|n| {
        [
            format!("up_bid_price{n}"),
            format!("up_bid_vol{n}"),
            format!("up_ask_price{n}"),
            format!("up_ask_vol{n}"),
        ]
    })
}

/// `CREATE TABLE` for an instrument's parent table
#[must_use]
pub fn create_table_sql(table: &TableName) -> String {
    let levels: Vec<String> = level_columns()
        .map(|c| format!("    {c} NUMERIC(20,10)"))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    \
         event_time NUMERIC(20,5) NOT NULL,\n    \
         event_date DATE NOT NULL,\n\
         {},\n    \
         PRIMARY KEY (event_time, event_date)\n\
         ) PARTITION BY RANGE (event_date)",
        table.quoted(),
        levels.join(",\n")
    )
}

/// `CREATE TABLE ... PARTITION OF` covering `[from, to)`
#[must_use]
pub fn create_partition_sql(
    parent: &TableName,
    partition: &TableName,
    from: NaiveDate,
    to: NaiveDate,
) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} FOR VALUES FROM ('{}') TO ('{}')",
        partition.quoted(),
        parent.quoted(),
        from.format("%Y-%m-%d"),
        to.format("%Y-%m-%d")
    )
}

/// Create the parent table of `instrument` if absent and commit
///
/// # Errors
/// [`LoaderError::SchemaConflict`] when a concurrent creation raced (the
/// transaction has already been rolled back); other store faults map through
/// [`LoaderError::from`].
pub async fn ensure_table<S>(session: &mut S, instrument: &str) -> LoaderResult<TableName>
where
    S: DatabaseSession + ?Sized,
{
    let table = name_for(instrument, None)?;
    let statement = Statement::CreateTable { table: table.clone() };

    run_ddl(session, &statement).await?;
    info!("Ensured table {}", table);
    Ok(table)
}

/// Create the `[event_date, next_date)` partition of `instrument` if absent and commit
///
/// # Errors
/// [`LoaderError::TableMissing`] when the parent table does not exist,
/// [`LoaderError::SchemaConflict`] on a creation race, otherwise the mapped
/// store fault.
pub async fn ensure_partition<S>(
    session: &mut S,
    instrument: &str,
    event_date: NaiveDate,
    next_date: NaiveDate,
) -> LoaderResult<TableName>
where
    S: DatabaseSession + ?Sized,
{
    let parent = name_for(instrument, None)?;
    let partition = name_for(instrument, Some(event_date))?;
    let statement = Statement::CreatePartition {
        parent: parent.clone(),
        partition: partition.clone(),
        from: event_date,
        to: next_date,
    };

    run_ddl(session, &statement).await?;
    info!("Ensured partition {} [{}, {})", partition, event_date, next_date);
    Ok(partition)
}

async fn run_ddl<S>(session: &mut S, statement: &Statement<'_>) -> LoaderResult<()>
where
    S: DatabaseSession + ?Sized,
{
    debug!("Executing DDL on {}", statement.table());
    let result = match session.execute(statement).await {
        Ok(_) => session.commit().await,
        Err(fault) => Err(fault),
    };

    match result {
        Ok(()) => Ok(()),
        Err(fault) => Err(ddl_error(session, statement, fault).await),
    }
}

async fn ddl_error<S>(session: &mut S, statement: &Statement<'_>, fault: StoreFault) -> LoaderError
where
    S: DatabaseSession + ?Sized,
{
    let error = match (fault, statement) {
        (StoreFault::UndefinedRelation(_), Statement::CreatePartition { parent, .. }) => {
            LoaderError::TableMissing {
                table: parent.to_string(),
            }
        }
        (fault, _) => LoaderError::from(fault),
    };

    if matches!(error, LoaderError::ConnectionLost { .. }) {
        return error;
    }
    match session.rollback().await {
        Ok(()) => error,
        Err(StoreFault::Connection(reason)) => LoaderError::ConnectionLost { reason },
        Err(_) => error,
    }
}
