//! Database access for the extract and load stages.
//!
//! This module hides the concrete database behind two small traits:
//! - **RecordSource**: full-table reads of transaction rows
//! - **RecordSink**: transactional, batched inserts of categorized rows
//!
//! PostgreSQL and SQLite are supported through sqlx for both roles. Oracle
//! is supported as a source through the `oracle` crate (cargo feature
//! `oracle`, on by default). Every call opens its own connection and
//! closes it before returning; nothing is pooled.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sales_etl::storage::{self, ConnectionDescriptor, TableName};
//! use std::time::Duration;
//!
//! let descriptor = ConnectionDescriptor::new("postgres://etl:pw@localhost/sales");
//! let source = storage::source_for(&descriptor, Duration::from_secs(30))?;
//! let table = TableName::parse("SALES_TRANSACTIONS")?;
//! let records = source.fetch_all(&table).await?;
//! ```

pub mod connection;
pub mod identifier;
#[cfg(feature = "oracle")]
pub mod oracle_source;
pub mod postgres;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::dataset::TransactionRecord;
use crate::error::StageError;

pub use connection::{Backend, ConnectionDescriptor, OracleCredentials};
pub use identifier::TableName;
#[cfg(feature = "oracle")]
pub use oracle_source::OracleSource;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Destination columns, in insert order.
pub const DESTINATION_COLUMNS: [&str; 5] = [
    "TRANSACTION_ID",
    "CUSTOMER_ID",
    "AMOUNT",
    "TRANSACTION_DATE",
    "CATEGORY",
];

/// Reads transaction rows from a source database.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Reads every row of `table`, in the order the database returns them.
    async fn fetch_all(&self, table: &TableName) -> Result<Vec<TransactionRecord>, StageError>;

    /// Redacted description of the connection target, for logging.
    fn describe(&self) -> String;
}

/// Writes categorized transaction rows to a destination database.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Inserts all records in one transaction, `batch_size` rows per statement.
    ///
    /// Either every record is committed or none is.
    async fn insert_all(
        &self,
        table: &TableName,
        records: &[TransactionRecord],
        batch_size: usize,
    ) -> Result<LoadSummary, StageError>;

    /// Redacted description of the connection target, for logging.
    fn describe(&self) -> String;
}

/// Outcome of a successful load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    /// Rows reported as inserted by the database.
    pub rows_inserted: u64,
    /// Number of `INSERT` statements executed.
    pub batches: usize,
}

/// Returns the source implementation for the descriptor's backend.
pub fn source_for(
    descriptor: &ConnectionDescriptor,
    connect_timeout: Duration,
) -> Result<Arc<dyn RecordSource>, StageError> {
    Ok(match descriptor.backend()? {
        Backend::Postgres => Arc::new(PostgresStore::new(descriptor.clone(), connect_timeout)),
        Backend::Sqlite => Arc::new(SqliteStore::new(descriptor.clone(), connect_timeout)),
        Backend::Oracle => oracle_source(descriptor, connect_timeout)?,
    })
}

#[cfg(feature = "oracle")]
fn oracle_source(
    descriptor: &ConnectionDescriptor,
    connect_timeout: Duration,
) -> Result<Arc<dyn RecordSource>, StageError> {
    Ok(Arc::new(OracleSource::new(descriptor.clone(), connect_timeout)))
}

#[cfg(not(feature = "oracle"))]
fn oracle_source(
    descriptor: &ConnectionDescriptor,
    _connect_timeout: Duration,
) -> Result<Arc<dyn RecordSource>, StageError> {
    Err(StageError::connection(
        descriptor.redacted(),
        "built without the 'oracle' feature",
    ))
}

/// Returns the sink implementation for the descriptor's backend.
pub fn sink_for(
    descriptor: &ConnectionDescriptor,
    connect_timeout: Duration,
) -> Result<Arc<dyn RecordSink>, StageError> {
    Ok(match descriptor.backend()? {
        Backend::Postgres => Arc::new(PostgresStore::new(descriptor.clone(), connect_timeout)),
        Backend::Sqlite => Arc::new(SqliteStore::new(descriptor.clone(), connect_timeout)),
        Backend::Oracle => {
            return Err(StageError::connection(
                descriptor.redacted(),
                "oracle is supported as a source only",
            ))
        }
    })
}

/// Positions of the required source columns within a result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SourceColumns {
    pub transaction_id: usize,
    pub customer_id: usize,
    pub amount: usize,
    pub transaction_date: usize,
}

impl SourceColumns {
    /// Locates the required columns by case-insensitive name.
    ///
    /// Extra columns are ignored; a missing required column is a query error.
    pub(crate) fn resolve<C: sqlx::Column>(
        columns: &[C],
        table: &TableName,
    ) -> Result<Self, StageError> {
        Self::from_names(columns.iter().map(|c| c.name()), table)
    }

    /// Same as [`SourceColumns::resolve`], for column names in result order.
    pub(crate) fn from_names<'a, I>(names: I, table: &TableName) -> Result<Self, StageError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let names: Vec<&str> = names.into_iter().collect();
        let find = |wanted: &str| {
            names
                .iter()
                .position(|name| name.eq_ignore_ascii_case(wanted))
                .ok_or_else(|| {
                    StageError::query(
                        table.to_string(),
                        format!("required column {} not found", wanted),
                    )
                })
        };

        Ok(Self {
            transaction_id: find("TRANSACTION_ID")?,
            customer_id: find("CUSTOMER_ID")?,
            amount: find("AMOUNT")?,
            transaction_date: find("TRANSACTION_DATE")?,
        })
    }
}

/// Builds the `INSERT ... ` prefix shared by both backends.
pub(crate) fn insert_prefix(table: &TableName) -> String {
    format!(
        "INSERT INTO {} ({}) ",
        table,
        DESTINATION_COLUMNS.join(", ")
    )
}

/// Row range label used in load error messages.
pub(crate) fn row_range(chunk_index: usize, batch_size: usize, chunk_len: usize) -> String {
    let start = chunk_index * batch_size;
    format!("rows {}-{}", start, start + chunk_len.saturating_sub(1))
}
