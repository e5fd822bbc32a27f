//! SQLite source and sink.
//!
//! SQLite has no native decimal type, so amounts are written as text and
//! read back from text, real or integer storage.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Column, Connection, Executor, QueryBuilder, Row, Sqlite, Statement, ValueRef};
use tracing::{debug, warn};

use super::{
    insert_prefix, row_range, ConnectionDescriptor, LoadSummary, RecordSink, RecordSource,
    SourceColumns, TableName,
};
use crate::dataset::TransactionRecord;
use crate::error::StageError;

/// Default SQLite bind-parameter limit.
const MAX_BIND_PARAMS: usize = 32_766;

const TEXT_TIMESTAMP_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];

/// SQLite-backed [`RecordSource`] and [`RecordSink`].
pub struct SqliteStore {
    descriptor: ConnectionDescriptor,
    connect_timeout: Duration,
}

impl SqliteStore {
    pub fn new(descriptor: ConnectionDescriptor, connect_timeout: Duration) -> Self {
        Self {
            descriptor,
            connect_timeout,
        }
    }

    async fn connect(&self) -> Result<SqliteConnection, StageError> {
        let target = self.descriptor.redacted();
        match tokio::time::timeout(
            self.connect_timeout,
            SqliteConnection::connect(self.descriptor.as_str()),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(StageError::connection(target, e)),
            Err(_) => Err(StageError::connection(
                target,
                format!("timed out after {:?}", self.connect_timeout),
            )),
        }
    }
}

#[async_trait]
impl RecordSource for SqliteStore {
    async fn fetch_all(&self, table: &TableName) -> Result<Vec<TransactionRecord>, StageError> {
        let mut conn = self.connect().await?;
        let sql = format!("SELECT * FROM {}", table);
        let result = read_rows(&mut conn, &sql, table).await;

        if let Err(e) = conn.close().await {
            warn!(target = %self.descriptor, error = %e, "Failed to close source connection");
        }

        let (columns, rows) = result?;
        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                decode_record(row, &columns)
                    .map_err(|msg| StageError::query(table.to_string(), format!("row {}: {}", i, msg)))
            })
            .collect()
    }

    fn describe(&self) -> String {
        self.descriptor.redacted()
    }
}

#[async_trait]
impl RecordSink for SqliteStore {
    async fn insert_all(
        &self,
        table: &TableName,
        records: &[TransactionRecord],
        batch_size: usize,
    ) -> Result<LoadSummary, StageError> {
        let mut conn = self.connect().await?;
        let result = write_in_transaction(&mut conn, table, records, batch_size).await;

        if let Err(e) = conn.close().await {
            warn!(target = %self.descriptor, error = %e, "Failed to close destination connection");
        }

        result
    }

    fn describe(&self) -> String {
        self.descriptor.redacted()
    }
}

/// Prepares the query so that the required columns are checked even when
/// the table is empty, then fetches every row.
async fn read_rows(
    conn: &mut SqliteConnection,
    sql: &str,
    table: &TableName,
) -> Result<(SourceColumns, Vec<SqliteRow>), StageError> {
    let statement = (&mut *conn)
        .prepare(sql)
        .await
        .map_err(|e| StageError::query(table.to_string(), e))?;
    let columns = SourceColumns::resolve(statement.columns(), table)?;
    let rows = statement
        .query()
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| StageError::query(table.to_string(), e))?;
    Ok((columns, rows))
}

async fn write_in_transaction(
    conn: &mut SqliteConnection,
    table: &TableName,
    records: &[TransactionRecord],
    batch_size: usize,
) -> Result<LoadSummary, StageError> {
    let batch_size = batch_size.clamp(1, MAX_BIND_PARAMS / super::DESTINATION_COLUMNS.len());
    let mut tx = conn
        .begin()
        .await
        .map_err(|e| StageError::load(table.to_string(), e))?;

    let mut summary = LoadSummary::default();
    for (chunk_index, chunk) in records.chunks(batch_size).enumerate() {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(insert_prefix(table));
        builder.push_values(chunk, |mut row, record| {
            row.push_bind(record.transaction_id)
                .push_bind(record.customer_id.as_str())
                .push_bind(record.amount.to_string())
                .push_bind(record.transaction_date)
                .push_bind(record.category.map(|c| c.as_str()));
        });

        match builder.build().execute(&mut *tx).await {
            Ok(done) => {
                summary.rows_inserted += done.rows_affected();
                summary.batches += 1;
                debug!(
                    table = %table,
                    batch = chunk_index,
                    rows = chunk.len(),
                    "Inserted batch"
                );
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(table = %table, error = %rollback_err, "Rollback failed");
                }
                return Err(StageError::load(
                    table.to_string(),
                    format!("{}: {}", row_range(chunk_index, batch_size, chunk.len()), e),
                ));
            }
        }
    }

    tx.commit()
        .await
        .map_err(|e| StageError::load(table.to_string(), format!("commit failed: {}", e)))?;

    Ok(summary)
}

fn decode_record(row: &SqliteRow, columns: &SourceColumns) -> Result<TransactionRecord, String> {
    Ok(TransactionRecord::new(
        decode_i64(row, columns.transaction_id)?,
        decode_string(row, columns.customer_id)?,
        decode_decimal(row, columns.amount)?,
        decode_timestamp(row, columns.transaction_date)?,
    ))
}

fn ensure_not_null(row: &SqliteRow, idx: usize) -> Result<(), String> {
    let raw = row.try_get_raw(idx).map_err(|e| e.to_string())?;
    if raw.is_null() {
        return Err(format!("column {} is NULL", row.columns()[idx].name()));
    }
    Ok(())
}

fn column_name(row: &SqliteRow, idx: usize) -> &str {
    row.columns()[idx].name()
}

fn decode_i64(row: &SqliteRow, idx: usize) -> Result<i64, String> {
    ensure_not_null(row, idx)?;
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Ok(v);
    }
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return v
            .trim()
            .parse()
            .map_err(|_| format!("column {} value '{}' is not an integer", column_name(row, idx), v));
    }
    Err(format!("column {} cannot be read as an integer", column_name(row, idx)))
}

fn decode_string(row: &SqliteRow, idx: usize) -> Result<String, String> {
    ensure_not_null(row, idx)?;
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return Ok(v);
    }
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Ok(v.to_string());
    }
    Err(format!("column {} cannot be read as text", column_name(row, idx)))
}

fn decode_decimal(row: &SqliteRow, idx: usize) -> Result<Decimal, String> {
    ensure_not_null(row, idx)?;
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return v
            .trim()
            .parse()
            .map_err(|e| format!("column {} value '{}': {}", column_name(row, idx), v, e));
    }
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Ok(Decimal::from(v));
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return Decimal::try_from(v).map_err(|e| format!("amount {}: {}", v, e));
    }
    Err(format!("column {} cannot be read as a decimal", column_name(row, idx)))
}

fn decode_timestamp(row: &SqliteRow, idx: usize) -> Result<NaiveDateTime, String> {
    ensure_not_null(row, idx)?;
    if let Ok(v) = row.try_get::<NaiveDateTime, _>(idx) {
        return Ok(v);
    }
    if let Ok(v) = row.try_get::<NaiveDate, _>(idx) {
        return Ok(v.and_time(NaiveTime::MIN));
    }
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return parse_text_timestamp(&v)
            .ok_or_else(|| format!("column {} value '{}' is not a timestamp", column_name(row, idx), v));
    }
    Err(format!("column {} cannot be read as a timestamp", column_name(row, idx)))
}

fn parse_text_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    TEXT_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}
