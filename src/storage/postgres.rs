//! PostgreSQL source and sink.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Column, Connection, Executor, Postgres, QueryBuilder, Row, Statement, TypeInfo, ValueRef};
use tracing::{debug, warn};

use super::{
    insert_prefix, row_range, ConnectionDescriptor, LoadSummary, RecordSink, RecordSource,
    SourceColumns, TableName,
};
use crate::dataset::TransactionRecord;
use crate::error::StageError;

/// Largest bind-parameter count PostgreSQL accepts in one statement.
const MAX_BIND_PARAMS: usize = 65_535;

/// PostgreSQL-backed [`RecordSource`] and [`RecordSink`].
pub struct PostgresStore {
    descriptor: ConnectionDescriptor,
    connect_timeout: Duration,
}

impl PostgresStore {
    pub fn new(descriptor: ConnectionDescriptor, connect_timeout: Duration) -> Self {
        Self {
            descriptor,
            connect_timeout,
        }
    }

    async fn connect(&self) -> Result<PgConnection, StageError> {
        let target = self.descriptor.redacted();
        match tokio::time::timeout(
            self.connect_timeout,
            PgConnection::connect(self.descriptor.as_str()),
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
impl RecordSource for PostgresStore {
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
impl RecordSink for PostgresStore {
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
    conn: &mut PgConnection,
    sql: &str,
    table: &TableName,
) -> Result<(SourceColumns, Vec<PgRow>), StageError> {
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
    conn: &mut PgConnection,
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
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(insert_prefix(table));
        builder.push_values(chunk, |mut row, record| {
            row.push_bind(record.transaction_id)
                .push_bind(record.customer_id.as_str())
                .push_bind(record.amount)
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

fn decode_record(row: &PgRow, columns: &SourceColumns) -> Result<TransactionRecord, String> {
    Ok(TransactionRecord::new(
        decode_i64(row, columns.transaction_id)?,
        decode_string(row, columns.customer_id)?,
        decode_decimal(row, columns.amount)?,
        decode_timestamp(row, columns.transaction_date)?,
    ))
}

fn ensure_not_null(row: &PgRow, idx: usize) -> Result<(), String> {
    let raw = row.try_get_raw(idx).map_err(|e| e.to_string())?;
    if raw.is_null() {
        return Err(format!("column {} is NULL", row.columns()[idx].name()));
    }
    Ok(())
}

fn unsupported(row: &PgRow, idx: usize, expected: &str) -> String {
    let column = &row.columns()[idx];
    format!(
        "column {} has type {} which cannot be read as {}",
        column.name(),
        column.type_info().name(),
        expected
    )
}

fn decode_i64(row: &PgRow, idx: usize) -> Result<i64, String> {
    ensure_not_null(row, idx)?;
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Ok(v);
    }
    if let Ok(v) = row.try_get::<i32, _>(idx) {
        return Ok(v.into());
    }
    if let Ok(v) = row.try_get::<i16, _>(idx) {
        return Ok(v.into());
    }
    if let Ok(v) = row.try_get::<Decimal, _>(idx) {
        if v.fract().is_zero() {
            if let Some(v) = v.to_i64() {
                return Ok(v);
            }
        }
        return Err(format!("value {} is not a 64-bit integer", v));
    }
    Err(unsupported(row, idx, "an integer"))
}

fn decode_string(row: &PgRow, idx: usize) -> Result<String, String> {
    ensure_not_null(row, idx)?;
    row.try_get::<String, _>(idx)
        .map_err(|_| unsupported(row, idx, "text"))
}

fn decode_decimal(row: &PgRow, idx: usize) -> Result<Decimal, String> {
    ensure_not_null(row, idx)?;
    if let Ok(v) = row.try_get::<Decimal, _>(idx) {
        return Ok(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return Decimal::try_from(v).map_err(|e| format!("amount {}: {}", v, e));
    }
    if let Ok(v) = row.try_get::<f32, _>(idx) {
        return Decimal::try_from(v).map_err(|e| format!("amount {}: {}", v, e));
    }
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Ok(Decimal::from(v));
    }
    if let Ok(v) = row.try_get::<i32, _>(idx) {
        return Ok(Decimal::from(v));
    }
    Err(unsupported(row, idx, "a decimal"))
}

fn decode_timestamp(row: &PgRow, idx: usize) -> Result<NaiveDateTime, String> {
    ensure_not_null(row, idx)?;
    if let Ok(v) = row.try_get::<NaiveDateTime, _>(idx) {
        return Ok(v);
    }
    if let Ok(v) = row.try_get::<DateTime<Utc>, _>(idx) {
        return Ok(v.naive_utc());
    }
    if let Ok(v) = row.try_get::<NaiveDate, _>(idx) {
        return Ok(v.and_time(NaiveTime::MIN));
    }
    Err(unsupported(row, idx, "a timestamp"))
}

#[cfg(test)]
mod tests {
    //! These tests need a reachable PostgreSQL server.
    //! Run with: ETL_TEST_POSTGRES_URL=postgres://... cargo test -- --ignored

    use super::*;
    use crate::dataset::Category;

    fn test_url() -> String {
        std::env::var("ETL_TEST_POSTGRES_URL")
            .expect("ETL_TEST_POSTGRES_URL environment variable must be set for PostgreSQL tests")
    }

    fn date(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    async fn reset_tables(url: &str) {
        let mut conn = PgConnection::connect(url).await.unwrap();
        for sql in [
            "DROP TABLE IF EXISTS etl_test_source",
            "DROP TABLE IF EXISTS etl_test_dest",
            "CREATE TABLE etl_test_source (TRANSACTION_ID BIGINT PRIMARY KEY, CUSTOMER_ID TEXT NOT NULL, AMOUNT NUMERIC(12,2) NOT NULL, TRANSACTION_DATE TIMESTAMP NOT NULL, REGION TEXT)",
            "CREATE TABLE etl_test_dest (TRANSACTION_ID BIGINT PRIMARY KEY, CUSTOMER_ID TEXT NOT NULL, AMOUNT NUMERIC(12,2) NOT NULL, TRANSACTION_DATE TIMESTAMP NOT NULL, CATEGORY TEXT NOT NULL)",
            "INSERT INTO etl_test_source VALUES (1, 'abc', 50.00, '2024-01-01 10:00:00', 'EU'), (2, 'def', 250.50, '2024-01-02 10:00:00', NULL)",
        ] {
            sqlx::query(sql).execute(&mut conn).await.unwrap();
        }
        conn.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_fetch_all_reads_rows() {
        let url = test_url();
        reset_tables(&url).await;
        let store = PostgresStore::new(ConnectionDescriptor::new(&url), Duration::from_secs(10));

        let mut records = store
            .fetch_all(&TableName::parse("etl_test_source").unwrap())
            .await
            .expect("fetch should succeed");
        records.sort_by_key(|r| r.transaction_id);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].customer_id, "abc");
        assert_eq!(records[1].amount, "250.50".parse::<Decimal>().unwrap());
        assert_eq!(records[0].transaction_date, date(1));
    }

    #[tokio::test]
    #[ignore]
    async fn test_insert_all_rolls_back_on_conflict() {
        let url = test_url();
        reset_tables(&url).await;
        let store = PostgresStore::new(ConnectionDescriptor::new(&url), Duration::from_secs(10));
        let table = TableName::parse("etl_test_dest").unwrap();

        let records = vec![
            TransactionRecord::new(1, "ABC", Decimal::from(50), date(1)).with_category(Category::Low),
            TransactionRecord::new(2, "DEF", Decimal::from(60), date(2)).with_category(Category::Low),
            TransactionRecord::new(1, "ABC", Decimal::from(50), date(1)).with_category(Category::Low),
        ];
        let result = store.insert_all(&table, &records, 2).await;
        assert!(matches!(result, Err(StageError::Load { .. })));

        let mut conn = PgConnection::connect(&url).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM etl_test_dest")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let store = PostgresStore::new(
            ConnectionDescriptor::new("postgres://etl:pw@127.0.0.1:1/none"),
            Duration::from_secs(5),
        );
        let err = store
            .fetch_all(&TableName::parse("SALES_TRANSACTIONS").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Connection { .. }));
        assert!(!err.to_string().contains(":pw@"));
    }
}
