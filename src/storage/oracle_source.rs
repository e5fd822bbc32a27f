//! Oracle source.
//!
//! The Oracle client library is blocking, so connecting and reading run on
//! the blocking thread pool. Only reads are supported; the destination is
//! always PostgreSQL or SQLite.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use oracle::{Connection, Row};
use rust_decimal::Decimal;
use tracing::warn;

use super::{ConnectionDescriptor, RecordSource, SourceColumns, TableName};
use crate::dataset::TransactionRecord;
use crate::error::StageError;

const TEXT_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Oracle-backed [`RecordSource`].
pub struct OracleSource {
    descriptor: ConnectionDescriptor,
    connect_timeout: Duration,
}

impl OracleSource {
    pub fn new(descriptor: ConnectionDescriptor, connect_timeout: Duration) -> Self {
        Self {
            descriptor,
            connect_timeout,
        }
    }

    async fn connect(&self) -> Result<Connection, StageError> {
        let credentials = self.descriptor.oracle_credentials()?;
        let target = self.descriptor.redacted();

        let handle = tokio::task::spawn_blocking(move || {
            Connection::connect(
                &credentials.username,
                &credentials.password,
                &credentials.connect_string,
            )
        });

        match tokio::time::timeout(self.connect_timeout, handle).await {
            Ok(Ok(Ok(conn))) => Ok(conn),
            Ok(Ok(Err(e))) => Err(StageError::connection(target, e)),
            Ok(Err(e)) => Err(StageError::connection(target, e)),
            Err(_) => Err(StageError::connection(
                target,
                format!("timed out after {:?}", self.connect_timeout),
            )),
        }
    }
}

#[async_trait]
impl RecordSource for OracleSource {
    async fn fetch_all(&self, table: &TableName) -> Result<Vec<TransactionRecord>, StageError> {
        let conn = self.connect().await?;
        let target = self.descriptor.redacted();
        let table = table.clone();

        tokio::task::spawn_blocking(move || {
            let result = read_table(&conn, &table);
            if let Err(e) = conn.close() {
                warn!(target = %target, error = %e, "Failed to close source connection");
            }
            result
        })
        .await
        .map_err(|e| StageError::connection(self.descriptor.redacted(), e))?
    }

    fn describe(&self) -> String {
        self.descriptor.redacted()
    }
}

fn read_table(conn: &Connection, table: &TableName) -> Result<Vec<TransactionRecord>, StageError> {
    let sql = format!("SELECT * FROM {}", table);
    let rows = conn
        .query(&sql, &[])
        .map_err(|e| StageError::query(table.to_string(), e))?;

    let names: Vec<String> = rows
        .column_info()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let columns = SourceColumns::from_names(names.iter().map(String::as_str), table)?;

    let mut records = Vec::new();
    for (i, row) in rows.enumerate() {
        let row = row.map_err(|e| StageError::query(table.to_string(), format!("row {}: {}", i, e)))?;
        let record = decode_record(&row, &columns, &names)
            .map_err(|msg| StageError::query(table.to_string(), format!("row {}: {}", i, msg)))?;
        records.push(record);
    }
    Ok(records)
}

fn decode_record(
    row: &Row,
    columns: &SourceColumns,
    names: &[String],
) -> Result<TransactionRecord, String> {
    let name = |idx: usize| names.get(idx).map(String::as_str).unwrap_or("?");

    let transaction_id = row
        .get::<usize, Option<i64>>(columns.transaction_id)
        .map_err(|e| format!("column {}: {}", name(columns.transaction_id), e))?
        .ok_or_else(|| format!("column {} is NULL", name(columns.transaction_id)))?;

    let customer_id = row
        .get::<usize, Option<String>>(columns.customer_id)
        .map_err(|e| format!("column {}: {}", name(columns.customer_id), e))?
        .ok_or_else(|| format!("column {} is NULL", name(columns.customer_id)))?;

    let amount_text = row
        .get::<usize, Option<String>>(columns.amount)
        .map_err(|e| format!("column {}: {}", name(columns.amount), e))?
        .ok_or_else(|| format!("column {} is NULL", name(columns.amount)))?;
    let amount = parse_number(&amount_text)
        .map_err(|e| format!("column {}: {}", name(columns.amount), e))?;

    let transaction_date = decode_timestamp(row, columns.transaction_date)
        .map_err(|e| format!("column {}: {}", name(columns.transaction_date), e))?;

    Ok(TransactionRecord::new(
        transaction_id,
        customer_id,
        amount,
        transaction_date,
    ))
}

fn decode_timestamp(row: &Row, idx: usize) -> Result<NaiveDateTime, String> {
    match row.get::<usize, Option<NaiveDateTime>>(idx) {
        Ok(Some(v)) => return Ok(v),
        Ok(None) => return Err("value is NULL".to_string()),
        Err(_) => {}
    }
    if let Ok(Some(v)) = row.get::<usize, Option<NaiveDate>>(idx) {
        return Ok(v.and_time(NaiveTime::MIN));
    }
    let text = row
        .get::<usize, Option<String>>(idx)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "value is NULL".to_string())?;
    TEXT_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text.trim(), fmt).ok())
        .ok_or_else(|| format!("'{}' cannot be read as a timestamp", text))
}

/// Parses the text form of an Oracle `NUMBER`.
///
/// The client may omit the leading zero (`.5`) or use exponent notation
/// for very large or small values.
fn parse_number(text: &str) -> Result<Decimal, String> {
    let text = text.trim();
    let normalized = if let Some(rest) = text.strip_prefix("-.") {
        format!("-0.{}", rest)
    } else if let Some(rest) = text.strip_prefix('.') {
        format!("0.{}", rest)
    } else {
        text.to_string()
    };

    if normalized.contains(['e', 'E']) {
        Decimal::from_scientific(&normalized)
    } else {
        Decimal::from_str(&normalized)
    }
    .map_err(|e| format!("'{}' is not a decimal: {}", text, e))
}
