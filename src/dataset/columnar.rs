//! Arrow conversion for datasets.
//!
//! Amounts are stored as their decimal text, which keeps the exact value
//! and scale of every record. Dates are stored as zone-less nanosecond
//! timestamps. Provenance travels in the schema metadata.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Int64Array, Int64Builder, StringArray, StringBuilder,
    TimestampNanosecondArray, TimestampNanosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::{Category, Dataset, TransactionRecord};
use crate::error::CheckpointError;

const META_SOURCE_TABLE: &str = "sales_etl.source_table";
const META_EXTRACTED_AT: &str = "sales_etl.extracted_at";

/// Arrow schema of a checkpointed dataset.
pub fn dataset_schema(metadata: HashMap<String, String>) -> Schema {
    Schema::new_with_metadata(
        vec![
            Field::new("transaction_id", DataType::Int64, false),
            Field::new("customer_id", DataType::Utf8, false),
            Field::new("amount", DataType::Utf8, false),
            Field::new(
                "transaction_date",
                DataType::Timestamp(TimeUnit::Nanosecond, None),
                false,
            ),
            Field::new("category", DataType::Utf8, true),
        ],
        metadata,
    )
}

/// Converts a dataset into a single Arrow record batch.
///
/// Fails when a transaction date lies outside the nanosecond timestamp
/// range (years 1677 to 2262).
pub fn to_record_batch(dataset: &Dataset) -> Result<RecordBatch, CheckpointError> {
    let mut metadata = HashMap::new();
    metadata.insert(META_SOURCE_TABLE.to_string(), dataset.source_table.clone());
    metadata.insert(
        META_EXTRACTED_AT.to_string(),
        dataset.extracted_at.to_rfc3339(),
    );
    let schema = Arc::new(dataset_schema(metadata));

    let mut transaction_id = Int64Builder::new();
    let mut customer_id = StringBuilder::new();
    let mut amount = StringBuilder::new();
    let mut transaction_date = TimestampNanosecondBuilder::new();
    let mut category = StringBuilder::new();

    for record in dataset.records() {
        transaction_id.append_value(record.transaction_id);
        customer_id.append_value(&record.customer_id);
        amount.append_value(record.amount.to_string());

        let nanos = record
            .transaction_date
            .and_utc()
            .timestamp_nanos_opt()
            .ok_or_else(|| {
                CheckpointError::Corrupt(format!(
                    "transaction {}: date {} out of timestamp range",
                    record.transaction_id, record.transaction_date
                ))
            })?;
        transaction_date.append_value(nanos);

        match record.category {
            Some(c) => category.append_value(c.as_str()),
            None => category.append_null(),
        }
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(transaction_id.finish()),
        Arc::new(customer_id.finish()),
        Arc::new(amount.finish()),
        Arc::new(transaction_date.finish()),
        Arc::new(category.finish()),
    ];

    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Rebuilds a dataset from record batches written by [`to_record_batch`].
pub fn from_record_batches(batches: &[RecordBatch]) -> Result<Dataset, CheckpointError> {
    let Some(first) = batches.first() else {
        return Err(CheckpointError::Corrupt("no record batches".to_string()));
    };

    let metadata = first.schema().metadata().clone();
    let source_table = metadata
        .get(META_SOURCE_TABLE)
        .cloned()
        .ok_or_else(|| CheckpointError::Corrupt(format!("missing {}", META_SOURCE_TABLE)))?;
    let extracted_at = metadata
        .get(META_EXTRACTED_AT)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| CheckpointError::Corrupt(format!("missing {}", META_EXTRACTED_AT)))?;

    let mut records = Vec::new();
    for batch in batches {
        records.extend(batch_records(batch)?);
    }

    Ok(Dataset::new(source_table, records).with_extracted_at(extracted_at))
}

fn batch_records(batch: &RecordBatch) -> Result<Vec<TransactionRecord>, CheckpointError> {
    let ids = column::<Int64Array>(batch, "transaction_id")?;
    let customers = column::<StringArray>(batch, "customer_id")?;
    let amounts = column::<StringArray>(batch, "amount")?;
    let dates = column::<TimestampNanosecondArray>(batch, "transaction_date")?;
    let categories = column::<StringArray>(batch, "category")?;

    let mut records = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let amount = amounts
            .value(i)
            .parse::<Decimal>()
            .map_err(|e| CheckpointError::Corrupt(format!("row {}: {}", i, e)))?;
        let transaction_date = DateTime::from_timestamp_nanos(dates.value(i)).naive_utc();
        let category = if categories.is_null(i) {
            None
        } else {
            Some(
                categories
                    .value(i)
                    .parse::<Category>()
                    .map_err(CheckpointError::Corrupt)?,
            )
        };

        records.push(TransactionRecord {
            transaction_id: ids.value(i),
            customer_id: customers.value(i).to_string(),
            amount,
            transaction_date,
            category,
        });
    }

    Ok(records)
}

fn column<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<&'a T, CheckpointError> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<T>())
        .ok_or_else(|| CheckpointError::Corrupt(format!("column '{}' missing or mistyped", name)))
}
