//! Load stage: transactional insert into the destination table.

use std::time::Instant;

use tracing::{error, info};

use super::Stage;
use crate::dataset::Dataset;
use crate::error::StageError;
use crate::storage::{LoadSummary, RecordSink, TableName};

/// Inserts every record of the transformed dataset into `table`.
///
/// Records that did not pass through the transform stage are refused
/// before any connection is opened.
pub async fn load(
    sink: &dyn RecordSink,
    table: &TableName,
    input: Option<&Dataset>,
    batch_size: usize,
) -> Result<LoadSummary, StageError> {
    let started = Instant::now();

    let result = match input {
        None => Err(StageError::MissingInput { stage: Stage::Load }),
        Some(dataset) => match check_loadable(dataset, table) {
            Ok(()) => sink.insert_all(table, dataset.records(), batch_size).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(summary) => {
            info!(
                destination = %sink.describe(),
                table = %table,
                rows = summary.rows_inserted,
                batches = summary.batches,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Loaded records"
            );
            Ok(summary)
        }
        Err(e) => {
            error!(
                destination = %sink.describe(),
                table = %table,
                kind = e.kind(),
                error = %e,
                "Load failed"
            );
            Err(e)
        }
    }
}

fn check_loadable(dataset: &Dataset, table: &TableName) -> Result<(), StageError> {
    match dataset.records().iter().find(|r| !r.is_loadable()) {
        Some(record) => Err(StageError::load(
            table.to_string(),
            format!(
                "transaction {} is not loadable (amount {}, category {:?})",
                record.transaction_id, record.amount, record.category
            ),
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Category, TransactionRecord};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl RecordSink for RecordingSink {
        async fn insert_all(
            &self,
            _table: &TableName,
            records: &[crate::dataset::TransactionRecord],
            batch_size: usize,
        ) -> Result<LoadSummary, StageError> {
            self.calls.lock().unwrap().push(records.len());
            Ok(LoadSummary {
                rows_inserted: records.len() as u64,
                batches: records.len().div_ceil(batch_size),
            })
        }

        fn describe(&self) -> String {
            "recording://sink".to_string()
        }
    }

    fn table() -> TableName {
        TableName::parse("ANALYTICS_TRANSACTIONS").unwrap()
    }

    fn record(id: i64, amount: i64) -> TransactionRecord {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        TransactionRecord::new(id, "ABC", Decimal::from(amount), date)
    }

    #[tokio::test]
    async fn test_load_transformed_dataset() {
        let sink = RecordingSink::default();
        let dataset = Dataset::new(
            "SALES_TRANSACTIONS",
            vec![
                record(1, 50).with_category(Category::Low),
                record(2, 700).with_category(Category::High),
            ],
        );

        let summary = load(&sink, &table(), Some(&dataset), 1).await.unwrap();
        assert_eq!(summary.rows_inserted, 2);
        assert_eq!(summary.batches, 2);
    }

    #[tokio::test]
    async fn test_load_empty_dataset_succeeds() {
        let sink = RecordingSink::default();
        let dataset = Dataset::new("SALES_TRANSACTIONS", vec![]);

        let summary = load(&sink, &table(), Some(&dataset), 500).await.unwrap();
        assert_eq!(summary.rows_inserted, 0);
        assert_eq!(*sink.calls.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_refuses_untransformed_records() {
        let sink = RecordingSink::default();
        let dataset = Dataset::new("SALES_TRANSACTIONS", vec![record(1, 50)]);

        let err = load(&sink, &table(), Some(&dataset), 500).await.unwrap_err();
        assert!(matches!(err, StageError::Load { .. }));
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refuses_non_positive_amounts() {
        let sink = RecordingSink::default();
        let dataset = Dataset::new(
            "SALES_TRANSACTIONS",
            vec![record(1, -5).with_category(Category::Low)],
        );

        assert!(load(&sink, &table(), Some(&dataset), 500).await.is_err());
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_input() {
        let sink = RecordingSink::default();
        let err = load(&sink, &table(), None, 500).await.unwrap_err();
        assert!(matches!(err, StageError::MissingInput { stage: Stage::Load }));
    }
}
