//! Extract stage: full-table read from the source database.

use std::time::Instant;

use tracing::{error, info};

use crate::dataset::Dataset;
use crate::error::StageError;
use crate::storage::{RecordSource, TableName};

/// Reads every row of `table` into a dataset.
pub async fn extract(source: &dyn RecordSource, table: &TableName) -> Result<Dataset, StageError> {
    let started = Instant::now();

    match source.fetch_all(table).await {
        Ok(records) => {
            let dataset = Dataset::new(table.to_string(), records);
            info!(
                source = %source.describe(),
                table = %table,
                rows = dataset.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Extracted records"
            );
            Ok(dataset)
        }
        Err(e) => {
            error!(
                source = %source.describe(),
                table = %table,
                kind = e.kind(),
                error = %e,
                "Extraction failed"
            );
            Err(e)
        }
    }
}
