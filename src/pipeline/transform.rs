//! Transform stage: filter, normalize and categorize.
//!
//! Rules, applied in order:
//! 1. keep records with `amount > 0`
//! 2. upper-case `customer_id`
//! 3. assign a [`Category`] from the amount
//!
//! The stage is pure and idempotent on its own output.

use std::collections::HashSet;

use rust_decimal::Decimal;
use tracing::{error, info};

use super::Stage;
use crate::dataset::{Category, Dataset, TransactionRecord};
use crate::error::StageError;

/// Transforms the upstream dataset, or fails if there is none.
pub fn transform(input: Option<&Dataset>) -> Result<Dataset, StageError> {
    let Some(input) = input else {
        let err = StageError::MissingInput {
            stage: Stage::Transform,
        };
        error!(kind = err.kind(), error = %err, "Transformation skipped");
        return Err(err);
    };

    match transform_dataset(input) {
        Ok(output) => {
            let counts = output.category_counts();
            let count = |c: Category| counts.get(&c).copied().unwrap_or(0);
            info!(
                input_rows = input.len(),
                kept = output.len(),
                dropped = input.len() - output.len(),
                low = count(Category::Low),
                medium = count(Category::Medium),
                high = count(Category::High),
                "Transformed records"
            );
            Ok(output)
        }
        Err(e) => {
            error!(input_rows = input.len(), kind = e.kind(), error = %e, "Transformation failed");
            Err(e)
        }
    }
}

/// Applies the transformation rules to every record of `input`.
pub fn transform_dataset(input: &Dataset) -> Result<Dataset, StageError> {
    let mut seen = HashSet::with_capacity(input.len());
    for record in input.records() {
        if !seen.insert(record.transaction_id) {
            return Err(StageError::Transform(format!(
                "duplicate transaction_id {}",
                record.transaction_id
            )));
        }
    }

    let records = input
        .records()
        .iter()
        .filter(|r| r.amount > Decimal::ZERO)
        .map(transform_record)
        .collect();

    Ok(input.replace_records(records))
}

fn transform_record(record: &TransactionRecord) -> TransactionRecord {
    TransactionRecord {
        transaction_id: record.transaction_id,
        customer_id: record.customer_id.to_uppercase(),
        amount: record.amount,
        transaction_date: record.transaction_date,
        category: Some(Category::for_amount(record.amount)),
    }
}
