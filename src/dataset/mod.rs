//! In-memory dataset handed from stage to stage.
//!
//! A [`Dataset`] is an ordered list of [`TransactionRecord`]s plus the
//! provenance of the extraction that produced it. The [`columnar`] module
//! converts it to and from Arrow record batches, which is the format used
//! for stage checkpoints.

pub mod columnar;
pub mod record;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use record::{Category, TransactionRecord, HIGH_THRESHOLD, MEDIUM_THRESHOLD};

/// Ordered collection of transaction records produced by one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Table the records were extracted from.
    pub source_table: String,
    /// When the extraction finished.
    pub extracted_at: DateTime<Utc>,
    records: Vec<TransactionRecord>,
}

impl Dataset {
    /// Creates a dataset stamped with the current time.
    pub fn new(source_table: impl Into<String>, records: Vec<TransactionRecord>) -> Self {
        Self {
            source_table: source_table.into(),
            extracted_at: Utc::now(),
            records,
        }
    }

    /// Creates a dataset with an explicit extraction timestamp.
    pub fn with_extracted_at(mut self, extracted_at: DateTime<Utc>) -> Self {
        self.extracted_at = extracted_at;
        self
    }

    /// Returns a dataset with the same provenance but different records.
    pub fn replace_records(&self, records: Vec<TransactionRecord>) -> Self {
        Self {
            source_table: self.source_table.clone(),
            extracted_at: self.extracted_at,
            records,
        }
    }

    pub fn records(&self) -> &[TransactionRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<TransactionRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn transaction_ids(&self) -> Vec<i64> {
        self.records.iter().map(|r| r.transaction_id).collect()
    }

    /// Counts records per category; untransformed records are not counted.
    pub fn category_counts(&self) -> BTreeMap<Category, usize> {
        let mut counts = BTreeMap::new();
        for category in self.records.iter().filter_map(|r| r.category) {
            *counts.entry(category).or_insert(0) += 1;
        }
        counts
    }
}
