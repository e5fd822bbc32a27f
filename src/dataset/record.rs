//! Row-level types: one sales transaction and its derived category.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lower bound (inclusive) of the `MEDIUM` category.
pub const MEDIUM_THRESHOLD: Decimal = Decimal::from_parts(100, 0, 0, false, 0);

/// Lower bound (inclusive) of the `HIGH` category.
pub const HIGH_THRESHOLD: Decimal = Decimal::from_parts(500, 0, 0, false, 0);

/// Amount bucket derived during transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    /// `amount < 100`
    Low,
    /// `100 <= amount < 500`
    Medium,
    /// `amount >= 500`
    High,
}

impl Category {
    /// All categories in ascending order.
    pub const ALL: [Category; 3] = [Category::Low, Category::Medium, Category::High];

    /// Classifies an amount into half-open bins `[.., 100)`, `[100, 500)`, `[500, ..)`.
    pub fn for_amount(amount: Decimal) -> Self {
        if amount < MEDIUM_THRESHOLD {
            Category::Low
        } else if amount < HIGH_THRESHOLD {
            Category::Medium
        } else {
            Category::High
        }
    }

    /// Label written to the destination `CATEGORY` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Low => "LOW",
            Category::Medium => "MEDIUM",
            Category::High => "HIGH",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Category::Low),
            "MEDIUM" => Ok(Category::Medium),
            "HIGH" => Ok(Category::High),
            other => Err(format!("unknown category '{}'", other)),
        }
    }
}

/// One row of the source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Unique identifier of the transaction.
    pub transaction_id: i64,
    /// Customer reference, upper-cased by the transformer.
    pub customer_id: String,
    /// Signed transaction amount.
    pub amount: Decimal,
    /// When the transaction happened (no time zone).
    pub transaction_date: NaiveDateTime,
    /// Derived bucket; `None` until the record has been transformed.
    #[serde(default)]
    pub category: Option<Category>,
}

impl TransactionRecord {
    /// Creates an untransformed record.
    pub fn new(
        transaction_id: i64,
        customer_id: impl Into<String>,
        amount: Decimal,
        transaction_date: NaiveDateTime,
    ) -> Self {
        Self {
            transaction_id,
            customer_id: customer_id.into(),
            amount,
            transaction_date,
            category: None,
        }
    }

    /// Sets the category.
    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    /// Returns `true` if the record may be written to the destination.
    pub fn is_loadable(&self) -> bool {
        self.amount > Decimal::ZERO && self.category.is_some()
    }
}
