//! sales-etl: daily batch ETL for sales transactions.
//!
//! This library extracts every row of a sales table, drops non-positive
//! amounts, upper-cases customer ids, assigns an amount category and loads
//! the result into an analytics table, either as a single standalone pass
//! or as an orchestrated three-task DAG with retries and checkpoints.

pub mod checkpoint;
pub mod cli;
pub mod dataset;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use dataset::{Category, Dataset, TransactionRecord};
pub use error::{CheckpointError, StageError};
pub use pipeline::{EtlPipeline, PipelineConfig};
