//! The extract, transform and load stages.
//!
//! This module provides the pipeline itself, independent of scheduling.
//!
//! # Architecture
//!
//! The pipeline consists of three stages, executed strictly in sequence:
//!
//! - **Extract**: reads every row of the source table
//! - **Transform**: drops non-positive amounts, upper-cases customer ids
//!   and assigns a category
//! - **Load**: inserts the result into the destination table in one
//!   transaction
//!
//! Each stage returns `Result<_, StageError>` and logs exactly once per
//! outcome. A failed stage stops the run; no downstream stage ever runs
//! on the output of a failed one.
//!
//! # Run states
//!
//! ```text
//! PENDING ─► EXTRACTING ─► EXTRACTED ─► TRANSFORMING ─► TRANSFORMED ─► LOADING ─► LOADED
//!                 │  ▲                       │  ▲                         │  ▲
//!                 ▼  │ retry                 ▼  │ retry                   ▼  │ retry
//!           EXTRACT_FAILED             TRANSFORM_FAILED               LOAD_FAILED
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use sales_etl::pipeline::{EtlPipeline, PipelineConfig};
//!
//! let config = PipelineConfig::from_env()?;
//! let summary = EtlPipeline::new(config).run_once().await?;
//! println!("loaded {} rows", summary.load.rows_inserted);
//! ```

pub mod config;
pub mod extract;
pub mod load;
pub mod runner;
pub mod state;
pub mod transform;

// Re-export main types for convenience
pub use config::{ConfigError, PipelineConfig, DESTINATION_CONN_ENV, SOURCE_CONN_ENV};
pub use runner::{EtlPipeline, RunSummary};
pub use state::{RunId, RunState, RunStateMachine, Stage, StateChange, TransitionError};
