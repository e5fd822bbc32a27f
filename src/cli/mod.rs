//! Command-line interface for sales-etl.
//!
//! Provides the standalone run, one-off and scheduled DAG runs, and DAG
//! inspection.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
