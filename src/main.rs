//! sales-etl CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Parse CLI arguments first to get log_level and log_file
    let cli = sales_etl::cli::parse_cli();

    // Keep the guard alive so the file writer flushes on exit
    let _log_guard = sales_etl::logging::init_logging(&cli.log_level, cli.log_file())?;

    sales_etl::cli::run_with_cli(cli).await
}
