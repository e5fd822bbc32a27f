//! CLI command definitions for sales-etl.
//!
//! - `run`: one standalone pass, no retries
//! - `dag`: one orchestrated run with checkpoints, retries and a timeout
//! - `schedule`: the daily loop
//! - `show-dag`: print the DAG definition

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{NaiveDate, Utc};
use clap::Parser;
use tracing::{error, info};

use crate::pipeline::{ConfigError, EtlPipeline, PipelineConfig};
use crate::scheduler::{self, DagDefinition, LocalOrchestrator, Orchestrator};

/// Default log file, relative to the working directory.
pub const DEFAULT_LOG_FILE: &str = "etl.log";

/// Exit code when the configuration is missing or invalid.
const EXIT_CONFIG: u8 = 1;

/// Exit code when a run failed and the caller asked to see it.
const EXIT_RUN_FAILED: u8 = 2;

/// Daily sales ETL: extract transactions, categorize them, load them for analytics.
#[derive(Parser, Debug)]
#[command(name = "sales-etl")]
#[command(about = "Extract sales transactions, categorize them by amount and load them into the analytics table")]
#[command(version)]
#[command(
    long_about = "sales-etl copies SALES_TRANSACTIONS into ANALYTICS_TRANSACTIONS, dropping non-positive amounts, upper-casing customer ids and assigning a LOW/MEDIUM/HIGH category.\n\nConnection strings are read from ORACLE_CONN_STRING (source) and POSTGRES_CONN_STRING (destination).\n\nExample usage:\n  sales-etl run\n  sales-etl dag --date 2024-06-01\n  sales-etl schedule"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// File that receives a copy of all log output.
    #[arg(long, default_value = DEFAULT_LOG_FILE, global = true)]
    pub log_file: PathBuf,

    /// Log to the console only.
    #[arg(long, global = true)]
    pub no_log_file: bool,
}

impl Cli {
    /// Log file to open, if any.
    pub fn log_file(&self) -> Option<&std::path::Path> {
        (!self.no_log_file).then_some(self.log_file.as_path())
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run extract, transform and load once, without retries.
    Run(RunArgs),

    /// Execute one orchestrated DAG run (checkpoints, retries, run timeout).
    Dag(DagArgs),

    /// Run the DAG every day at midnight UTC until interrupted.
    Schedule(ScheduleArgs),

    /// Print the DAG definition as JSON.
    ShowDag,
}

/// Arguments for `sales-etl run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Exit with status 2 when the pipeline fails.
    #[arg(long)]
    pub fail_on_error: bool,
}

/// Arguments for `sales-etl dag`.
#[derive(Parser, Debug)]
pub struct DagArgs {
    /// Logical date of the run (YYYY-MM-DD). Defaults to today (UTC).
    #[arg(long)]
    pub date: Option<NaiveDate>,

    /// Store checkpoints as Parquet files under this directory.
    #[arg(long, env = "ETL_CHECKPOINT_DIR")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Print the run report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `sales-etl schedule`.
#[derive(Parser, Debug)]
pub struct ScheduleArgs {
    /// Store checkpoints as Parquet files under this directory.
    #[arg(long, env = "ETL_CHECKPOINT_DIR")]
    pub checkpoint_dir: Option<PathBuf>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<ExitCode> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => run_standalone_command(args).await,
        Commands::Dag(args) => run_dag_command(args).await,
        Commands::Schedule(args) => run_schedule_command(args).await,
        Commands::ShowDag => run_show_dag_command(),
    }
}

fn load_config(checkpoint_dir: Option<PathBuf>) -> Result<PipelineConfig, ConfigError> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(dir) = checkpoint_dir {
        config = config.with_checkpoint_dir(dir);
    }
    Ok(config)
}

fn config_failure(err: &ConfigError) -> ExitCode {
    error!(error = %err, "Invalid configuration");
    ExitCode::from(EXIT_CONFIG)
}

async fn run_standalone_command(args: RunArgs) -> anyhow::Result<ExitCode> {
    let config = match load_config(None) {
        Ok(config) => config,
        Err(e) => return Ok(config_failure(&e)),
    };

    match EtlPipeline::new(config).run_once().await {
        Ok(summary) => {
            println!(
                "Run {}: extracted {}, kept {}, loaded {} rows",
                summary.run_id, summary.extracted, summary.transformed, summary.load.rows_inserted
            );
            Ok(ExitCode::SUCCESS)
        }
        // The failure has already been logged by the stage that hit it.
        Err(_) if args.fail_on_error => Ok(ExitCode::from(EXIT_RUN_FAILED)),
        Err(_) => Ok(ExitCode::SUCCESS),
    }
}

async fn run_dag_command(args: DagArgs) -> anyhow::Result<ExitCode> {
    let config = match load_config(args.checkpoint_dir) {
        Ok(config) => config,
        Err(e) => return Ok(config_failure(&e)),
    };
    let dag = DagDefinition::from_config(&config);
    let pipeline = EtlPipeline::new(config);
    let logical_date = args.date.unwrap_or_else(|| Utc::now().date_naive());

    let report = LocalOrchestrator::new()
        .run_dag(&dag, &pipeline, logical_date)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("DAG run {} finished: {}", report.run_id, report.status);
        for task in &report.tasks {
            println!(
                "  {:<16} {:<16} attempts={} rows={}",
                task.task_id,
                task.status.to_string(),
                task.attempts,
                task.rows.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())
            );
        }
    }

    match report.into_result(dag.run_timeout) {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, "DAG run failed");
            Ok(ExitCode::from(EXIT_RUN_FAILED))
        }
    }
}

async fn run_schedule_command(args: ScheduleArgs) -> anyhow::Result<ExitCode> {
    let config = match load_config(args.checkpoint_dir) {
        Ok(config) => config,
        Err(e) => return Ok(config_failure(&e)),
    };
    if let Some(dir) = &config.checkpoint_dir {
        info!(dir = %dir.display(), "Using Parquet checkpoints");
    }

    let dag = DagDefinition::from_config(&config);
    let pipeline = EtlPipeline::new(config);
    let orchestrator = LocalOrchestrator::new();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    };

    let summary = scheduler::run_daily(&orchestrator, &dag, &pipeline, shutdown).await;
    info!(
        runs = summary.runs,
        failed = summary.failed,
        errors = summary.errors,
        "Scheduler exited"
    );
    Ok(ExitCode::SUCCESS)
}

fn run_show_dag_command() -> anyhow::Result<ExitCode> {
    let dag = match PipelineConfig::from_env() {
        Ok(config) => DagDefinition::from_config(&config),
        Err(_) => DagDefinition::default(),
    };
    println!("{}", serde_json::to_string_pretty(&dag)?);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_flags() {
        let cli = Cli::try_parse_from(["sales-etl", "run", "--fail-on-error", "-l", "debug"]).unwrap();
        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.log_file(), Some(std::path::Path::new("etl.log")));
        match cli.command {
            Commands::Run(args) => assert!(args.fail_on_error),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_dag_date() {
        let cli = Cli::try_parse_from(["sales-etl", "dag", "--date", "2024-06-01", "--json", "--no-log-file"])
            .unwrap();
        assert!(cli.log_file().is_none());
        match cli.command {
            Commands::Dag(args) => {
                assert_eq!(args.date, NaiveDate::from_ymd_opt(2024, 6, 1));
                assert!(args.json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_date() {
        assert!(Cli::try_parse_from(["sales-etl", "dag", "--date", "June 1st"]).is_err());
    }
}
