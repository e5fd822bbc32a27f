//! Pipeline configuration.
//!
//! The two connection strings are required and come from the environment;
//! everything else has a default that matches the daily DAG.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::scheduler::RetryPolicy;
use crate::storage::{ConnectionDescriptor, TableName};

/// Environment variable holding the source connection string.
pub const SOURCE_CONN_ENV: &str = "ORACLE_CONN_STRING";

/// Environment variable holding the destination connection string.
pub const DESTINATION_CONN_ENV: &str = "POSTGRES_CONN_STRING";

pub const DEFAULT_SOURCE_TABLE: &str = "SALES_TRANSACTIONS";
pub const DEFAULT_DESTINATION_TABLE: &str = "ANALYTICS_TRANSACTIONS";
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Errors that can occur while building a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Connections
    /// Where transactions are extracted from.
    pub source: ConnectionDescriptor,
    /// Where categorized transactions are loaded.
    pub destination: ConnectionDescriptor,
    /// Upper bound for opening either connection.
    pub connect_timeout: Duration,

    // Tables
    pub source_table: TableName,
    pub destination_table: TableName,

    // Loading
    /// Rows per `INSERT` statement.
    pub batch_size: usize,

    // Orchestration
    /// Directory for Parquet checkpoints; in-memory when `None`.
    pub checkpoint_dir: Option<PathBuf>,
    pub retry: RetryPolicy,
    /// Upper bound for a whole DAG run.
    pub run_timeout: Duration,
}

impl PipelineConfig {
    /// Creates a configuration with default tables, batching and retries.
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            source: ConnectionDescriptor::new(source),
            destination: ConnectionDescriptor::new(destination),
            connect_timeout: Duration::from_secs(30),
            source_table: parse_table(DEFAULT_SOURCE_TABLE, "ETL_SOURCE_TABLE")?,
            destination_table: parse_table(DEFAULT_DESTINATION_TABLE, "ETL_DESTINATION_TABLE")?,
            batch_size: DEFAULT_BATCH_SIZE,
            checkpoint_dir: None,
            retry: RetryPolicy::default(),
            run_timeout: Duration::from_secs(3600),
        })
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ORACLE_CONN_STRING`: source connection string (required)
    /// - `POSTGRES_CONN_STRING`: destination connection string (required)
    /// - `ETL_SOURCE_TABLE`: source table (default: SALES_TRANSACTIONS)
    /// - `ETL_DESTINATION_TABLE`: destination table (default: ANALYTICS_TRANSACTIONS)
    /// - `ETL_INSERT_BATCH_SIZE`: rows per insert statement (default: 500)
    /// - `ETL_CONNECT_TIMEOUT_SECS`: connection timeout (default: 30)
    /// - `ETL_CHECKPOINT_DIR`: Parquet checkpoint directory (default: in memory)
    /// - `ETL_RETRY_ATTEMPTS`: attempts per task (default: 3)
    /// - `ETL_RETRY_DELAY_SECS`: first retry delay (default: 120)
    /// - `ETL_RETRY_MAX_DELAY_SECS`: retry delay cap (default: 600)
    /// - `ETL_RUN_TIMEOUT_SECS`: whole-run timeout (default: 3600)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };
        let source = required(SOURCE_CONN_ENV)?;
        let destination = required(DESTINATION_CONN_ENV)?;
        let mut config = Self::new(source, destination)?;

        if let Some(val) = lookup("ETL_SOURCE_TABLE") {
            config.source_table = parse_table(&val, "ETL_SOURCE_TABLE")?;
        }

        if let Some(val) = lookup("ETL_DESTINATION_TABLE") {
            config.destination_table = parse_table(&val, "ETL_DESTINATION_TABLE")?;
        }

        if let Some(val) = lookup("ETL_INSERT_BATCH_SIZE") {
            config.batch_size = parse_env_value(&val, "ETL_INSERT_BATCH_SIZE")?;
        }

        if let Some(val) = lookup("ETL_CONNECT_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "ETL_CONNECT_TIMEOUT_SECS")?;
            config.connect_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("ETL_CHECKPOINT_DIR") {
            if !val.trim().is_empty() {
                config.checkpoint_dir = Some(PathBuf::from(val));
            }
        }

        // Retry settings
        if let Some(val) = lookup("ETL_RETRY_ATTEMPTS") {
            config.retry.max_attempts = parse_env_value(&val, "ETL_RETRY_ATTEMPTS")?;
        }

        if let Some(val) = lookup("ETL_RETRY_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "ETL_RETRY_DELAY_SECS")?;
            config.retry.initial_delay = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("ETL_RETRY_MAX_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "ETL_RETRY_MAX_DELAY_SECS")?;
            config.retry.max_delay = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("ETL_RUN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "ETL_RUN_TIMEOUT_SECS")?;
            config.run_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.as_str().trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "source connection string cannot be empty".to_string(),
            ));
        }

        if self.destination.as_str().trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "destination connection string cannot be empty".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "connect_timeout must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }

        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::ValidationFailed(
                "retry initial delay cannot exceed the maximum delay".to_string(),
            ));
        }

        if self.run_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "run_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the source table.
    pub fn with_source_table(mut self, table: TableName) -> Self {
        self.source_table = table;
        self
    }

    /// Builder method to set the destination table.
    pub fn with_destination_table(mut self, table: TableName) -> Self {
        self.destination_table = table;
        self
    }

    /// Builder method to set rows per insert statement.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder method to set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder method to store checkpoints as Parquet files.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Builder method to set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builder method to set the run timeout.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn parse_table(value: &str, key: &str) -> Result<TableName, ConfigError> {
    TableName::parse(value).map_err(|message| ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    })
}
