//! Error types shared by the pipeline stages.
//!
//! Every stage reports failures through [`StageError`], whose variants map
//! one-to-one onto the failure classes a run can end in:
//! - connection failures against the source or destination database
//! - failing or malformed queries during extraction
//! - unexpected data shape during transformation
//! - insert failures during loading
//! - missing upstream input and checkpoint I/O

use thiserror::Error;

use crate::pipeline::Stage;

/// Errors that can occur while executing a pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    /// The source or destination database could not be reached.
    #[error("Connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    /// The extraction query failed or returned rows of an unusable shape.
    #[error("Query on '{table}' failed: {message}")]
    Query { table: String, message: String },

    /// The in-memory dataset had an unexpected shape.
    #[error("Transform failed: {0}")]
    Transform(String),

    /// An insert into the destination table failed.
    #[error("Load into '{table}' failed: {message}")]
    Load { table: String, message: String },

    /// The stage was invoked without the output of its upstream stage.
    #[error("No input available for the {stage} stage")]
    MissingInput { stage: Stage },

    /// Reading or writing a stage checkpoint failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl StageError {
    /// Creates a connection error for the given (already redacted) target.
    pub fn connection(target: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Creates a query error for the given table.
    pub fn query(table: impl Into<String>, message: impl ToString) -> Self {
        Self::Query {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Creates a load error for the given table.
    pub fn load(table: impl Into<String>, message: impl ToString) -> Self {
        Self::Load {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Short machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Query { .. } => "query",
            Self::Transform(_) => "transform",
            Self::Load { .. } => "load",
            Self::MissingInput { .. } => "missing_input",
            Self::Checkpoint(_) => "checkpoint",
        }
    }

    /// Returns `true` if running the same stage again may succeed.
    ///
    /// Transform failures are deterministic for a given input and are
    /// never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Transform(_))
    }
}

/// Errors that can occur while persisting or restoring stage checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// The checkpoint exists but does not decode into a dataset.
    #[error("Corrupt checkpoint: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_display() {
        let err = StageError::connection("postgres://etl:***@db/analytics", "connection refused");
        assert!(err.to_string().contains("connection refused"));
        assert!(err.to_string().contains("***"));

        let err = StageError::query("SALES_TRANSACTIONS", "table does not exist");
        assert!(err.to_string().contains("SALES_TRANSACTIONS"));

        let err = StageError::MissingInput {
            stage: Stage::Transform,
        };
        assert!(err.to_string().contains("transform"));
    }

    #[test]
    fn test_transform_errors_are_not_retryable() {
        assert!(!StageError::Transform("duplicate id".to_string()).is_retryable());
        assert!(StageError::load("ANALYTICS_TRANSACTIONS", "deadlock").is_retryable());
        assert!(StageError::connection("sqlite://x.db", "unable to open").is_retryable());
        assert!(StageError::MissingInput {
            stage: Stage::Load
        }
        .is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(StageError::query("t", "x").kind(), "query");
        assert_eq!(StageError::Transform("x".into()).kind(), "transform");
        let err: StageError = CheckpointError::Corrupt("bad".into()).into();
        assert_eq!(err.kind(), "checkpoint");
    }
}
