//! Task instances: one DAG task within one run.
//!
//! A [`TaskInstance`] records the attempts made for a task, its final
//! status and the last error it saw.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::pipeline::Stage;

/// Status of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started yet.
    Pending,
    /// An attempt is in progress.
    Running,
    /// Failed, another attempt is scheduled.
    UpForRetry,
    /// Completed successfully.
    Success,
    /// Failed with no attempts left, or with a non-retryable error.
    Failed,
    /// Never started because an upstream task failed.
    UpstreamFailed,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::UpstreamFailed
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::UpForRetry => write!(f, "up_for_retry"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::UpstreamFailed => write!(f, "upstream_failed"),
        }
    }
}

/// Execution record of one task in one run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInstance {
    pub task_id: String,
    pub stage: Stage,
    pub status: TaskStatus,
    /// Attempts started so far.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Rows produced by the successful attempt.
    pub rows: Option<u64>,
    /// Message of the most recent failure.
    pub error: Option<String>,
    /// Class of the most recent failure.
    pub error_kind: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskInstance {
    pub fn new(stage: Stage, max_attempts: u32) -> Self {
        Self {
            task_id: stage.task_id().to_string(),
            stage,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            rows: None,
            error: None,
            error_kind: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Records the start of a new attempt.
    pub fn start_attempt(&mut self) {
        self.attempts += 1;
        self.status = TaskStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn succeed(&mut self, rows: u64) {
        self.status = TaskStatus::Success;
        self.rows = Some(rows);
        self.finished_at = Some(Utc::now());
    }

    /// Records a failed attempt that will be retried.
    pub fn schedule_retry(&mut self, error: &StageError) {
        self.status = TaskStatus::UpForRetry;
        self.record_error(error.kind(), error.to_string());
    }

    /// Records the final failure of this task.
    pub fn fail(&mut self, kind: &str, message: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.record_error(kind, message.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_upstream_failed(&mut self) {
        self.status = TaskStatus::UpstreamFailed;
    }

    /// Returns whether another attempt is allowed.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Wall time between the first attempt and completion, in milliseconds.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    fn record_error(&mut self, kind: &str, message: String) {
        self.error_kind = Some(kind.to_string());
        self.error = Some(message);
    }
}
