//! In-process DAG execution.
//!
//! The [`Orchestrator`] trait drives a [`TaskRunner`] through a
//! [`DagDefinition`]. [`LocalOrchestrator`] runs the tasks sequentially in
//! the current process with per-task retries, exponential backoff and a
//! whole-run timeout.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sales_etl::pipeline::{EtlPipeline, PipelineConfig};
//! use sales_etl::scheduler::{DagDefinition, LocalOrchestrator, Orchestrator};
//!
//! let config = PipelineConfig::from_env()?;
//! let dag = DagDefinition::from_config(&config);
//! let pipeline = EtlPipeline::new(config);
//!
//! let report = LocalOrchestrator::new()
//!     .run_dag(&dag, &pipeline, chrono::Utc::now().date_naive())
//!     .await?;
//! println!("{}", report.status);
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{DagDefinition, TaskInstance, TaskStatus};
use crate::error::StageError;
use crate::pipeline::{RunId, RunState, RunStateMachine, Stage, StateChange, TransitionError};

/// What a successful task reports back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskOutput {
    /// Rows produced (extract, transform) or written (load).
    pub rows: u64,
}

/// Executes individual DAG tasks.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Runs one attempt of `stage` for `run`.
    async fn run_task(&self, run: &RunId, stage: Stage) -> Result<TaskOutput, StageError>;

    /// Called once when a run ends, whatever its outcome.
    async fn finish_run(&self, _run: &RunId) {}
}

/// Runs whole DAGs.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Executes one run of `dag` for `logical_date`.
    ///
    /// A failed or timed-out run is still reported as `Ok`; the report's
    /// status says how it ended. `Err` means the orchestrator itself
    /// could not proceed.
    async fn run_dag(
        &self,
        dag: &DagDefinition,
        runner: &dyn TaskRunner,
        logical_date: NaiveDate,
    ) -> Result<DagRunReport, OrchestratorError>;
}

/// Errors raised by the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid DAG: {0}")]
    InvalidDag(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Run {run_id} timed out after {timeout:?}")]
    Timeout { run_id: String, timeout: Duration },

    #[error("Run {run_id} failed in task {task_id}: {message}")]
    TaskFailed {
        run_id: String,
        task_id: String,
        message: String,
    },
}

/// Final status of a DAG run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DagRunStatus {
    Success,
    Failed,
    TimedOut,
}

impl std::fmt::Display for DagRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DagRunStatus::Success => write!(f, "success"),
            DagRunStatus::Failed => write!(f, "failed"),
            DagRunStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Outcome of one DAG run.
#[derive(Debug, Clone, Serialize)]
pub struct DagRunReport {
    pub dag_id: String,
    pub run_id: String,
    pub logical_date: NaiveDate,
    pub status: DagRunStatus,
    /// Run state when execution stopped.
    pub state: RunState,
    pub tasks: Vec<TaskInstance>,
    pub transitions: Vec<StateChange>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DagRunReport {
    pub fn is_success(&self) -> bool {
        self.status == DagRunStatus::Success
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskInstance> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// Converts a failed or timed-out report into an error.
    pub fn into_result(self, timeout: Duration) -> Result<Self, OrchestratorError> {
        match self.status {
            DagRunStatus::Success => Ok(self),
            DagRunStatus::TimedOut => Err(OrchestratorError::Timeout {
                run_id: self.run_id,
                timeout,
            }),
            DagRunStatus::Failed => {
                let failed = self.tasks.iter().find(|t| t.status == TaskStatus::Failed);
                Err(OrchestratorError::TaskFailed {
                    run_id: self.run_id.clone(),
                    task_id: failed.map(|t| t.task_id.clone()).unwrap_or_default(),
                    message: failed.and_then(|t| t.error.clone()).unwrap_or_default(),
                })
            }
        }
    }
}

/// Sequential, in-process orchestrator.
///
/// Only one run executes at a time; a second `run_dag` call waits for the
/// first to finish.
#[derive(Debug, Default)]
pub struct LocalOrchestrator {
    active: Mutex<()>,
}

impl LocalOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    async fn run_dag(
        &self,
        dag: &DagDefinition,
        runner: &dyn TaskRunner,
        logical_date: NaiveDate,
    ) -> Result<DagRunReport, OrchestratorError> {
        dag.validate().map_err(OrchestratorError::InvalidDag)?;
        let _active = self.active.lock().await;

        let run_id = RunId::new(logical_date);
        let started_at = Utc::now();
        let mut machine = RunStateMachine::new(dag.retry.max_attempts);
        let mut tasks: Vec<TaskInstance> = dag
            .tasks
            .iter()
            .map(|t| TaskInstance::new(t.stage, dag.retry.max_attempts))
            .collect();

        info!(
            dag_id = %dag.dag_id,
            run_id = %run_id,
            logical_date = %logical_date,
            "DAG run started"
        );

        let outcome = tokio::time::timeout(
            dag.run_timeout,
            drive(dag, runner, &run_id, &mut machine, &mut tasks),
        )
        .await;

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                runner.finish_run(&run_id).await;
                return Err(e);
            }
            Err(_) => {
                error!(
                    dag_id = %dag.dag_id,
                    run_id = %run_id,
                    timeout_secs = dag.run_timeout.as_secs(),
                    "DAG run timed out"
                );
                let state = machine.state();
                if let Some(stage) = state.stage().filter(|s| state == RunState::running(*s)) {
                    if let Err(e) = machine.fail(stage) {
                        warn!(run_id = %run_id, error = %e, "Unexpected state transition");
                    }
                }
                for task in tasks.iter_mut() {
                    match task.status {
                        TaskStatus::Running | TaskStatus::UpForRetry => {
                            task.fail("timeout", "run timed out")
                        }
                        TaskStatus::Pending => task.mark_upstream_failed(),
                        _ => {}
                    }
                }
                DagRunStatus::TimedOut
            }
        };

        runner.finish_run(&run_id).await;

        let report = DagRunReport {
            dag_id: dag.dag_id.clone(),
            run_id: run_id.to_string(),
            logical_date,
            status,
            state: machine.state(),
            tasks,
            transitions: machine.history().to_vec(),
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            dag_id = %report.dag_id,
            run_id = %report.run_id,
            status = %report.status,
            state = %report.state,
            "DAG run finished"
        );

        Ok(report)
    }
}

/// Runs the tasks in order, retrying retryable failures.
async fn drive(
    dag: &DagDefinition,
    runner: &dyn TaskRunner,
    run_id: &RunId,
    machine: &mut RunStateMachine,
    tasks: &mut [TaskInstance],
) -> Result<DagRunStatus, OrchestratorError> {
    for index in 0..tasks.len() {
        let stage = tasks[index].stage;

        loop {
            machine.begin(stage)?;
            let task = &mut tasks[index];
            task.start_attempt();
            info!(
                run_id = %run_id,
                task_id = %task.task_id,
                attempt = task.attempts,
                max_attempts = task.max_attempts,
                "Task started"
            );

            match runner.run_task(run_id, stage).await {
                Ok(output) => {
                    machine.succeed(stage)?;
                    task.succeed(output.rows);
                    info!(
                        run_id = %run_id,
                        task_id = %task.task_id,
                        rows = output.rows,
                        "Task succeeded"
                    );
                    break;
                }
                Err(e) => {
                    machine.fail(stage)?;

                    if e.is_retryable() && machine.remaining_attempts(stage) > 0 {
                        let delay = dag.retry.delay_for(machine.attempts(stage));
                        task.schedule_retry(&e);
                        warn!(
                            run_id = %run_id,
                            task_id = %task.task_id,
                            attempt = task.attempts,
                            max_attempts = task.max_attempts,
                            delay_secs = delay.as_secs(),
                            kind = e.kind(),
                            error = %e,
                            "Task failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    task.fail(e.kind(), e.to_string());
                    error!(
                        run_id = %run_id,
                        task_id = %task.task_id,
                        attempts = task.attempts,
                        kind = e.kind(),
                        error = %e,
                        "Task failed"
                    );

                    let downstream = dag.downstream_of(&tasks[index].task_id);
                    for other in tasks.iter_mut() {
                        if downstream.contains(&other.task_id) {
                            other.mark_upstream_failed();
                        }
                    }
                    return Ok(DagRunStatus::Failed);
                }
            }
        }
    }

    Ok(DagRunStatus::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RetryPolicy;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Runner that fails each stage a configured number of times.
    #[derive(Default)]
    struct ScriptedRunner {
        failures: HashMap<Stage, (u32, fn() -> StageError)>,
        calls: StdMutex<Vec<Stage>>,
        finished: StdMutex<u32>,
        hang_on: Option<Stage>,
    }

    impl ScriptedRunner {
        fn failing(mut self, stage: Stage, times: u32, err: fn() -> StageError) -> Self {
            self.failures.insert(stage, (times, err));
            self
        }

        fn calls(&self) -> Vec<Stage> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskRunner for ScriptedRunner {
        async fn run_task(&self, _run: &RunId, stage: Stage) -> Result<TaskOutput, StageError> {
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(stage);
                calls.iter().filter(|s| **s == stage).count() as u32
            };
            if self.hang_on == Some(stage) {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
            }
            match self.failures.get(&stage) {
                Some((times, err)) if attempt <= *times => Err(err()),
                _ => Ok(TaskOutput { rows: 10 }),
            }
        }

        async fn finish_run(&self, _run: &RunId) {
            *self.finished.lock().unwrap() += 1;
        }
    }

    fn connection_error() -> StageError {
        StageError::connection("postgres://etl:***@db/sales", "connection refused")
    }

    fn transform_error() -> StageError {
        StageError::Transform("duplicate transaction_id 7".to_string())
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_run() {
        let runner = ScriptedRunner::default();
        let report = LocalOrchestrator::new()
            .run_dag(&DagDefinition::default(), &runner, date())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.state, RunState::Loaded);
        assert_eq!(runner.calls(), Stage::ALL.to_vec());
        assert!(report.tasks.iter().all(|t| t.status == TaskStatus::Success));
        assert_eq!(*runner.finished.lock().unwrap(), 1);
        assert!(report.run_id.starts_with("2024-06-01-"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_with_backoff() {
        let runner = ScriptedRunner::default().failing(Stage::Load, 2, connection_error);
        let started = tokio::time::Instant::now();

        let report = LocalOrchestrator::new()
            .run_dag(&DagDefinition::default(), &runner, date())
            .await
            .unwrap();

        assert!(report.is_success());
        let load = report.task("load_postgres").unwrap();
        assert_eq!(load.attempts, 3);
        assert_eq!(load.error_kind.as_deref(), Some("connection"));
        // Upstream stages ran once; the retries re-ran only the load.
        assert_eq!(
            runner.calls(),
            vec![Stage::Extract, Stage::Transform, Stage::Load, Stage::Load, Stage::Load]
        );
        // 2 minutes + 4 minutes of backoff.
        assert_eq!(started.elapsed(), Duration::from_secs(360));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_the_run() {
        let runner = ScriptedRunner::default().failing(Stage::Extract, 5, connection_error);

        let report = LocalOrchestrator::new()
            .run_dag(&DagDefinition::default(), &runner, date())
            .await
            .unwrap();

        assert_eq!(report.status, DagRunStatus::Failed);
        assert_eq!(report.state, RunState::ExtractFailed);
        let extract = report.task("extract_oracle").unwrap();
        assert_eq!(extract.attempts, 3);
        assert_eq!(extract.status, TaskStatus::Failed);
        assert_eq!(
            report.task("transform_data").unwrap().status,
            TaskStatus::UpstreamFailed
        );
        assert_eq!(
            report.task("load_postgres").unwrap().status,
            TaskStatus::UpstreamFailed
        );

        let err = report.into_result(Duration::from_secs(3600)).unwrap_err();
        assert!(matches!(err, OrchestratorError::TaskFailed { ref task_id, .. } if task_id == "extract_oracle"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transform_errors_are_not_retried() {
        let runner = ScriptedRunner::default().failing(Stage::Transform, 1, transform_error);

        let report = LocalOrchestrator::new()
            .run_dag(&DagDefinition::default(), &runner, date())
            .await
            .unwrap();

        assert_eq!(report.status, DagRunStatus::Failed);
        assert_eq!(report.task("transform_data").unwrap().attempts, 1);
        assert_eq!(runner.calls(), vec![Stage::Extract, Stage::Transform]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout() {
        let runner = ScriptedRunner {
            hang_on: Some(Stage::Transform),
            ..Default::default()
        };

        let report = LocalOrchestrator::new()
            .run_dag(&DagDefinition::default(), &runner, date())
            .await
            .unwrap();

        assert_eq!(report.status, DagRunStatus::TimedOut);
        assert_eq!(report.state, RunState::TransformFailed);
        assert!(report.state.is_failed());
        assert_eq!(report.task("transform_data").unwrap().status, TaskStatus::Failed);
        assert_eq!(
            report.task("load_postgres").unwrap().status,
            TaskStatus::UpstreamFailed
        );
        assert_eq!(*runner.finished.lock().unwrap(), 1);
        assert!(matches!(
            report.into_result(Duration::from_secs(3600)),
            Err(OrchestratorError::Timeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_during_backoff() {
        let runner = ScriptedRunner::default().failing(Stage::Extract, 3, connection_error);
        let dag = DagDefinition {
            run_timeout: Duration::from_secs(60),
            ..DagDefinition::default()
        };

        let report = LocalOrchestrator::new()
            .run_dag(&dag, &runner, date())
            .await
            .unwrap();

        assert_eq!(report.status, DagRunStatus::TimedOut);
        assert_eq!(report.state, RunState::ExtractFailed);
        let extract = report.task("extract_oracle").unwrap();
        assert_eq!(extract.status, TaskStatus::Failed);
        assert_eq!(extract.attempts, 1);
        assert_eq!(runner.calls(), vec![Stage::Extract]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_policy() {
        let runner = ScriptedRunner::default().failing(Stage::Load, 1, connection_error);
        let dag = DagDefinition {
            retry: RetryPolicy::no_retry(),
            ..DagDefinition::default()
        };

        let report = LocalOrchestrator::new()
            .run_dag(&dag, &runner, date())
            .await
            .unwrap();
        assert_eq!(report.status, DagRunStatus::Failed);
        assert_eq!(report.task("load_postgres").unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_invalid_dag_rejected() {
        let runner = ScriptedRunner::default();
        let dag = DagDefinition {
            tasks: vec![],
            ..DagDefinition::default()
        };
        let err = LocalOrchestrator::new()
            .run_dag(&dag, &runner, date())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidDag(_)));
    }
}
