//! Static definition of the daily ETL DAG.

use std::collections::HashSet;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;

use super::RetryPolicy;
use crate::pipeline::{PipelineConfig, Stage};

pub const DAG_ID: &str = "etl_oracle_postgres";

/// One node of the DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskDefinition {
    pub task_id: String,
    pub stage: Stage,
    /// Task ids that must succeed first.
    pub upstream: Vec<String>,
}

/// DAG metadata plus its tasks in execution order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DagDefinition {
    pub dag_id: String,
    pub description: String,
    /// Cron-style preset; only `@daily` is supported.
    pub schedule: String,
    pub start_date: NaiveDate,
    pub catchup: bool,
    #[serde(rename = "run_timeout_secs", serialize_with = "serialize_secs")]
    pub run_timeout: Duration,
    pub retry: RetryPolicy,
    pub tags: Vec<String>,
    pub tasks: Vec<TaskDefinition>,
}

impl Default for DagDefinition {
    fn default() -> Self {
        let tasks = Stage::ALL
            .iter()
            .map(|stage| TaskDefinition {
                task_id: stage.task_id().to_string(),
                stage: *stage,
                upstream: stage
                    .upstream()
                    .map(|up| vec![up.task_id().to_string()])
                    .unwrap_or_default(),
            })
            .collect();

        Self {
            dag_id: DAG_ID.to_string(),
            description: "Extract sales transactions, categorize them and load them for analytics"
                .to_string(),
            schedule: "@daily".to_string(),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            catchup: false,
            run_timeout: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
            tags: ["etl", "oracle", "postgres"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            tasks,
        }
    }
}

impl DagDefinition {
    /// The ETL DAG with retries and timeout taken from `config`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            run_timeout: config.run_timeout,
            retry: config.retry.clone(),
            ..Self::default()
        }
    }

    /// Checks that every upstream reference points to an earlier task.
    pub fn validate(&self) -> Result<(), String> {
        if self.tasks.is_empty() {
            return Err(format!("DAG {} has no tasks", self.dag_id));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            for upstream in &task.upstream {
                if !seen.contains(upstream.as_str()) {
                    return Err(format!(
                        "task {} depends on {} which does not run before it",
                        task.task_id, upstream
                    ));
                }
            }
            if !seen.insert(task.task_id.as_str()) {
                return Err(format!("duplicate task id {}", task.task_id));
            }
        }
        Ok(())
    }

    /// Task ids that transitively depend on `task_id`.
    pub fn downstream_of(&self, task_id: &str) -> Vec<String> {
        let mut affected: HashSet<&str> = HashSet::from([task_id]);
        let mut result = Vec::new();
        for task in &self.tasks {
            if task.upstream.iter().any(|u| affected.contains(u.as_str())) {
                affected.insert(task.task_id.as_str());
                result.push(task.task_id.clone());
            }
        }
        result
    }
}

fn serialize_secs<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_secs())
}
