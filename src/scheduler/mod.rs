//! DAG definition, retry policy and orchestration.
//!
//! This module provides the scheduling side of the ETL:
//!
//! - **DagDefinition**: the three-task DAG and its run settings
//! - **RetryPolicy**: per-task attempts and exponential backoff
//! - **Orchestrator / TaskRunner**: the seam between scheduling and work
//! - **LocalOrchestrator**: sequential in-process execution with a run timeout
//! - **run_daily**: the daily loop, without catch-up
//!
//! # Architecture
//!
//! ```text
//!   run_daily ──► LocalOrchestrator ──► TaskRunner (EtlPipeline)
//!                      │                     │
//!                 RetryPolicy          CheckpointStore
//!                 RunStateMachine
//! ```

pub mod dag;
pub mod daily;
pub mod executor;
pub mod job;
pub mod policy;

// Re-export main types for convenience
pub use dag::{DagDefinition, TaskDefinition, DAG_ID};
pub use daily::{logical_date_for, next_fire_time, run_daily, DailySummary};
pub use executor::{
    DagRunReport, DagRunStatus, LocalOrchestrator, Orchestrator, OrchestratorError, TaskOutput,
    TaskRunner,
};
pub use job::{TaskInstance, TaskStatus};
pub use policy::RetryPolicy;
