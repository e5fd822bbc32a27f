//! Stages of a run and the state machine that tracks them.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier of one run: its logical date plus a random suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId {
    pub logical_date: NaiveDate,
    pub id: Uuid,
}

impl RunId {
    pub fn new(logical_date: NaiveDate) -> Self {
        Self {
            logical_date,
            id: Uuid::new_v4(),
        }
    }

    /// Run identifier for an ad-hoc run dated today (UTC).
    pub fn today() -> Self {
        Self::new(Utc::now().date_naive())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.id.simple().to_string();
        write!(f, "{}-{}", self.logical_date.format("%Y-%m-%d"), &simple[..8])
    }
}

/// One of the three pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Transform,
    Load,
}

impl Stage {
    /// Stages in execution order.
    pub const ALL: [Stage; 3] = [Stage::Extract, Stage::Transform, Stage::Load];

    /// Task identifier of the stage in the DAG.
    pub fn task_id(&self) -> &'static str {
        match self {
            Stage::Extract => "extract_oracle",
            Stage::Transform => "transform_data",
            Stage::Load => "load_postgres",
        }
    }

    /// Resolves a stage from its DAG task identifier.
    pub fn from_task_id(task_id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.task_id() == task_id)
    }

    /// The stage whose output this stage consumes.
    pub fn upstream(&self) -> Option<Stage> {
        match self {
            Stage::Extract => None,
            Stage::Transform => Some(Stage::Extract),
            Stage::Load => Some(Stage::Transform),
        }
    }

    fn index(&self) -> usize {
        match self {
            Stage::Extract => 0,
            Stage::Transform => 1,
            Stage::Load => 2,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Extract => write!(f, "extract"),
            Stage::Transform => write!(f, "transform"),
            Stage::Load => write!(f, "load"),
        }
    }
}

/// Lifecycle state of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Extracting,
    Extracted,
    ExtractFailed,
    Transforming,
    Transformed,
    TransformFailed,
    Loading,
    Loaded,
    LoadFailed,
}

impl RunState {
    pub fn running(stage: Stage) -> Self {
        match stage {
            Stage::Extract => RunState::Extracting,
            Stage::Transform => RunState::Transforming,
            Stage::Load => RunState::Loading,
        }
    }

    pub fn succeeded(stage: Stage) -> Self {
        match stage {
            Stage::Extract => RunState::Extracted,
            Stage::Transform => RunState::Transformed,
            Stage::Load => RunState::Loaded,
        }
    }

    pub fn failed(stage: Stage) -> Self {
        match stage {
            Stage::Extract => RunState::ExtractFailed,
            Stage::Transform => RunState::TransformFailed,
            Stage::Load => RunState::LoadFailed,
        }
    }

    /// The stage this state belongs to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RunState::Pending => None,
            RunState::Extracting | RunState::Extracted | RunState::ExtractFailed => {
                Some(Stage::Extract)
            }
            RunState::Transforming | RunState::Transformed | RunState::TransformFailed => {
                Some(Stage::Transform)
            }
            RunState::Loading | RunState::Loaded | RunState::LoadFailed => Some(Stage::Load),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            RunState::ExtractFailed | RunState::TransformFailed | RunState::LoadFailed
        )
    }

    /// States reachable in one step.
    ///
    /// A failed state may only move back into the running state of the
    /// same stage, which is how a retry is expressed.
    fn successors(&self) -> &'static [RunState] {
        match self {
            RunState::Pending => &[RunState::Extracting],
            RunState::Extracting => &[RunState::Extracted, RunState::ExtractFailed],
            RunState::Extracted => &[RunState::Transforming],
            RunState::ExtractFailed => &[RunState::Extracting],
            RunState::Transforming => &[RunState::Transformed, RunState::TransformFailed],
            RunState::Transformed => &[RunState::Loading],
            RunState::TransformFailed => &[RunState::Transforming],
            RunState::Loading => &[RunState::Loaded, RunState::LoadFailed],
            RunState::Loaded => &[],
            RunState::LoadFailed => &[RunState::Loading],
        }
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        self.successors().contains(&next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Extracting => "EXTRACTING",
            RunState::Extracted => "EXTRACTED",
            RunState::ExtractFailed => "EXTRACT_FAILED",
            RunState::Transforming => "TRANSFORMING",
            RunState::Transformed => "TRANSFORMED",
            RunState::TransformFailed => "TRANSFORM_FAILED",
            RunState::Loading => "LOADING",
            RunState::Loaded => "LOADED",
            RunState::LoadFailed => "LOAD_FAILED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid transition from {from} to {to}: {reason}")]
pub struct TransitionError {
    pub from: RunState,
    pub to: RunState,
    pub reason: String,
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
}

/// Tracks the state of one run and the attempts spent on each stage.
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    state: RunState,
    max_attempts: u32,
    attempts: [u32; 3],
    history: Vec<StateChange>,
}

impl RunStateMachine {
    /// Creates a machine in `PENDING` allowing `max_attempts` per stage.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: RunState::Pending,
            max_attempts: max_attempts.max(1),
            attempts: [0; 3],
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    /// Attempts started so far for `stage`.
    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempts[stage.index()]
    }

    /// Attempts still available for `stage`.
    pub fn remaining_attempts(&self, stage: Stage) -> u32 {
        self.max_attempts.saturating_sub(self.attempts(stage))
    }

    /// Returns `true` once the run can make no further progress.
    pub fn is_finished(&self) -> bool {
        match self.state {
            RunState::Loaded => true,
            s if s.is_failed() => s
                .stage()
                .map_or(true, |stage| self.remaining_attempts(stage) == 0),
            _ => false,
        }
    }

    /// Starts (or restarts) `stage`.
    ///
    /// Restarting from the stage's failed state counts as a retry and is
    /// only allowed while attempts remain.
    pub fn begin(&mut self, stage: Stage) -> Result<(), TransitionError> {
        let to = RunState::running(stage);
        if self.state.is_failed() && self.remaining_attempts(stage) == 0 {
            return Err(TransitionError {
                from: self.state,
                to,
                reason: format!("no attempts left for the {} stage", stage),
            });
        }
        self.transition(to)?;
        self.attempts[stage.index()] += 1;
        Ok(())
    }

    /// Marks the running `stage` as succeeded.
    pub fn succeed(&mut self, stage: Stage) -> Result<(), TransitionError> {
        self.transition(RunState::succeeded(stage))
    }

    /// Marks the running `stage` as failed.
    pub fn fail(&mut self, stage: Stage) -> Result<(), TransitionError> {
        self.transition(RunState::failed(stage))
    }

    fn transition(&mut self, to: RunState) -> Result<(), TransitionError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(TransitionError {
                from,
                to,
                reason: "not a permitted edge".to_string(),
            });
        }
        self.state = to;
        self.history.push(StateChange {
            from,
            to,
            at: Utc::now(),
        });
        Ok(())
    }
}
