//! Execution runs - the ephemeral record of one sandboxed execution

use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Outcome of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Running,
    Succeeded,
    Failed { reason: String },
    TimedOut,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// A single execution of a task's source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(with = "millis")]
    pub timeout_budget: Duration,
    pub outcome: RunOutcome,
}

impl ExecutionRun {
    /// Begin tracking a run
    pub fn start(task_id: impl Into<String>, timeout_budget: Duration) -> Self {
        Self {
            task_id: task_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            timeout_budget,
            outcome: RunOutcome::Running,
        }
    }

    /// Finalize the run with its outcome
    pub fn finish(mut self, outcome: RunOutcome) -> Self {
        self.ended_at = Some(Utc::now());
        self.outcome = outcome;
        self
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    /// Wall-clock time the run took, if it has ended
    pub fn elapsed(&self) -> Option<Duration> {
        self.ended_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }

    /// Convert a non-success outcome into the matching typed error
    pub fn into_result(self) -> Result<Self, TaskError> {
        match &self.outcome {
            RunOutcome::Succeeded | RunOutcome::Running => Ok(self),
            RunOutcome::Failed { reason } => Err(TaskError::SandboxFailure(reason.clone())),
            RunOutcome::TimedOut => Err(TaskError::SandboxTimeout(self.timeout_budget)),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
