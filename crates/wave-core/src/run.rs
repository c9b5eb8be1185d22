//! Run lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses don't accept further step transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A materialized pipeline invocation: one row per `wave run` / `wave resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    pub run_id: String,
    pub pipeline_name: String,
    pub input: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Step id the run was resumed from, if any.
    pub resumed_from_step: Option<String>,
}

impl Run {
    pub fn new(run_id: String, pipeline_name: impl Into<String>, input: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Id::new(),
            run_id,
            pipeline_name: pipeline_name.into(),
            input: input.into(),
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            resumed_from_step: None,
        }
    }

    /// Valid status transitions form a DAG themselves: pending -> running ->
    /// {completed, failed, cancelled}, plus running <-> paused.
    pub fn can_transition(&self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self.status, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Cancelled)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_identified() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }

    #[test]
    fn pending_can_start_running() {
        let run = Run::new("p-20260101-000000-abcd".into(), "p", "input", Utc::now());
        assert!(run.can_transition(RunStatus::Running));
        assert!(!run.can_transition(RunStatus::Completed));
    }

    #[test]
    fn running_cannot_skip_back_to_pending() {
        let mut run = Run::new("p-20260101-000000-abcd".into(), "p", "input", Utc::now());
        run.status = RunStatus::Running;
        assert!(!run.can_transition(RunStatus::Pending));
        assert!(run.can_transition(RunStatus::Paused));
        assert!(run.can_transition(RunStatus::Failed));
    }
}
