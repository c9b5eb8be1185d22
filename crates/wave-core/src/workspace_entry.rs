//! Git worktree lease bookkeeping for a run's steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    Provisioning,
    Ready,
    InUse,
    Released,
    Failed,
}

/// One git worktree checked out for a step (or shared across a matrix
/// fan-out group, depending on `workspace_mount`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    pub run_id: String,
    pub step_id: String,
    pub repo_root: String,
    pub worktree_path: String,
    pub branch: String,
    pub state: WorkspaceState,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl WorkspaceEntry {
    pub fn provisioning(
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        repo_root: impl Into<String>,
        worktree_path: impl Into<String>,
        branch: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step_id: step_id.into(),
            repo_root: repo_root.into(),
            worktree_path: worktree_path.into(),
            branch: branch.into(),
            state: WorkspaceState::Provisioning,
            created_at: now,
            released_at: None,
        }
    }

    pub fn release(&mut self, now: DateTime<Utc>) {
        self.state = WorkspaceState::Released;
        self.released_at = Some(now);
    }
}
