//! Run event log entries, as streamed over SSE and persisted for replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    RunCompleted,
    RunFailed,
    RunCancelled,
    StepStarted,
    StepProgress,
    StepCompleted,
    StepFailed,
    StepSkipped,
    ContractFailed,
    ContractRetried,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub run_id: String,
    pub step_id: Option<String>,
    pub kind: EventKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Monotonic per-run sequence number; clients use this to detect gaps
    /// after reconnecting to the SSE stream mid-run.
    pub sequence: u64,
}

impl Event {
    pub fn new(run_id: impl Into<String>, kind: EventKind, payload: Value, sequence: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: Id::new(),
            run_id: run_id.into(),
            step_id: None,
            kind,
            payload,
            created_at: now,
            sequence,
        }
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}
