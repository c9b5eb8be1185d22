//! Declared step outputs persisted to the run's artifact directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::Id;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Id,
    pub run_id: String,
    pub step_id: String,
    pub name: String,
    /// Path relative to the run's artifact directory.
    pub relative_path: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
    /// Matrix fan-out index, `None` for non-matrix steps.
    pub matrix_index: Option<usize>,
}

impl Artifact {
    /// The key downstream steps reference it by in `inject_artifacts` and
    /// `{{ step.X.Y }}` templates.
    pub fn reference_key(&self) -> String {
        crate::template::step_artifact_key(&self.step_id, &self.name)
    }
}
