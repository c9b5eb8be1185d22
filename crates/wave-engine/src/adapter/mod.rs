//! Uniform contract over subprocess LLM CLIs.
//!
//! Adapters are a tagged sum type rather than a trait object: the set of
//! wire protocols is small and closed, and `match`ing avoids boxing every
//! future an adapter returns.

mod ndjson;
mod process;
mod settings;

pub mod claude;
pub mod fake;

pub use ndjson::{NdjsonEvent, TokenAccumulator};
pub use settings::write_settings_file;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wave_core::error::AdapterError;
use wave_core::step_progress::TokenUsage;

use claude::ClaudeAdapter;
use fake::FakeAdapter;

/// Everything the adapter needs for one invocation. Built by the executor
/// from the persona config, the step's rendered prompt, and the workspace it
/// just provisioned.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub command: String,
    pub persona_name: String,
    pub workspace_path: PathBuf,
    pub prompt: String,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    pub deny_tools: Vec<String>,
    pub temperature: Option<f32>,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stderr: String,
    pub tokens: TokenUsage,
    /// Raw NDJSON lines, kept for the per-step trace log.
    pub raw_stream: Vec<String>,
}

/// A driver for a specific LLM CLI. Process-group spawn/termination and
/// NDJSON token accounting live in the shared `process`/`ndjson` helpers;
/// permission enforcement is delegated to the subprocess via a settings file
/// written into the workspace before spawn.
pub enum AdapterImpl {
    Claude(ClaudeAdapter),
    Fake(FakeAdapter),
}

impl AdapterImpl {
    pub async fn run(&self, config: &RunConfig, cancel: CancellationToken) -> Result<RunOutput, AdapterError> {
        match self {
            Self::Claude(a) => a.run(config, cancel).await,
            Self::Fake(a) => a.run(config, cancel).await,
        }
    }
}
