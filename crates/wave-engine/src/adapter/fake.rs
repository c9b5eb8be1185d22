//! Deterministic in-process adapter used by executor tests.
//!
//! Performs no subprocess spawn and no filesystem I/O beyond what the caller
//! already set up. Useful for exercising executor/contract/store wiring
//! without a real CLI on the test machine.

use tokio_util::sync::CancellationToken;

use wave_core::error::AdapterError;
use wave_core::step_progress::TokenUsage;

use super::{RunConfig, RunOutput};

/// A scripted response keyed by persona name, falling back to echoing the
/// rendered prompt back as output when no script entry matches.
#[derive(Debug, Clone, Default)]
pub struct FakeAdapter {
    scripted: Vec<(String, String)>,
    fail_personas: Vec<String>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the adapter return `output` verbatim whenever `persona_name`
    /// matches, instead of echoing the prompt.
    pub fn with_scripted_output(mut self, persona_name: impl Into<String>, output: impl Into<String>) -> Self {
        self.scripted.push((persona_name.into(), output.into()));
        self
    }

    /// Make the adapter return `AdapterError::NonZeroExit` whenever
    /// `persona_name` matches.
    pub fn with_failure(mut self, persona_name: impl Into<String>) -> Self {
        self.fail_personas.push(persona_name.into());
        self
    }

    pub async fn run(&self, config: &RunConfig, cancel: CancellationToken) -> Result<RunOutput, AdapterError> {
        if cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }

        if self.fail_personas.iter().any(|p| p == &config.persona_name) {
            return Err(AdapterError::NonZeroExit {
                code: 1,
                stderr: format!("fake adapter scripted to fail persona {}", config.persona_name),
            });
        }

        let output = self
            .scripted
            .iter()
            .find(|(persona, _)| persona == &config.persona_name)
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| config.prompt.clone());

        Ok(RunOutput {
            exit_code: 0,
            stderr: String::new(),
            tokens: TokenUsage {
                input_tokens: config.prompt.len() as u64 / 4,
                output_tokens: output.len() as u64 / 4,
                cached_read_tokens: 0,
            },
            raw_stream: vec![output],
        })
    }
}
