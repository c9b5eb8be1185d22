//! Handover contract types: the validation gate a step's output must clear
//! before a downstream step may consume it.

use serde::{Deserialize, Serialize};

/// What to do when a contract fails (after exhausting `max_retries`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Fail,
    Retry,
    Continue,
}

impl Default for OnFailure {
    fn default() -> Self {
        Self::Fail
    }
}

/// A validation rule applied to a step's declared output before the
/// downstream step consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContractKind {
    JsonSchema { schema_path: String },
    TestSuite { command: String },
}

/// Full handover contract declared on a `StepDef`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoverContract {
    #[serde(flatten)]
    pub kind: ContractKind,
    #[serde(default)]
    pub must_pass: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub on_failure: OnFailure,
}

/// Errors raised while *parsing* a contract declaration (not while validating
/// an artifact against it — that's `wave_engine::contract::ContractError`).
#[derive(Debug, thiserror::Error)]
pub enum ContractDefError {
    /// `continue` only makes sense when a failing contract doesn't block the
    /// run, so pairing it with a hard `must_pass: true` is rejected up front
    /// rather than left to surprise someone at run time (see DESIGN.md).
    #[error("contract on step `{step}` sets on_failure=continue with must_pass=true, which is contradictory")]
    ContinueRequiresSoft { step: String },
}

impl HandoverContract {
    /// Validate the contract's own internal consistency.
    pub fn validate(&self, step_id: &str) -> Result<(), ContractDefError> {
        if self.on_failure == OnFailure::Continue && self.must_pass {
            return Err(ContractDefError::ContinueRequiresSoft {
                step: step_id.to_string(),
            });
        }
        Ok(())
    }
}
