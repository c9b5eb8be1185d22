//! Per-step execution record: phase, timing, and token accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Pending,
    Preflight,
    Running,
    ValidatingContract,
    Retrying,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled)
    }
}

/// Rank used to reject out-of-order phase writes from a lagging watcher
/// (progress is expected to move monotonically forward within one attempt).
fn phase_rank(phase: StepPhase) -> u8 {
    match phase {
        StepPhase::Pending => 0,
        StepPhase::Preflight => 1,
        StepPhase::Running => 2,
        StepPhase::ValidatingContract => 3,
        StepPhase::Retrying => 4,
        StepPhase::Completed | StepPhase::Failed | StepPhase::Skipped | StepPhase::Cancelled => 5,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_read_tokens: u64,
}

impl TokenUsage {
    pub fn zero() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            cached_read_tokens: 0,
        }
    }

    /// Billable total, excluding cached reads.
    pub fn billable_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProgress {
    pub run_id: String,
    pub step_id: String,
    pub phase: StepPhase,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tokens: TokenUsage,
    /// Matrix fan-out index, `None` for non-matrix steps.
    pub matrix_index: Option<usize>,
}

impl StepProgress {
    pub fn pending(run_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            step_id: step_id.into(),
            phase: StepPhase::Pending,
            attempt: 0,
            started_at: None,
            finished_at: None,
            tokens: TokenUsage::zero(),
            matrix_index: None,
        }
    }

    /// Apply a phase transition, rejecting moves that would go backwards
    /// within the same attempt (a retry starts a new attempt and is allowed
    /// to reset the rank).
    pub fn advance(&mut self, phase: StepPhase, now: DateTime<Utc>) -> Result<(), ProgressError> {
        if phase == StepPhase::Retrying {
            self.attempt += 1;
            self.phase = phase;
            return Ok(());
        }
        if phase_rank(phase) < phase_rank(self.phase) && self.phase != StepPhase::Retrying {
            return Err(ProgressError::Regression {
                from: self.phase,
                to: phase,
            });
        }
        if self.phase == StepPhase::Pending && phase == StepPhase::Running {
            self.started_at = Some(now);
        }
        if phase.is_terminal() {
            self.finished_at = Some(now);
        }
        self.phase = phase;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("step progress cannot regress from {from:?} to {to:?}")]
    Regression { from: StepPhase, to: StepPhase },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_step_starts_with_zero_tokens() {
        let p = StepProgress::pending("r1", "a");
        assert_eq!(p.tokens.billable_tokens(), 0);
        assert_eq!(p.phase, StepPhase::Pending);
    }

    #[test]
    fn advancing_forward_is_allowed() {
        let mut p = StepProgress::pending("r1", "a");
        let now = Utc::now();
        p.advance(StepPhase::Running, now).unwrap();
        assert_eq!(p.started_at, Some(now));
        p.advance(StepPhase::Completed, now).unwrap();
        assert_eq!(p.finished_at, Some(now));
    }

    #[test]
    fn regressing_is_rejected() {
        let mut p = StepProgress::pending("r1", "a");
        let now = Utc::now();
        p.advance(StepPhase::Running, now).unwrap();
        p.advance(StepPhase::ValidatingContract, now).unwrap();
        assert!(p.advance(StepPhase::Running, now).is_err());
    }

    #[test]
    fn retry_bumps_attempt_and_resets_rank() {
        let mut p = StepProgress::pending("r1", "a");
        let now = Utc::now();
        p.advance(StepPhase::Running, now).unwrap();
        p.advance(StepPhase::ValidatingContract, now).unwrap();
        p.advance(StepPhase::Retrying, now).unwrap();
        assert_eq!(p.attempt, 1);
        p.advance(StepPhase::Running, now).unwrap();
        assert_eq!(p.phase, StepPhase::Running);
    }

    #[test]
    fn billable_tokens_excludes_cached_reads() {
        let mut tokens = TokenUsage::zero();
        tokens.input_tokens = 100;
        tokens.output_tokens = 50;
        tokens.cached_read_tokens = 900;
        assert_eq!(tokens.billable_tokens(), 150);
    }
}
