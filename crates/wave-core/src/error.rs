//! Error taxonomy shared across the runtime.
//!
//! Each kind is a distinct type carrying structured context so the CLI's
//! recovery-hint classifier can walk the chain with `std::error::Error::source`
//! instead of string-matching.

use std::fmt;

/// Contract (JSON schema or test-suite) validation failure.
#[derive(Debug, thiserror::Error)]
#[error("validation failed at {field_path}: {message}")]
pub struct ValidationError {
    pub field_path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field_path: field_path.into(),
            message: message.into(),
        }
    }
}

/// Path traversal, prompt-injection detection, or a denied tool use.
#[derive(Debug, thiserror::Error)]
#[error("security violation: {0}")]
pub struct SecurityValidationError(pub String);

/// Preflight found a missing named capability bundle.
#[derive(Debug, thiserror::Error)]
#[error("missing skill(s): {0:?}")]
pub struct SkillError(pub Vec<String>);

/// Preflight found a missing external tool on `PATH`.
#[derive(Debug, thiserror::Error)]
#[error("missing tool(s): {0:?}")]
pub struct ToolError(pub Vec<String>);

/// Lock timeout or git operation failure in the workspace manager.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("lock acquisition timed out for repo {0}")]
    LockTimeout(String),
    #[error("git operation failed: {0}")]
    Git(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Adapter subprocess exited non-zero with non-empty stderr, or otherwise failed.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("adapter process failed with exit code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
    #[error("adapter timed out after {0}s")]
    Timeout(u64),
    #[error("adapter reported a security violation: {0}")]
    SecurityViolation(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cancelled")]
    Cancelled,
}

/// A step-scoped failure, wrapping one of the error kinds above or an opaque
/// adapter error. This is the error type the executor's public contract returns.
#[derive(Debug)]
pub struct StepError {
    pub step_id: String,
    pub inner: Box<dyn std::error::Error + Send + Sync>,
}

impl StepError {
    pub fn new(step_id: impl Into<String>, inner: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            step_id: step_id.into(),
            inner: Box::new(inner),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} failed: {}", self.step_id, self.inner)
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

/// Classification used by the recovery-hint generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ContractValidation,
    SecurityViolation,
    Preflight,
    RuntimeError,
    Unknown,
}

/// Classify an error chain via type assertion (never string-matching).
///
/// Walks `source()` starting at `err` itself, because `StepError` wraps the
/// real cause one level down.
pub fn classify(err: &(dyn std::error::Error + 'static)) -> ErrorClass {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    let mut innermost = err;
    while let Some(e) = cur {
        if e.downcast_ref::<ValidationError>().is_some() {
            return ErrorClass::ContractValidation;
        }
        if e.downcast_ref::<SecurityValidationError>().is_some() {
            return ErrorClass::SecurityViolation;
        }
        if e.downcast_ref::<SkillError>().is_some() || e.downcast_ref::<ToolError>().is_some() {
            return ErrorClass::Preflight;
        }
        if let Some(AdapterError::SecurityViolation(_)) = e.downcast_ref::<AdapterError>() {
            return ErrorClass::SecurityViolation;
        }
        innermost = e;
        cur = e.source();
    }
    if innermost.to_string().is_empty() {
        ErrorClass::Unknown
    } else {
        ErrorClass::RuntimeError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_validation_error_through_step_error() {
        let inner = ValidationError::new("x", "required");
        let step_err = StepError::new("a", inner);
        assert_eq!(classify(&step_err), ErrorClass::ContractValidation);
    }

    #[test]
    fn classifies_security_violation() {
        let inner = SecurityValidationError("path escapes root".into());
        let step_err = StepError::new("a", inner);
        assert_eq!(classify(&step_err), ErrorClass::SecurityViolation);
    }

    #[test]
    fn classifies_preflight_errors() {
        let skill = StepError::new("a", SkillError(vec!["reviewer".into()]));
        assert_eq!(classify(&skill), ErrorClass::Preflight);
        let tool = StepError::new("a", ToolError(vec!["git".into()]));
        assert_eq!(classify(&tool), ErrorClass::Preflight);
    }

    #[test]
    fn classifies_opaque_errors_as_runtime() {
        let inner = AdapterError::NonZeroExit {
            code: 1,
            stderr: "boom".into(),
        };
        let step_err = StepError::new("a", inner);
        assert_eq!(classify(&step_err), ErrorClass::RuntimeError);
    }
}
