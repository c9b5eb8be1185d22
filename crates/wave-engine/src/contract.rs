//! Validates a step's declared output artifact against its handover
//! contract: JSON Schema or a shell test-suite command.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use wave_core::contract::ContractKind;
use wave_core::error::ValidationError;

const TEST_SUITE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("schema path `{0}` escapes the allowed roots")]
    PathEscape(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema is not valid JSON: {0}")]
    MalformedSchema(serde_json::Error),
    #[error("schema did not compile: {0}")]
    InvalidSchema(String),
    #[error("artifact is not valid JSON: {0}")]
    MalformedArtifact(serde_json::Error),
    #[error("test suite command timed out after {0:?}")]
    Timeout(Duration),
}

/// Resolve `candidate` relative to `root`, rejecting anything that escapes
/// `root` after canonicalization (symlink traversal, `../../etc/passwd`, etc).
pub fn resolve_within_root(root: &Path, candidate: &str) -> Result<PathBuf, ContractError> {
    let root = root.canonicalize()?;
    let joined = root.join(candidate);
    let resolved = joined.canonicalize().unwrap_or(joined);
    if !resolved.starts_with(&root) {
        return Err(ContractError::PathEscape(resolved));
    }
    Ok(resolved)
}

/// Strip `//` line comments and `/* */` block comments from text before
/// parsing as JSON. LLMs routinely emit these despite prompt instructions
/// asking for bare JSON.
pub fn strip_json_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Outcome of one contract check.
#[derive(Debug, Clone)]
pub struct ContractOutcome {
    pub passed: bool,
    pub message: Option<String>,
}

/// Validate `artifact_path` against `kind`. `workspace_root` and
/// `schema_root` bound path resolution for schema files and test-suite
/// working directories respectively.
pub async fn validate(kind: &ContractKind, artifact_path: &Path, schema_root: &Path) -> Result<ContractOutcome, ContractError> {
    match kind {
        ContractKind::JsonSchema { schema_path } => validate_json_schema(schema_path, artifact_path, schema_root).await,
        ContractKind::TestSuite { command } => run_test_suite(command, artifact_path.parent().unwrap_or(artifact_path)).await,
    }
}

async fn validate_json_schema(schema_path: &str, artifact_path: &Path, schema_root: &Path) -> Result<ContractOutcome, ContractError> {
    let resolved_schema = resolve_within_root(schema_root, schema_path)?;
    let schema_text = tokio::fs::read_to_string(&resolved_schema).await?;
    let schema_json: serde_json::Value =
        serde_json::from_str(&strip_json_comments(&schema_text)).map_err(ContractError::MalformedSchema)?;
    let compiled = jsonschema::validator_for(&schema_json).map_err(|e| ContractError::InvalidSchema(e.to_string()))?;

    let artifact_text = tokio::fs::read_to_string(artifact_path).await?;
    let artifact_json: serde_json::Value =
        serde_json::from_str(&strip_json_comments(&artifact_text)).map_err(ContractError::MalformedArtifact)?;

    if let Some(first_error) = compiled.iter_errors(&artifact_json).next() {
        let field_path = first_error.instance_path.to_string();
        let message = first_error.to_string();
        return Ok(ContractOutcome {
            passed: false,
            message: Some(ValidationError::new(field_path, message).to_string()),
        });
    }
    Ok(ContractOutcome { passed: true, message: None })
}

async fn run_test_suite(command: &str, working_dir: &Path) -> Result<ContractOutcome, ContractError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let status = match tokio::time::timeout(TEST_SUITE_TIMEOUT, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            return Err(ContractError::Timeout(TEST_SUITE_TIMEOUT));
        }
    };

    if status.success() {
        return Ok(ContractOutcome { passed: true, message: None });
    }

    let mut stderr = String::new();
    if let Some(mut handle) = child.stderr.take() {
        let _ = handle.read_to_string(&mut stderr).await;
    }
    Ok(ContractOutcome {
        passed: false,
        message: Some(stderr),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn strips_line_and_block_comments() {
        let input = "{\n  // a comment\n  \"x\": 1, /* inline */ \"y\": 2\n}";
        let stripped = strip_json_comments(input);
        let parsed: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(parsed["x"], 1);
        assert_eq!(parsed["y"], 2);
    }

    #[test]
    fn leaves_slashes_inside_strings_alone() {
        let input = r#"{"url": "https://example.com"}"#;
        let stripped = strip_json_comments(input);
        let parsed: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(parsed["url"], "https://example.com");
    }

    #[test]
    fn resolve_within_root_rejects_escape() {
        let dir = TempDir::new().unwrap();
        let err = resolve_within_root(dir.path(), "../../etc/passwd").unwrap_err();
        assert!(matches!(err, ContractError::PathEscape(_)));
    }

    #[test]
    fn resolve_within_root_allows_nested_path() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("schema.json"), "{}").unwrap();
        let resolved = resolve_within_root(dir.path(), "schema.json").unwrap();
        assert_eq!(resolved, dir.path().canonicalize().unwrap().join("schema.json"));
    }

    #[tokio::test]
    async fn json_schema_validates_matching_artifact() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("schema.json"), r#"{"type":"object","required":["x"]}"#).unwrap();
        let artifact = dir.path().join("out.json");
        std::fs::write(&artifact, r#"{"x": 1}"#).unwrap();
        let outcome = validate(
            &ContractKind::JsonSchema {
                schema_path: "schema.json".to_string(),
            },
            &artifact,
            dir.path(),
        )
        .await
        .unwrap();
        assert!(outcome.passed);
    }

    #[tokio::test]
    async fn json_schema_reports_first_failure() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("schema.json"), r#"{"type":"object","required":["x"]}"#).unwrap();
        let artifact = dir.path().join("out.json");
        std::fs::write(&artifact, r#"{"y": 1}"#).unwrap();
        let outcome = validate(
            &ContractKind::JsonSchema {
                schema_path: "schema.json".to_string(),
            },
            &artifact,
            dir.path(),
        )
        .await
        .unwrap();
        assert!(!outcome.passed);
        assert!(outcome.message.is_some());
    }

    #[tokio::test]
    async fn test_suite_pass_and_fail() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("out.txt");
        std::fs::write(&artifact, "anything").unwrap();

        let pass = run_test_suite("exit 0", dir.path()).await.unwrap();
        assert!(pass.passed);

        let fail = run_test_suite("echo boom 1>&2; exit 1", dir.path()).await.unwrap();
        assert!(!fail.passed);
        assert!(fail.message.unwrap().contains("boom"));
    }
}
