//! Turns an executor failure into a short, actionable hint for the CLI to
//! print: a resume command, and classification-specific extras.

use wave_core::error::{ErrorClass, classify};

/// POSIX single-quote wrapping: `it's` -> `'it'\''s'`.
pub fn shell_escape(input: &str) -> String {
    format!("'{}'", input.replace('\'', r#"'\''"#))
}

#[derive(Debug, Clone)]
pub struct RecoveryHint {
    pub class: ErrorClass,
    pub lines: Vec<String>,
}

pub struct RecoveryContext<'a> {
    pub pipeline_name: &'a str,
    pub input: &'a str,
    pub step_id: &'a str,
    pub workspace_path: Option<&'a str>,
    pub missing_names: &'a [String],
}

/// Build the hint block (at most 8 lines) for an executor error.
pub fn hint_for(err: &(dyn std::error::Error + 'static), ctx: &RecoveryContext) -> RecoveryHint {
    let class = classify(err);
    let mut lines = Vec::new();

    let resume_cmd = format!(
        "wave run {} {} --from-step {}",
        ctx.pipeline_name,
        shell_escape(ctx.input),
        ctx.step_id
    );
    lines.push(resume_cmd.clone());

    if class == ErrorClass::ContractValidation {
        lines.push(format!("{resume_cmd} --force"));
    }

    if class != ErrorClass::Preflight {
        if let Some(workspace_path) = ctx.workspace_path {
            lines.push(format!("inspect workspace: {workspace_path}"));
        }
    }

    if class == ErrorClass::Unknown {
        lines.push("re-run with --debug for a full error trace".to_string());
    }

    if class == ErrorClass::Preflight && !ctx.missing_names.is_empty() {
        lines.push(format!("install missing: {}", ctx.missing_names.join(", ")));
    }

    lines.truncate(8);
    RecoveryHint { class, lines }
}
