//! Pre-run checks: required external tools on `PATH`, required named skill
//! bundles on disk. Runs once before the first step of a run.

use std::path::{Path, PathBuf};

use wave_core::error::{SkillError, ToolError};

/// Directories searched for a skill bundle, project-local first.
fn skill_search_dirs(workspace_root: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![workspace_root.join(".wave/skills")];
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".wave/skills"));
    }
    dirs
}

/// `true` if `name` resolves to an executable on `PATH`.
fn tool_on_path(name: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(name).is_file())
}

/// `true` if a skill bundle directory named `name` exists in any search dir.
fn skill_installed(name: &str, workspace_root: &Path) -> bool {
    skill_search_dirs(workspace_root).iter().any(|dir| dir.join(name).is_dir())
}

/// Check a persona's declared preflight requirements, returning every
/// missing tool/skill rather than failing on the first.
pub fn check(required_tools: &[String], required_skills: &[String], workspace_root: &Path) -> Result<(), PreflightFailure> {
    let missing_tools: Vec<String> = required_tools.iter().filter(|t| !tool_on_path(t)).cloned().collect();
    let missing_skills: Vec<String> = required_skills
        .iter()
        .filter(|s| !skill_installed(s, workspace_root))
        .cloned()
        .collect();

    if !missing_tools.is_empty() {
        return Err(PreflightFailure::Tool(ToolError(missing_tools)));
    }
    if !missing_skills.is_empty() {
        return Err(PreflightFailure::Skill(SkillError(missing_skills)));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum PreflightFailure {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Skill(#[from] SkillError),
}
