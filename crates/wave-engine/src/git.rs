//! Native git worktree operations used by the workspace manager.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Detect the repository's default branch: remote HEAD, then `main`, then `master`.
pub fn detect_default_branch(repo_root: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["symbolic-ref", "refs/remotes/origin/HEAD"])
        .current_dir(repo_root)
        .output()?;
    if output.status.success() {
        let full_ref = String::from_utf8(output.stdout)
            .map_err(|_| GitError::InvalidUtf8)?
            .trim()
            .to_string();
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        let check = Command::new("git")
            .args(["rev-parse", "--verify", &format!("refs/heads/{candidate}")])
            .current_dir(repo_root)
            .output()?;
        if check.status.success() {
            return Ok(candidate.to_string());
        }
    }
    Ok("main".to_string())
}

pub fn branch_exists(repo_root: &Path, branch: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .current_dir(repo_root)
        .output()?;
    Ok(output.status.success())
}

fn create_branch(repo_root: &Path, branch: &str, base: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["branch", branch, base])
        .current_dir(repo_root)
        .output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!(
            "git branch {branch} {base}: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

/// Create a worktree at `worktree_path` checked out on `branch`, creating the
/// branch from `base_branch` if it doesn't exist yet.
pub fn create_worktree(repo_root: &Path, worktree_path: &Path, branch: &str, base_branch: &str) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !branch_exists(repo_root, branch)? {
        create_branch(repo_root, branch, base_branch)?;
    }
    let output = Command::new("git")
        .args(["worktree", "add", &worktree_path.to_string_lossy(), branch])
        .current_dir(repo_root)
        .output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!(
            "git worktree add: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

pub fn remove_worktree(repo_root: &Path, worktree_path: &Path, force: bool) -> Result<()> {
    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    let path_str = worktree_path.to_string_lossy().into_owned();
    args.push(&path_str);
    let output = Command::new("git").args(&args).current_dir(repo_root).output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!(
            "git worktree remove: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

/// Drop stale entries from `git worktree list` whose directories no longer exist.
pub fn prune_worktrees(repo_root: &Path) -> Result<()> {
    let output = Command::new("git")
        .args(["worktree", "prune"])
        .current_dir(repo_root)
        .output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!(
            "git worktree prune: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

pub struct WorktreeInfo {
    pub path: String,
    pub branch: Option<String>,
}

pub fn list_worktrees(repo_root: &Path) -> Result<Vec<WorktreeInfo>> {
    let output = Command::new("git")
        .args(["worktree", "list", "--porcelain"])
        .current_dir(repo_root)
        .output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!(
            "git worktree list: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut worktrees = Vec::new();
    let mut path: Option<String> = None;
    let mut branch: Option<String> = None;
    for line in stdout.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            if let Some(path) = path.take() {
                worktrees.push(WorktreeInfo { path, branch: branch.take() });
            }
            path = Some(p.to_string());
        } else if let Some(b) = line.strip_prefix("branch refs/heads/") {
            branch = Some(b.to_string());
        }
    }
    if let Some(path) = path {
        worktrees.push(WorktreeInfo { path, branch });
    }
    Ok(worktrees)
}

/// Canonicalize a repo root for use as a semaphore-registry key. Falls back to
/// the given path (normalized, not resolved) if the repo doesn't exist yet.
pub fn canonical_repo_key(repo_root: &Path) -> PathBuf {
    repo_root.canonicalize().unwrap_or_else(|_| repo_root.to_path_buf())
}

/// Build the step branch name: `{run_id}-{step_id}`.
pub fn step_branch_name(run_id: &str, step_id: &str) -> String {
    format!("{run_id}-{step_id}")
}
