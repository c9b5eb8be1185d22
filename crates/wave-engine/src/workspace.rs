//! Per-repository-serialized git-worktree lifecycle.
//!
//! Two concurrent steps against the same repository, whether from the same
//! run or different runs, never issue `git worktree` subcommands at the same
//! time. Serialization is keyed by canonical repo root so `./repo`,
//! `/abs/repo`, and a symlinked path to the same repo share one lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::git;
use wave_core::error::WorkspaceError;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-wide registry of one semaphore per canonical repo root. The only
/// piece of global mutable state the workspace manager needs.
#[derive(Default)]
pub struct RepoLockRegistry {
    locks: DashMap<PathBuf, Arc<Semaphore>>,
}

impl RepoLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn semaphore_for(&self, repo_key: &Path) -> Arc<Semaphore> {
        self.locks
            .entry(repo_key.to_path_buf())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }
}

pub struct WorkspaceManager {
    registry: Arc<RepoLockRegistry>,
    lock_timeout: Duration,
}

impl WorkspaceManager {
    pub fn new(registry: Arc<RepoLockRegistry>) -> Self {
        Self {
            registry,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Create a worktree for a step, idempotent against a stale leftover
    /// directory from a crashed prior run: prune worktree refs, force-remove,
    /// delete the directory, then recreate.
    pub async fn create(&self, repo_root: &Path, worktree_path: &Path, branch: &str) -> Result<(), WorkspaceError> {
        let repo_key = git::canonical_repo_key(repo_root);
        let semaphore = self.registry.semaphore_for(&repo_key);
        let _permit = timeout(self.lock_timeout, semaphore.acquire())
            .await
            .map_err(|_| WorkspaceError::LockTimeout(repo_key.display().to_string()))?
            .expect("semaphore never closed");

        if worktree_path.exists() {
            self.recover_stale_locked(repo_root, worktree_path)?;
        }

        let base_branch = git::detect_default_branch(repo_root).map_err(|e| WorkspaceError::Git(e.to_string()))?;
        git::create_worktree(repo_root, worktree_path, branch, &base_branch)
            .map_err(|e| WorkspaceError::Git(e.to_string()))
    }

    /// Remove a worktree: try a graceful removal, then force even if dirty.
    pub async fn remove(&self, repo_root: &Path, worktree_path: &Path) -> Result<(), WorkspaceError> {
        let repo_key = git::canonical_repo_key(repo_root);
        let semaphore = self.registry.semaphore_for(&repo_key);
        let _permit = timeout(self.lock_timeout, semaphore.acquire())
            .await
            .map_err(|_| WorkspaceError::LockTimeout(repo_key.display().to_string()))?
            .expect("semaphore never closed");

        if git::remove_worktree(repo_root, worktree_path, false).is_err() {
            git::remove_worktree(repo_root, worktree_path, true).map_err(|e| WorkspaceError::Git(e.to_string()))?;
        }
        Ok(())
    }

    /// Assumes the repo-scoped lock is already held by the caller.
    fn recover_stale_locked(&self, repo_root: &Path, worktree_path: &Path) -> Result<(), WorkspaceError> {
        let _ = git::prune_worktrees(repo_root);
        let _ = git::remove_worktree(repo_root, worktree_path, true);
        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            StdCommand::new("git").args(&args).current_dir(dir.path()).output().unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        StdCommand::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn create_then_remove_round_trips() {
        let repo = setup_test_repo();
        let manager = WorkspaceManager::new(Arc::new(RepoLockRegistry::new()));
        let worktree_path = repo.path().parent().unwrap().join("wave-ws-test");

        manager.create(repo.path(), &worktree_path, "r1-step-a").await.unwrap();
        assert!(worktree_path.exists());

        manager.remove(repo.path(), &worktree_path).await.unwrap();
        assert!(!worktree_path.exists());
    }

    #[tokio::test]
    async fn recovers_from_stale_directory_without_worktree_registration() {
        let repo = setup_test_repo();
        let manager = WorkspaceManager::new(Arc::new(RepoLockRegistry::new()));
        let worktree_path = repo.path().parent().unwrap().join("wave-ws-stale");

        std::fs::create_dir_all(&worktree_path).unwrap();
        std::fs::write(worktree_path.join("leftover.txt"), "junk").unwrap();

        manager.create(repo.path(), &worktree_path, "r1-step-b").await.unwrap();
        assert!(worktree_path.join(".git").exists() || worktree_path.exists());
    }

    #[tokio::test]
    async fn same_repo_key_shares_one_semaphore() {
        let repo = setup_test_repo();
        let registry = Arc::new(RepoLockRegistry::new());
        let key = git::canonical_repo_key(repo.path());
        let a = registry.semaphore_for(&key);
        let b = registry.semaphore_for(&key);
        assert_eq!(a.available_permits(), b.available_permits());
        assert!(Arc::ptr_eq(&a, &b));
    }
}
