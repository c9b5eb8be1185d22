//! Wave execution engine.
//!
//! Owns everything a run needs: the SQLite-backed event/state store, the
//! in-process SSE broker, the git-worktree workspace manager, the adapter
//! layer, and the executor that ties them together. There is no daemon
//! process — `wave-cli` links this crate directly and drives runs in-process,
//! optionally exposing the read-only HTTP/SSE surface in `http` alongside.

pub mod adapter;
pub mod broker;
pub mod contract;
pub mod executor;
pub mod git;
pub mod http;
pub mod preflight;
pub mod recovery;
pub mod store;
pub mod workspace;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use adapter::claude::ClaudeAdapter;
use adapter::fake::FakeAdapter;
use adapter::AdapterImpl;
use broker::BrokerHandle;
use executor::Executor;
use store::Store;
use wave_core::Manifest;
use workspace::{RepoLockRegistry, WorkspaceManager};

/// Application-level errors with context, matching the corpus's convention of
/// using `eyre` at the top level and `thiserror` for the typed leaves.
pub type AppResult<T> = eyre::Result<T>;

/// Grace period given to in-flight steps to observe cancellation before a
/// caller (e.g. the CLI's SIGINT handler) force-exits the process.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Everything needed to construct an [`Engine`]: resolved filesystem roots
/// plus the already-parsed manifest. Resolving `wave.yaml` and its relative
/// paths is the caller's job (`wave-cli`'s project-root discovery).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub repo_root: PathBuf,
    pub db_path: PathBuf,
    pub worktree_root: PathBuf,
    pub artifacts_root: PathBuf,
    pub personas_root: PathBuf,
    pub schemas_root: PathBuf,
    pub manifest: Manifest,
}

/// Owns every long-lived subsystem for one `wave.yaml` project: the store,
/// the broker, and the executor built on top of them. Cheap to keep around
/// for the lifetime of a CLI invocation or an embedded `serve` process.
pub struct Engine {
    store: Store,
    broker: BrokerHandle,
    executor: Arc<Executor>,
    cancel: CancellationToken,
}

impl Engine {
    pub async fn new(config: EngineConfig) -> AppResult<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&config.worktree_root)?;
        std::fs::create_dir_all(&config.artifacts_root)?;

        let store = Store::open(&config.db_path).await?;
        let cancel = CancellationToken::new();
        let broker = broker::spawn(cancel.clone());
        let workspace = WorkspaceManager::new(Arc::new(RepoLockRegistry::new()));
        let adapters = build_adapters(&config.manifest)?;

        let executor = Executor::new(
            store.clone(),
            broker.clone(),
            workspace,
            config.manifest.clone(),
            adapters,
            config.repo_root,
            config.worktree_root,
            config.artifacts_root,
            config.personas_root,
            config.schemas_root,
        );

        Ok(Self {
            store,
            broker,
            executor: Arc::new(executor),
            cancel,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// A fresh clone of the run-cancellation token, e.g. to wire a SIGINT
    /// handler in `wave-cli` to `Executor::execute`'s `cancel` argument.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every in-flight run and give the broker's subscriber channels a
    /// moment to drain before the caller tears down the process.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

/// Resolve the manifest's adapter declarations into running adapter values.
/// Adapter `type` is a small closed set (`claude`, `fake`); anything else is
/// a manifest authoring error caught here rather than deep inside a run.
fn build_adapters(manifest: &Manifest) -> AppResult<HashMap<String, AdapterImpl>> {
    let mut adapters = HashMap::with_capacity(manifest.adapters.len());
    for (name, config) in &manifest.adapters {
        let built = match config.kind.as_str() {
            "claude" => AdapterImpl::Claude(ClaudeAdapter::new()),
            "fake" => AdapterImpl::Fake(FakeAdapter::new()),
            other => eyre::bail!("adapter `{name}` declares unknown type `{other}` (expected `claude` or `fake`)"),
        };
        adapters.insert(name.clone(), built);
    }
    Ok(adapters)
}
