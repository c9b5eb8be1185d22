//! Project-root discovery and manifest/pipeline loading.
//!
//! A Wave project is rooted at the directory containing `wave.yaml`. Every
//! relative path in the manifest (`pipelines_dir`, `personas_dir`,
//! `runtime.*`) is resolved against that root, with `WAVE_*` environment
//! variables overriding the runtime paths.

use std::path::{Path, PathBuf};

use wave_core::pipeline::PipelineDef;
use wave_core::Manifest;

const MANIFEST_FILE: &str = "wave.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("no `wave.yaml` found in `{0}` or any parent directory")]
    ManifestNotFound(PathBuf),
    #[error("failed to read `{path}`: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error(transparent)]
    Manifest(#[from] wave_core::ManifestError),
    #[error("failed to parse pipeline `{path}`: {source}")]
    PipelineParse { path: PathBuf, source: serde_yaml::Error },
    #[error("no pipeline named `{0}` in `{1}`")]
    PipelineNotFound(String, PathBuf),
}

/// A loaded project: the manifest plus every path it implies, with
/// `WAVE_ROOT`/`WAVE_DB_PATH`/`WAVE_WORKTREE_ROOT` overrides already applied.
pub struct Project {
    pub root: PathBuf,
    pub manifest: Manifest,
    pub run_root: PathBuf,
    pub db_path: PathBuf,
    pub worktree_root: PathBuf,
    pub artifacts_root: PathBuf,
    pub personas_root: PathBuf,
    pub schemas_root: PathBuf,
    pub pipelines_root: PathBuf,
}

/// Walk up from `start` looking for `wave.yaml`.
pub fn find_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(MANIFEST_FILE).is_file() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

impl Project {
    pub fn load(start: &Path) -> Result<Self, ProjectError> {
        let root = find_root(start).ok_or_else(|| ProjectError::ManifestNotFound(start.to_path_buf()))?;
        let manifest_path = root.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&manifest_path).map_err(|source| ProjectError::Read {
            path: manifest_path.clone(),
            source,
        })?;
        let manifest = Manifest::from_yaml(&text)?;
        manifest.validate()?;

        let run_root = env_path_override("WAVE_ROOT").unwrap_or_else(|| root.join(&manifest.runtime.run_root));
        let db_path = env_path_override("WAVE_DB_PATH").unwrap_or_else(|| root.join(&manifest.runtime.db_path));
        let worktree_root = env_path_override("WAVE_WORKTREE_ROOT").unwrap_or_else(|| root.join(&manifest.runtime.worktree_root));

        Ok(Self {
            artifacts_root: run_root.join("artifacts"),
            personas_root: root.join(&manifest.personas_dir),
            schemas_root: root.join("schemas"),
            pipelines_root: root.join(&manifest.pipelines_dir),
            run_root,
            db_path,
            worktree_root,
            manifest,
            root,
        })
    }

    /// Load a `PipelineDef` by its declared `metadata.name`, scanning every
    /// `*.yaml`/`*.yml` file directly under `pipelines_dir`.
    pub fn load_pipeline(&self, name: &str) -> Result<PipelineDef, ProjectError> {
        let entries = std::fs::read_dir(&self.pipelines_root).map_err(|source| ProjectError::Read {
            path: self.pipelines_root.clone(),
            source,
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
            if !is_yaml {
                continue;
            }
            let text = std::fs::read_to_string(&path).map_err(|source| ProjectError::Read { path: path.clone(), source })?;
            let def: PipelineDef = serde_yaml::from_str(&text).map_err(|source| ProjectError::PipelineParse { path: path.clone(), source })?;
            if def.metadata.name == name {
                return Ok(def);
            }
        }

        Err(ProjectError::PipelineNotFound(name.to_string(), self.pipelines_root.clone()))
    }

    pub fn list_pipeline_names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.pipelines_root) else {
            return Vec::new();
        };
        let mut names = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
            if !is_yaml {
                continue;
            }
            if let Ok(text) = std::fs::read_to_string(&path) {
                if let Ok(def) = serde_yaml::from_str::<PipelineDef>(&text) {
                    names.push(def.metadata.name);
                }
            }
        }
        names.sort();
        names
    }

    /// Path used to track a `wave run`/`wave resume` invocation's OS process
    /// so `wave cancel <run-id>` from another invocation can signal it.
    pub fn pidfile_path(&self, run_id: &str) -> PathBuf {
        self.run_root.join("pids").join(format!("{run_id}.pid"))
    }
}

fn env_path_override(var: &str) -> Option<PathBuf> {
    std::env::var_os(var).map(PathBuf::from)
}
