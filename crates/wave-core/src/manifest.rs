//! Process-wide manifest configuration (`wave.yaml`).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterConfig {
    /// Adapter kind, e.g. `claude`.
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersonaConfig {
    pub adapter: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub system_prompt_file: Option<PathBuf>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub deny_tools: Vec<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
    pub run_root: PathBuf,
    pub worktree_root: PathBuf,
    pub db_path: PathBuf,
    pub default_concurrency: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            run_root: PathBuf::from(".wave"),
            worktree_root: PathBuf::from(".wave/workspaces"),
            db_path: PathBuf::from(".wave/state.db"),
            default_concurrency: num_cpus_fallback(),
        }
    }
}

/// Conservative CPU-count fallback without a `num_cpus` dependency: the
/// corpus's `Config::default` already centralizes OS-specific defaults this
/// way, so a small inline heuristic fits the same idiom.
fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Manifest {
    pub adapters: BTreeMap<String, AdapterConfig>,
    pub personas: BTreeMap<String, PersonaConfig>,
    pub pipelines_dir: PathBuf,
    pub personas_dir: PathBuf,
    pub runtime: RuntimeConfig,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            adapters: BTreeMap::new(),
            personas: BTreeMap::new(),
            pipelines_dir: PathBuf::from("pipelines"),
            personas_dir: PathBuf::from("personas"),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("persona `{persona}` references unknown adapter `{adapter}`")]
    UnknownAdapterRef { persona: String, adapter: String },
    #[error("persona `{0}` allows and denies the same pattern; deny wins but this is almost always a config mistake")]
    RedundantAllowDeny(String),
    #[error("parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl Manifest {
    pub fn from_yaml(text: &str) -> Result<Self, ManifestError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Validate manifest-level invariants: every persona's adapter ref
    /// resolves; persona names are unique (guaranteed by the map); allow ∩
    /// deny is at least flagged (deny wins, but exact overlap signals a
    /// likely mistake worth surfacing at `wave validate` time).
    pub fn validate(&self) -> Result<(), ManifestError> {
        for (name, persona) in &self.personas {
            if !self.adapters.contains_key(&persona.adapter) {
                return Err(ManifestError::UnknownAdapterRef {
                    persona: name.clone(),
                    adapter: persona.adapter.clone(),
                });
            }
            for allowed in &persona.allowed_tools {
                if persona.deny_tools.contains(allowed) {
                    return Err(ManifestError::RedundantAllowDeny(name.clone()));
                }
            }
        }
        Ok(())
    }
}
