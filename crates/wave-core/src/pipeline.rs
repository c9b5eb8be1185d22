//! Pipeline DAG definition, validation, and topological ordering.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::contract::{ContractDefError, HandoverContract};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStrategy {
    Fresh,
    InjectArtifacts,
}

impl Default for MemoryStrategy {
    fn default() -> Self {
        Self::Fresh
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    Readonly,
    Readwrite,
    Isolated,
}

impl Default for MountMode {
    fn default() -> Self {
        Self::Isolated
    }
}

/// One `source step id -> source artifact name -> target filename` rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInjection {
    pub source_step: String,
    pub source_artifact: String,
    pub target_filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecDef {
    Prompt { template: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixStrategy {
    /// `step_id/artifact_name` reference to an array-typed artifact.
    pub items_source: String,
    pub item_key: String,
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Preflight {
    pub required_skills: Vec<String>,
    pub required_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDef {
    pub id: String,
    pub persona: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub memory_strategy: MemoryStrategy,
    #[serde(default)]
    pub inject_artifacts: Vec<ArtifactInjection>,
    #[serde(default)]
    pub workspace_mount: MountMode,
    pub exec: ExecDef,
    #[serde(default)]
    pub output_artifacts: Vec<OutputArtifact>,
    #[serde(default)]
    pub handover: Option<HandoverContract>,
    #[serde(default)]
    pub strategy: Option<MatrixStrategy>,
    #[serde(default)]
    pub preflight: Preflight,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineMetadata {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDef {
    pub kind: String,
    pub metadata: PipelineMetadata,
    pub input: InputSource,
    pub steps: Vec<StepDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSource {
    Inline(String),
    File { file: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PipelineValidationError {
    #[error("pipeline has zero steps")]
    EmptySteps,
    #[error("duplicate step id `{0}`")]
    DuplicateStepId(String),
    #[error("step `{0}` depends on unknown step `{1}`")]
    UnknownDependency(String, String),
    #[error("dependency graph has a cycle involving step `{0}`")]
    Cycle(String),
    #[error("step `{step}` injects artifact `{artifact}` from step `{source}`, which does not declare it")]
    UnknownArtifactInjection {
        step: String,
        source: String,
        artifact: String,
    },
    #[error("step `{0}`'s matrix items_source must reference `step_id/artifact_name`")]
    MalformedItemsSource(String),
    #[error("step `{step}` matrix items_source references unknown step `{source}`")]
    UnknownMatrixSource { step: String, source: String },
    #[error(transparent)]
    Contract(#[from] ContractDefErrorWrapper),
}

/// Wraps `ContractDefError` so it can derive `PartialEq`/`Eq` for tests
/// (the underlying thiserror type does not).
#[derive(Debug)]
pub struct ContractDefErrorWrapper(pub ContractDefError);

impl std::fmt::Display for ContractDefErrorWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for ContractDefErrorWrapper {}
impl PartialEq for ContractDefErrorWrapper {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_string() == other.0.to_string()
    }
}
impl Eq for ContractDefErrorWrapper {}

impl From<ContractDefError> for PipelineValidationError {
    fn from(e: ContractDefError) -> Self {
        Self::Contract(ContractDefErrorWrapper(e))
    }
}

impl PipelineDef {
    /// Validate structural invariants: acyclic dependency graph; every
    /// dependency id exists; every artifact injection references a declared
    /// output; matrix items_source parses and resolves. Persona-ref and
    /// contract-schema-existence checks are layered on top by the executor's
    /// planner (they need the Manifest/filesystem).
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.steps.is_empty() {
            return Err(PipelineValidationError::EmptySteps);
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(PipelineValidationError::DuplicateStepId(step.id.clone()));
            }
        }

        let by_id: HashMap<&str, &StepDef> = self.steps.iter().map(|s| (s.id.as_str(), s)).collect();

        for step in &self.steps {
            for dep in &step.depends_on {
                if !by_id.contains_key(dep.as_str()) {
                    return Err(PipelineValidationError::UnknownDependency(
                        step.id.clone(),
                        dep.clone(),
                    ));
                }
            }
            for inj in &step.inject_artifacts {
                let source = by_id.get(inj.source_step.as_str()).ok_or_else(|| {
                    PipelineValidationError::UnknownDependency(step.id.clone(), inj.source_step.clone())
                })?;
                if !source.output_artifacts.iter().any(|a| a.name == inj.source_artifact) {
                    return Err(PipelineValidationError::UnknownArtifactInjection {
                        step: step.id.clone(),
                        source: inj.source_step.clone(),
                        artifact: inj.source_artifact.clone(),
                    });
                }
            }
            if let Some(strategy) = &step.strategy {
                let (source_step, _artifact) = strategy
                    .items_source
                    .split_once('/')
                    .ok_or_else(|| PipelineValidationError::MalformedItemsSource(step.id.clone()))?;
                if !by_id.contains_key(source_step) {
                    return Err(PipelineValidationError::UnknownMatrixSource {
                        step: step.id.clone(),
                        source: source_step.to_string(),
                    });
                }
            }
            if let Some(contract) = &step.handover {
                contract.validate(&step.id)?;
            }
        }

        self.topological_order()?;
        Ok(())
    }

    /// Topologically sort steps via DFS post-order, detecting cycles in O(V+E).
    pub fn topological_order(&self) -> Result<Vec<String>, PipelineValidationError> {
        let by_id: HashMap<&str, &StepDef> = self.steps.iter().map(|s| (s.id.as_str(), s)).collect();

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut order = Vec::with_capacity(self.steps.len());

        fn visit<'a>(
            id: &'a str,
            by_id: &HashMap<&'a str, &'a StepDef>,
            marks: &mut HashMap<&'a str, Mark>,
            order: &mut Vec<String>,
        ) -> Result<(), PipelineValidationError> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(PipelineValidationError::Cycle(id.to_string())),
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            if let Some(step) = by_id.get(id) {
                for dep in &step.depends_on {
                    visit(dep, by_id, marks, order)?;
                }
            }
            marks.insert(id, Mark::Done);
            order.push(id.to_string());
            Ok(())
        }

        for step in &self.steps {
            visit(&step.id, &by_id, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    pub fn step(&self, id: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps whose dependencies are all in `completed`.
    pub fn ready_steps<'a>(&'a self, completed: &HashSet<String>) -> Vec<&'a StepDef> {
        self.steps
            .iter()
            .filter(|s| !completed.contains(&s.id))
            .filter(|s| s.depends_on.iter().all(|d| completed.contains(d)))
            .collect()
    }
}

/// A parsed matrix reference (`step_id/artifact_name`).
pub fn parse_matrix_source(items_source: &str) -> Option<(&str, &str)> {
    items_source.split_once('/')
}

/// Options accepted by `Execute`/`Resume`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub from_step: Option<String>,
    pub force: bool,
    pub max_concurrency: Option<usize>,
    pub dry_run: bool,
    pub verbose: bool,
}

/// A `{personaName -> filesystem path}` hint map the loader hands the
/// executor; file discovery/layout conventions (`pipelines_dir`) live outside
/// the core crate.
pub type PersonaPaths = BTreeMap<String, PathBuf>;
