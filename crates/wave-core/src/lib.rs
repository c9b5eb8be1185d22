//! Data model, DAG planning, and error taxonomy for the Wave pipeline runtime.
//!
//! This crate has no I/O: no filesystem, no subprocess, no database. Anything
//! that touches the outside world lives in `wave-engine`.

pub mod artifact;
pub mod contract;
pub mod error;
pub mod event;
pub mod id;
pub mod manifest;
pub mod permission;
pub mod pipeline;
pub mod run;
pub mod step_progress;
pub mod template;
pub mod workspace_entry;

pub use artifact::Artifact;
pub use contract::{ContractDefError, ContractKind, HandoverContract, OnFailure};
pub use error::{
    AdapterError, ErrorClass, SecurityValidationError, SkillError, StepError, ToolError,
    ValidationError, WorkspaceError, classify,
};
pub use event::{Event, EventKind};
pub use id::{Id, run_id};
pub use manifest::{AdapterConfig, Manifest, ManifestError, PersonaConfig, RuntimeConfig};
pub use permission::{PatternParseError, PermissionSet, ToolPattern, glob_match};
pub use pipeline::{
    ArtifactInjection, ExecDef, InputSource, MatrixStrategy, MemoryStrategy, MountMode,
    OutputArtifact, PersonaPaths, PipelineDef, PipelineMetadata, PipelineValidationError,
    Preflight, RunOptions, StepDef, parse_matrix_source,
};
pub use run::{Run, RunStatus};
pub use step_progress::{ProgressError, StepPhase, StepProgress, TokenUsage};
pub use template::{TemplateError, TemplateVars, render, step_artifact_key};
pub use workspace_entry::{WorkspaceEntry, WorkspaceState};
