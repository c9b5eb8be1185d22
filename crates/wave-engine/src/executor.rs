//! Dispatches a pipeline's steps in dependency order, under a bounded
//! worker pool, persisting every transition and publishing it to the SSE
//! broker.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use wave_core::contract::OnFailure;
use wave_core::error::StepError;
use wave_core::template::{TemplateVars, render, step_artifact_key};
use wave_core::{
    AdapterConfig, Artifact, Event, EventKind, Id, Manifest, MatrixStrategy, PersonaConfig, PipelineDef, RunOptions, StepDef, StepPhase,
    StepProgress, TokenUsage, parse_matrix_source,
};

use crate::adapter::{AdapterImpl, RunConfig as AdapterRunConfig};
use crate::contract::{self as contract_validator, ContractError};
use crate::preflight::{self, PreflightFailure};
use crate::store::Store;
use crate::workspace::WorkspaceManager;

const SCHEMA_PROMPT_HEADER: &str = "\n\n<!-- WAVE-SCHEMA: the output must validate against this JSON Schema -->\n";
const SCHEMA_PROMPT_FOOTER: &str = "\n<!-- END-WAVE-SCHEMA -->\n";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("persona `{0}` is not declared in the manifest")]
    UnknownPersona(String),
    #[error("adapter `{0}` is not declared in the manifest")]
    UnknownAdapter(String),
    #[error(transparent)]
    Preflight(#[from] PreflightFailure),
    #[error(transparent)]
    Workspace(#[from] wave_core::error::WorkspaceError),
    #[error(transparent)]
    Template(#[from] wave_core::template::TemplateError),
    #[error(transparent)]
    Adapter(#[from] wave_core::error::AdapterError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("step `{step}` declared output artifact `{name}` at `{path}` but the adapter did not produce it")]
    ArtifactMissing { step: String, name: String, path: String },
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    ContractFailed(#[from] wave_core::error::ValidationError),
    #[error("cancelled")]
    Cancelled,
}

/// What a persona resolves to for one invocation: adapter to drive plus the
/// rendered system prompt text.
struct ResolvedPersona {
    adapter_name: String,
    system_prompt: String,
    allowed_tools: Vec<String>,
    deny_tools: Vec<String>,
    temperature: Option<f32>,
}

pub struct Executor {
    store: Store,
    broker: crate::broker::BrokerHandle,
    workspace: Arc<WorkspaceManager>,
    manifest: Arc<Manifest>,
    adapters: Arc<HashMap<String, AdapterImpl>>,
    repo_root: PathBuf,
    worktree_root: PathBuf,
    artifacts_root: PathBuf,
    personas_root: PathBuf,
    schemas_root: PathBuf,
    step_timeout: Duration,
}

/// Everything produced for one run, kept in memory for the duration of
/// `Execute`/`Resume` and written through to the store as it accumulates.
struct RunState {
    run_id: String,
    completed: HashSet<String>,
    skipped: HashSet<String>,
    /// Shared with every spawned step task so interleaved step-level and
    /// run-level events still get a strictly increasing sequence number.
    sequence: Arc<AtomicU64>,
    /// `step.X.Y` -> absolute path of the produced file, for template
    /// substitution and `inject_artifacts` copies.
    artifact_paths: HashMap<String, PathBuf>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        broker: crate::broker::BrokerHandle,
        workspace: WorkspaceManager,
        manifest: Manifest,
        adapters: HashMap<String, AdapterImpl>,
        repo_root: PathBuf,
        worktree_root: PathBuf,
        artifacts_root: PathBuf,
        personas_root: PathBuf,
        schemas_root: PathBuf,
    ) -> Self {
        Self {
            store,
            broker,
            workspace: Arc::new(workspace),
            manifest: Arc::new(manifest),
            adapters: Arc::new(adapters),
            repo_root,
            worktree_root,
            artifacts_root,
            personas_root,
            schemas_root,
            step_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Run a pipeline from scratch (or from `options.from_step`, treating
    /// all topologically-prior steps as already completed). `run_id` lets
    /// the caller mint the id up front (e.g. to write a pidfile before the
    /// run actually starts); pass `None` to have one generated here. Either
    /// way the id used is returned on success.
    pub async fn execute(
        &self,
        pipeline: &PipelineDef,
        input: &str,
        run_id: Option<String>,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<String, StepError> {
        self.run_pipeline(pipeline, input, options, cancel, run_id, false).await
    }

    /// Resume is `execute` against an already-created run id, picking up
    /// after `from_step` instead of minting a new run.
    pub async fn resume(&self, pipeline: &PipelineDef, run_input: &str, run_id: &str, from_step: &str, options: RunOptions, cancel: CancellationToken) -> Result<String, StepError> {
        let mut options = options;
        options.from_step = Some(from_step.to_string());
        self.run_pipeline(pipeline, run_input, options, cancel, Some(run_id.to_string()), true).await
    }

    async fn run_pipeline(
        &self,
        pipeline: &PipelineDef,
        input: &str,
        options: RunOptions,
        cancel: CancellationToken,
        run_id_override: Option<String>,
        is_resume: bool,
    ) -> Result<String, StepError> {
        pipeline
            .validate()
            .map_err(|e| StepError::new("<pipeline>", ExecutorErrorAdapter(e.to_string())))?;

        let now = chrono::Utc::now();
        let run_id = run_id_override.unwrap_or_else(|| wave_core::run_id(&pipeline.metadata.name, now, &Id::new().to_string()));

        if !options.dry_run {
            if is_resume {
                self.store
                    .update_run_status(&run_id, wave_core::RunStatus::Running, now)
                    .await
                    .map_err(|e| StepError::new("<pipeline>", e))?;
            } else {
                let run = wave_core::Run::new(run_id.clone(), &pipeline.metadata.name, input, now);
                self.store
                    .insert_run(&run)
                    .await
                    .map_err(|e| StepError::new("<pipeline>", e))?;
            }
        }

        let mut state = RunState {
            run_id: run_id.clone(),
            completed: HashSet::new(),
            skipped: HashSet::new(),
            sequence: Arc::new(AtomicU64::new(0)),
            artifact_paths: HashMap::new(),
        };

        if let Some(from_step) = &options.from_step {
            self.rehydrate_prior_steps(pipeline, from_step, &mut state)
                .await
                .map_err(|e| StepError::new(from_step.clone(), e))?;
        }

        self.emit(&mut state, None, EventKind::RunStarted, json!({ "pipeline": pipeline.metadata.name }))
            .await
            .ok();

        let result = self.run_dag(pipeline, input, &options, &mut state, cancel.clone()).await;

        if !options.dry_run {
            let final_status = match &result {
                Ok(()) => wave_core::RunStatus::Completed,
                Err(_) if cancel.is_cancelled() => wave_core::RunStatus::Cancelled,
                Err(_) => wave_core::RunStatus::Failed,
            };
            let _ = self.store.update_run_status(&run_id, final_status, chrono::Utc::now()).await;
            if let Err(e) = &result {
                let _ = self.store.set_run_error(&run_id, &e.to_string()).await;
            }
        }

        match result {
            Ok(()) => {
                self.emit(&mut state, None, EventKind::RunCompleted, json!({})).await.ok();
                Ok(run_id)
            }
            Err((step_id, err)) => {
                self.emit(&mut state, Some(step_id.clone()), EventKind::RunFailed, json!({ "error": err.to_string() }))
                    .await
                    .ok();
                Err(StepError::new(step_id, err))
            }
        }
    }

    async fn rehydrate_prior_steps(&self, pipeline: &PipelineDef, from_step: &str, state: &mut RunState) -> Result<(), ExecutorError> {
        let order = pipeline.topological_order().map_err(|e| ExecutorError::UnknownPersona(e.to_string()))?;
        for step_id in order {
            if step_id == from_step {
                break;
            }
            state.completed.insert(step_id.clone());
            let rows = self.store.list_artifacts(&state.run_id, Some(&step_id)).await?;
            for row in rows {
                let key = step_artifact_key(&row.step_id, &row.name);
                state.artifact_paths.insert(key, self.artifacts_root.join(&row.path));
            }
        }
        Ok(())
    }

    async fn run_dag(
        &self,
        pipeline: &PipelineDef,
        input: &str,
        options: &RunOptions,
        state: &mut RunState,
        cancel: CancellationToken,
    ) -> Result<(), (String, ExecutorError)> {
        let max_concurrency = options
            .max_concurrency
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4));
        let semaphore = Arc::new(Semaphore::new(max_concurrency));

        let mut in_flight: JoinSet<(String, Result<StepOutput, ExecutorError>)> = JoinSet::new();
        let mut dispatched: HashSet<String> = HashSet::new();
        let mut first_failure: Option<(String, ExecutorError)> = None;

        loop {
            if first_failure.is_none() && !cancel.is_cancelled() {
                let ready = pipeline.ready_steps(&state.completed);
                for step in ready {
                    if dispatched.contains(&step.id) || state.skipped.contains(&step.id) {
                        continue;
                    }
                    if step.depends_on.iter().any(|d| state.skipped.contains(d)) {
                        state.skipped.insert(step.id.clone());
                        continue;
                    }
                    dispatched.insert(step.id.clone());
                    let permit = semaphore.clone();
                    let step = step.clone();
                    let strategy = step.strategy.clone();
                    let input = input.to_string();
                    let run_id = state.run_id.clone();
                    let artifact_paths = state.artifact_paths.clone();
                    let force = options.dry_run || options.force;
                    let cancel = cancel.clone();
                    let this = self.clone_for_task(state.sequence.clone());
                    in_flight.spawn(async move {
                        let _permit = permit.acquire_owned().await;
                        let result = match strategy {
                            Some(strategy) => this.run_matrix_step(&run_id, &step, &strategy, &input, &artifact_paths, force, cancel).await,
                            None => this.run_step(&run_id, &step, &input, &artifact_paths, force, cancel, None, None).await,
                        };
                        (step.id, result)
                    });
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (step_id, result) = joined.expect("step task panicked");
            match result {
                Ok(output) => {
                    state.completed.insert(step_id.clone());
                    for (key, path) in output.artifact_paths {
                        state.artifact_paths.insert(key, path);
                    }
                }
                Err(err) => {
                    if first_failure.is_none() {
                        first_failure = Some((step_id, err));
                        cancel.cancel();
                    }
                }
            }
        }

        if let Some(failure) = first_failure {
            return Err(failure);
        }
        Ok(())
    }

    /// A lightweight handle carrying only what a spawned step task needs,
    /// cheap to clone per-dispatch since every field is an `Arc`/`Clone` type.
    fn clone_for_task(&self, sequence: Arc<AtomicU64>) -> StepRunner {
        StepRunner {
            store: self.store.clone(),
            broker: self.broker.clone(),
            sequence,
            workspace: self.workspace.clone(),
            manifest: self.manifest.clone(),
            adapters: self.adapters.clone(),
            repo_root: self.repo_root.clone(),
            worktree_root: self.worktree_root.clone(),
            artifacts_root: self.artifacts_root.clone(),
            personas_root: self.personas_root.clone(),
            schemas_root: self.schemas_root.clone(),
            step_timeout: self.step_timeout,
        }
    }

    async fn emit(&self, state: &mut RunState, step_id: Option<String>, kind: EventKind, payload: serde_json::Value) -> Result<(), ExecutorError> {
        emit_event(&self.store, &self.broker, &state.sequence, &state.run_id, step_id, kind, payload).await
    }
}

/// Shared by the dispatch loop's own run-level events and every concurrently
/// spawned step task, so both draw from the same sequence counter.
async fn emit_event(
    store: &Store,
    broker: &crate::broker::BrokerHandle,
    sequence: &AtomicU64,
    run_id: &str,
    step_id: Option<String>,
    kind: EventKind,
    payload: serde_json::Value,
) -> Result<(), ExecutorError> {
    let seq = sequence.fetch_add(1, Ordering::SeqCst);
    let mut event = Event::new(run_id, kind, payload, seq, chrono::Utc::now());
    if let Some(step_id) = step_id {
        event = event.for_step(step_id);
    }
    store.log_event(&event).await?;
    broker.publish(event);
    Ok(())
}

/// Adapts an arbitrary `Display`-able validation failure into something
/// `StepError` can box.
#[derive(Debug)]
struct ExecutorErrorAdapter(String);
impl std::fmt::Display for ExecutorErrorAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for ExecutorErrorAdapter {}

struct StepOutput {
    artifact_paths: HashMap<String, PathBuf>,
}

/// The per-step worker. Cloned cheaply out of `Executor` for each dispatch
/// so step tasks don't need to borrow the executor across an `.await`.
#[derive(Clone)]
struct StepRunner {
    store: Store,
    broker: crate::broker::BrokerHandle,
    sequence: Arc<AtomicU64>,
    workspace: Arc<WorkspaceManager>,
    manifest: Arc<Manifest>,
    adapters: Arc<HashMap<String, AdapterImpl>>,
    repo_root: PathBuf,
    worktree_root: PathBuf,
    artifacts_root: PathBuf,
    personas_root: PathBuf,
    schemas_root: PathBuf,
    step_timeout: Duration,
}

impl StepRunner {
    fn adapter(&self, name: &str) -> Option<&AdapterImpl> {
        self.adapters.get(name)
    }

    fn resolve_persona(&self, persona_name: &str) -> Result<(ResolvedPersona, AdapterConfig), ExecutorError> {
        let persona: &PersonaConfig = self
            .manifest
            .personas
            .get(persona_name)
            .ok_or_else(|| ExecutorError::UnknownPersona(persona_name.to_string()))?;
        let adapter_config = self
            .manifest
            .adapters
            .get(&persona.adapter)
            .ok_or_else(|| ExecutorError::UnknownAdapter(persona.adapter.clone()))?
            .clone();

        let system_prompt = if let Some(path) = &persona.system_prompt_file {
            std::fs::read_to_string(self.personas_root.join(path))?
        } else {
            persona.system_prompt.clone().unwrap_or_default()
        };

        Ok((
            ResolvedPersona {
                adapter_name: persona.adapter.clone(),
                system_prompt,
                allowed_tools: persona.allowed_tools.clone(),
                deny_tools: persona.deny_tools.clone(),
                temperature: persona.temperature,
            },
            adapter_config,
        ))
    }

    async fn emit(&self, run_id: &str, step_id: &str, kind: EventKind, payload: serde_json::Value) {
        let _ = emit_event(&self.store, &self.broker, &self.sequence, run_id, Some(step_id.to_string()), kind, payload).await;
    }

    async fn run_step(
        &self,
        run_id: &str,
        step: &StepDef,
        input: &str,
        artifact_paths: &HashMap<String, PathBuf>,
        force: bool,
        cancel: CancellationToken,
        matrix_index: Option<usize>,
        matrix_item: Option<(String, serde_json::Value)>,
    ) -> Result<StepOutput, ExecutorError> {
        preflight::check(&step.preflight.required_tools, &step.preflight.required_skills, &self.repo_root)?;

        let mut progress = StepProgress::pending(run_id, &step.id);
        progress.matrix_index = matrix_index;
        let mut attempt_artifact_paths = artifact_paths.clone();

        self.emit(run_id, &step.id, EventKind::StepStarted, json!({ "persona": step.persona, "matrix_index": matrix_index })).await;

        let step_ref = match matrix_index {
            Some(idx) => format!("{}-m{idx}", step.id),
            None => step.id.clone(),
        };

        let max_retries = step.handover.as_ref().map(|h| h.max_retries).unwrap_or(0);
        let mut attempt = 0u32;
        loop {
            let workspace_path = self.worktree_root.join(run_id).join(format!("{step_ref}-{attempt}"));
            let branch = crate::git::step_branch_name(run_id, &step_ref);

            progress.advance(StepPhase::Running, chrono::Utc::now()).ok();
            self.store.update_step_progress(&progress, &step.persona).await?;

            self.workspace.create(&self.repo_root, &workspace_path, &branch).await?;

            let result = self
                .run_single_attempt(
                    run_id,
                    step,
                    input,
                    &mut attempt_artifact_paths,
                    &workspace_path,
                    force,
                    cancel.clone(),
                    &mut progress,
                    matrix_index,
                    matrix_item.as_ref(),
                )
                .await;

            let _ = self.workspace.remove(&self.repo_root, &workspace_path).await;

            match result {
                Ok(output) => {
                    progress.advance(StepPhase::Completed, chrono::Utc::now()).ok();
                    self.store.update_step_progress(&progress, &step.persona).await?;
                    self.emit(run_id, &step.id, EventKind::StepCompleted, json!({ "persona": step.persona })).await;
                    return Ok(output);
                }
                Err(StepAttemptError::ContractFailed(outcome_message, _produced)) if attempt < max_retries => {
                    self.emit(run_id, &step.id, EventKind::ContractFailed, json!({ "message": outcome_message })).await;
                    attempt += 1;
                    progress.advance(StepPhase::Retrying, chrono::Utc::now()).ok();
                    self.store.update_step_progress(&progress, &step.persona).await?;
                    self.emit(run_id, &step.id, EventKind::ContractRetried, json!({ "attempt": attempt })).await;
                    continue;
                }
                Err(StepAttemptError::ContractFailed(message, produced)) => {
                    self.emit(run_id, &step.id, EventKind::ContractFailed, json!({ "message": message.clone() })).await;
                    let on_failure = step.handover.as_ref().map(|h| h.on_failure).unwrap_or(OnFailure::Fail);
                    if on_failure == OnFailure::Continue {
                        progress.advance(StepPhase::Completed, chrono::Utc::now()).ok();
                        self.store.update_step_progress(&progress, &step.persona).await?;
                        self.emit(run_id, &step.id, EventKind::StepCompleted, json!({ "persona": step.persona, "contract_bypassed": true })).await;
                        return Ok(StepOutput { artifact_paths: produced });
                    }
                    progress.advance(StepPhase::Failed, chrono::Utc::now()).ok();
                    self.store.update_step_progress(&progress, &step.persona).await?;
                    self.emit(run_id, &step.id, EventKind::StepFailed, json!({ "message": message.clone() })).await;
                    return Err(ExecutorError::ContractFailed(wave_core::error::ValidationError::new(step.id.clone(), message)));
                }
                Err(StepAttemptError::Other(err)) => {
                    let phase = if cancel.is_cancelled() { StepPhase::Cancelled } else { StepPhase::Failed };
                    progress.advance(phase, chrono::Utc::now()).ok();
                    self.store.update_step_progress(&progress, &step.persona).await?;
                    let kind = if cancel.is_cancelled() { EventKind::StepSkipped } else { EventKind::StepFailed };
                    self.emit(run_id, &step.id, kind, json!({ "message": err.to_string() })).await;
                    return Err(err);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_single_attempt(
        &self,
        run_id: &str,
        step: &StepDef,
        input: &str,
        artifact_paths: &mut HashMap<String, PathBuf>,
        workspace_path: &Path,
        force: bool,
        cancel: CancellationToken,
        progress: &mut StepProgress,
        matrix_index: Option<usize>,
        matrix_item: Option<&(String, serde_json::Value)>,
    ) -> Result<StepOutput, StepAttemptError> {
        for injection in &step.inject_artifacts {
            let key = step_artifact_key(&injection.source_step, &injection.source_artifact);
            let source_path = artifact_paths
                .get(&key)
                .ok_or_else(|| StepAttemptError::Other(ExecutorError::ArtifactMissing {
                    step: step.id.clone(),
                    name: injection.source_artifact.clone(),
                    path: key.clone(),
                }))?;
            let target = workspace_path.join(&injection.target_filename);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(ExecutorError::from)?;
            }
            std::fs::copy(source_path, &target).map_err(ExecutorError::from)?;
        }

        let mut vars: TemplateVars = BTreeMap::new();
        vars.insert("input".to_string(), input.to_string());
        for (key, path) in artifact_paths.iter() {
            if let Ok(content) = std::fs::read_to_string(path) {
                vars.insert(key.clone(), content);
            }
        }
        if let Some((key, value)) = matrix_item {
            vars.insert(key.clone(), matrix_value_to_string(value));
        }

        let ExecDefPrompt { template } = extract_prompt(&step.exec);
        let mut prompt = render(template, &vars).map_err(ExecutorError::from)?;

        let (persona, adapter_config) = self.resolve_persona(&step.persona).map_err(StepAttemptError::Other)?;

        if let Some(handover) = &step.handover {
            if let wave_core::ContractKind::JsonSchema { schema_path } = &handover.kind {
                let resolved = contract_validator::resolve_within_root(&self.schemas_root, schema_path).map_err(ExecutorError::from)?;
                let schema_text = std::fs::read_to_string(&resolved).map_err(ExecutorError::from)?;
                prompt.push_str(SCHEMA_PROMPT_HEADER);
                prompt.push_str(&schema_text);
                prompt.push_str(SCHEMA_PROMPT_FOOTER);
            }
        }

        let adapter = self
            .adapter(&persona.adapter_name)
            .ok_or_else(|| StepAttemptError::Other(ExecutorError::UnknownAdapter(persona.adapter_name.clone())))?;

        let run_config = AdapterRunConfig {
            command: adapter_config.command.clone(),
            persona_name: step.persona.clone(),
            workspace_path: workspace_path.to_path_buf(),
            prompt,
            system_prompt: persona.system_prompt,
            allowed_tools: persona.allowed_tools,
            deny_tools: persona.deny_tools,
            temperature: persona.temperature,
            timeout: self.step_timeout,
            env: adapter_config.env.clone(),
        };

        let output = adapter.run(&run_config, cancel).await.map_err(ExecutorError::from)?;
        progress.tokens = add_tokens(&progress.tokens, &output.tokens);

        let mut produced = HashMap::new();
        for declared in &step.output_artifacts {
            let path = workspace_path.join(&declared.path);
            if !path.exists() {
                return Err(StepAttemptError::Other(ExecutorError::ArtifactMissing {
                    step: step.id.clone(),
                    name: declared.name.clone(),
                    path: declared.path.clone(),
                }));
            }

            let dest_dir = match matrix_index {
                Some(idx) => self.artifacts_root.join(run_id).join(&step.id).join(idx.to_string()),
                None => self.artifacts_root.join(run_id).join(&step.id),
            };
            std::fs::create_dir_all(&dest_dir).map_err(ExecutorError::from)?;
            let dest = dest_dir.join(&declared.name);
            std::fs::copy(&path, &dest).map_err(ExecutorError::from)?;

            let bytes = std::fs::read(&dest).map_err(ExecutorError::from)?;
            let sha256 = hex_digest(&bytes);
            let relative_path = dest
                .strip_prefix(&self.artifacts_root)
                .unwrap_or(&dest)
                .to_string_lossy()
                .to_string();

            let artifact = Artifact {
                id: Id::new(),
                run_id: run_id.to_string(),
                step_id: step.id.clone(),
                name: declared.name.clone(),
                relative_path,
                size_bytes: bytes.len() as u64,
                sha256,
                created_at: chrono::Utc::now(),
                matrix_index,
            };
            self.store.register_artifact(&artifact).await.map_err(ExecutorError::from)?;
            let item_step_id = match matrix_index {
                Some(idx) => format!("{}.{idx}", step.id),
                None => step.id.clone(),
            };
            produced.insert(step_artifact_key(&item_step_id, &declared.name), dest);
        }

        if let Some(handover) = &step.handover {
            if !force {
                let primary = step.output_artifacts.first().ok_or_else(|| {
                    StepAttemptError::Other(ExecutorError::ArtifactMissing {
                        step: step.id.clone(),
                        name: "<none declared>".to_string(),
                        path: String::new(),
                    })
                })?;
                let artifact_path = match matrix_index {
                    Some(idx) => self.artifacts_root.join(run_id).join(&step.id).join(idx.to_string()).join(&primary.name),
                    None => self.artifacts_root.join(run_id).join(&step.id).join(&primary.name),
                };
                let outcome = contract_validator::validate(&handover.kind, &artifact_path, &self.schemas_root)
                    .await
                    .map_err(ExecutorError::from)?;
                if !outcome.passed {
                    return Err(StepAttemptError::ContractFailed(outcome.message.unwrap_or_default(), produced));
                }
            }
        }

        Ok(StepOutput { artifact_paths: produced })
    }

    /// Fans a step out over the JSON array at `strategy.items_source`,
    /// running one `run_step` per item under its own bounded semaphore.
    async fn run_matrix_step(
        &self,
        run_id: &str,
        step: &StepDef,
        strategy: &MatrixStrategy,
        input: &str,
        artifact_paths: &HashMap<String, PathBuf>,
        force: bool,
        cancel: CancellationToken,
    ) -> Result<StepOutput, ExecutorError> {
        let (source_step, source_artifact) = parse_matrix_source(&strategy.items_source).ok_or_else(|| ExecutorError::ArtifactMissing {
            step: step.id.clone(),
            name: strategy.items_source.clone(),
            path: String::new(),
        })?;
        let key = step_artifact_key(source_step, source_artifact);
        let source_path = artifact_paths.get(&key).ok_or_else(|| ExecutorError::ArtifactMissing {
            step: step.id.clone(),
            name: source_artifact.to_string(),
            path: key.clone(),
        })?;
        let text = std::fs::read_to_string(source_path)?;
        let items: Vec<serde_json::Value> = serde_json::from_str(&text).map_err(|e| ExecutorError::ArtifactMissing {
            step: step.id.clone(),
            name: format!("{source_artifact} is not a JSON array ({e})"),
            path: key.clone(),
        })?;

        self.emit(run_id, &step.id, EventKind::StepStarted, json!({ "persona": step.persona, "matrix_items": items.len() }))
            .await;

        let max_concurrency = strategy.max_concurrency.unwrap_or(items.len()).max(1);
        let item_semaphore = Arc::new(Semaphore::new(max_concurrency));
        let mut set: JoinSet<Result<StepOutput, ExecutorError>> = JoinSet::new();
        for (idx, item) in items.into_iter().enumerate() {
            let permit = item_semaphore.clone();
            let this = self.clone();
            let step = step.clone();
            let run_id = run_id.to_string();
            let input = input.to_string();
            let artifact_paths = artifact_paths.clone();
            let cancel = cancel.clone();
            let item_key = strategy.item_key.clone();
            set.spawn(async move {
                let _permit = permit.acquire_owned().await;
                this.run_step(&run_id, &step, &input, &artifact_paths, force, cancel, Some(idx), Some((item_key, item)))
                    .await
            });
        }

        let mut combined = HashMap::new();
        let mut failure: Option<ExecutorError> = None;
        while let Some(joined) = set.join_next().await {
            match joined.expect("matrix item task panicked") {
                Ok(output) => combined.extend(output.artifact_paths),
                Err(err) => {
                    if failure.is_none() {
                        cancel.cancel();
                        failure = Some(err);
                    }
                }
            }
        }

        if let Some(err) = failure {
            self.emit(run_id, &step.id, EventKind::StepFailed, json!({ "message": err.to_string() })).await;
            return Err(err);
        }
        self.emit(run_id, &step.id, EventKind::StepCompleted, json!({ "persona": step.persona })).await;
        Ok(StepOutput { artifact_paths: combined })
    }
}

/// Renders a matrix item value for template substitution: bare strings
/// unwrap their quotes, everything else falls back to its JSON form.
fn matrix_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

enum StepAttemptError {
    ContractFailed(String, HashMap<String, PathBuf>),
    Other(ExecutorError),
}

impl From<ExecutorError> for StepAttemptError {
    fn from(e: ExecutorError) -> Self {
        Self::Other(e)
    }
}

struct ExecDefPrompt<'a> {
    template: &'a str,
}

fn extract_prompt(exec: &wave_core::ExecDef) -> ExecDefPrompt<'_> {
    match exec {
        wave_core::ExecDef::Prompt { template } => ExecDefPrompt { template },
    }
}

fn add_tokens(a: &TokenUsage, b: &TokenUsage) -> TokenUsage {
    TokenUsage {
        input_tokens: a.input_tokens + b.input_tokens,
        output_tokens: a.output_tokens + b.output_tokens,
        cached_read_tokens: a.cached_read_tokens + b.cached_read_tokens,
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
