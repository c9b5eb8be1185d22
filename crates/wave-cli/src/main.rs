//! wave - command-line entry point for the agent pipeline orchestrator.
//!
//! Unlike a daemon/client pair, `wave` links `wave-engine` directly: `run`
//! and `resume` drive the executor in-process, and `serve` just exposes the
//! read-only HTTP/SSE surface alongside whatever else is happening.

mod project;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tracing_subscriber::{fmt, EnvFilter};

use project::Project;
use render::OutputFormat;
use wave_core::{PipelineDef, RunOptions, RunStatus};
use wave_engine::recovery::{self, RecoveryContext};
use wave_engine::{Engine, EngineConfig};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const EXIT_OK: u8 = 0;
const EXIT_ERROR: u8 = 1;
const EXIT_VALIDATION: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "wave")]
#[command(about = "Orchestrates multi-step AI pipelines against pluggable LLM adapters")]
#[command(version)]
struct Cli {
    /// Project root (default: nearest ancestor directory with `wave.yaml`)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scaffold a default manifest, persona, and pipeline
    Init {
        /// Directory to scaffold into (default: current directory)
        path: Option<PathBuf>,
    },
    /// Run a pipeline from scratch
    Run {
        pipeline: String,
        input: String,
        #[arg(long, value_name = "ID")]
        from_step: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        debug: bool,
        #[arg(long, default_value = "text")]
        output: String,
    },
    /// Resume a previously started run from its last incomplete step
    Resume {
        run_id: String,
        #[arg(long, value_name = "ID")]
        from_step: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Cancel a run: graceful by default, forced with --force
    Cancel {
        run_id: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Show run status
    Status {
        run_id: Option<String>,
        #[arg(long)]
        all: bool,
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// Print (or follow) a run's event log
    Logs {
        run_id: Option<String>,
        #[arg(long, value_name = "ID")]
        step: Option<String>,
        #[arg(long)]
        follow: bool,
        #[arg(long, default_value = "all")]
        level: String,
    },
    /// List or export a run's registered artifacts
    Artifacts {
        run_id: Option<String>,
        #[arg(long, value_name = "ID")]
        step: Option<String>,
        #[arg(long)]
        export: Option<PathBuf>,
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// Remove old run state (worktrees are already gone; this prunes rows and artifacts)
    Clean {
        #[arg(long)]
        all: bool,
        #[arg(long)]
        pipeline: Option<String>,
        #[arg(long)]
        keep_last: Option<usize>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        quiet: bool,
    },
    /// List manifest-declared resources
    List {
        #[command(subcommand)]
        what: ListWhat,
    },
    /// Serve the read-only HTTP/SSE API
    Serve {
        #[arg(long, default_value_t = 7700)]
        port: u16,
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
    },
    /// Validate the manifest and every pipeline under pipelines_dir
    Validate,
}

#[derive(Subcommand)]
enum ListWhat {
    Pipelines {
        #[arg(long, default_value = "table")]
        format: String,
    },
    Personas {
        #[arg(long, default_value = "table")]
        format: String,
    },
    Adapters {
        #[arg(long, default_value = "table")]
        format: String,
    },
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(run(cli))
}

fn init_tracing() {
    let filter = std::env::var("WAVE_LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> ExitCode {
    let start_dir = cli.root.clone().unwrap_or_else(|| std::env::current_dir().expect("current directory"));

    if let Command::Init { path } = cli.command {
        return match run_init(path.unwrap_or(start_dir)) {
            Ok(()) => ExitCode::from(EXIT_OK),
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::from(EXIT_ERROR)
            }
        };
    }

    let project = match Project::load(&start_dir) {
        Ok(project) => project,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_VALIDATION);
        }
    };

    if let Command::Validate = cli.command {
        return match run_validate(&project) {
            Ok(()) => ExitCode::from(EXIT_OK),
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::from(EXIT_VALIDATION)
            }
        };
    }

    let engine = match Engine::new(EngineConfig {
        repo_root: project.root.clone(),
        db_path: project.db_path.clone(),
        worktree_root: project.worktree_root.clone(),
        artifacts_root: project.artifacts_root.clone(),
        personas_root: project.personas_root.clone(),
        schemas_root: project.schemas_root.clone(),
        manifest: project.manifest.clone(),
    })
    .await
    {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("error: failed to initialize engine: {e}");
            return ExitCode::from(EXIT_ERROR);
        }
    };

    let outcome = match cli.command {
        Command::Init { .. } | Command::Validate => unreachable!("handled above"),
        Command::Run { pipeline, input, from_step, force, concurrency, dry_run, debug, output } => {
            run_pipeline_cmd(&project, &engine, &pipeline, &input, from_step, force, concurrency, dry_run, debug, &output).await
        }
        Command::Resume { run_id, from_step, force } => resume_cmd(&project, &engine, &run_id, from_step, force).await,
        Command::Cancel { run_id, force } => cancel_cmd(&project, &engine, run_id, force).await,
        Command::Status { run_id, all, format } => status_cmd(&engine, run_id, all, &format).await,
        Command::Logs { run_id, step, follow, level } => logs_cmd(&engine, run_id, step, follow, &level).await,
        Command::Artifacts { run_id, step, export, format } => artifacts_cmd(&project, &engine, run_id, step, export, &format).await,
        Command::Clean { all, pipeline, keep_last, dry_run, force, quiet } => clean_cmd(&project, &engine, all, pipeline, keep_last, dry_run, force, quiet).await,
        Command::List { what } => list_cmd(&project, what).await,
        Command::Serve { port, bind } => serve_cmd(&engine, &bind, port).await,
    };

    engine.shutdown().await;
    outcome
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Project(#[from] project::ProjectError),
    #[error(transparent)]
    Store(#[from] wave_engine::store::StoreError),
    #[error(transparent)]
    Step(#[from] wave_core::error::StepError),
    #[error("unknown format `{0}` (expected `table` or `json`)")]
    Format(String),
    #[error("{0}")]
    PipelineInvalid(String),
    #[error("no run id given and no in-flight run found")]
    NoActiveRun,
}

fn parse_format(s: &str) -> Result<OutputFormat, CliError> {
    s.parse().map_err(CliError::Format)
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline_cmd(
    project: &Project,
    engine: &Engine,
    pipeline_name: &str,
    input: &str,
    from_step: Option<String>,
    force: bool,
    concurrency: Option<usize>,
    dry_run: bool,
    debug: bool,
    output: &str,
) -> ExitCode {
    let pipeline = match project.load_pipeline(pipeline_name) {
        Ok(p) => p,
        Err(e) => return report_error(&e, None, None),
    };

    let options = RunOptions {
        from_step,
        force,
        max_concurrency: concurrency,
        dry_run,
        verbose: debug,
    };

    let run_id = wave_core::run_id(&pipeline.metadata.name, chrono::Utc::now(), &wave_core::Id::new().to_string());
    let pidfile = write_pidfile(project, &run_id);

    let cancel = engine.cancellation();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let exec_future = engine.executor().execute(&pipeline, input, Some(run_id.clone()), options, cancel.clone());
    tokio::pin!(exec_future);

    let result = tokio::select! {
        result = &mut exec_future => result,
        _ = &mut ctrl_c => {
            eprintln!("received interrupt, cancelling run...");
            cancel.cancel();
            exec_future.await
        }
    };

    if pidfile {
        let _ = std::fs::remove_file(project.pidfile_path(&run_id));
    }

    finish_run(&pipeline, result, output).await
}

/// Writes this process's pid to `<run_root>/pids/<run_id>.pid` so a `wave
/// cancel <run-id>` invocation from another terminal can signal it. Best
/// effort: a failure here just means cross-process cancel falls back to a
/// plain status update.
fn write_pidfile(project: &Project, run_id: &str) -> bool {
    let path = project.pidfile_path(run_id);
    let Some(dir) = path.parent() else { return false };
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    std::fs::write(&path, std::process::id().to_string()).is_ok()
}

async fn resume_cmd(project: &Project, engine: &Engine, run_id: &str, from_step: Option<String>, force: bool) -> ExitCode {
    let run = match engine.store().get_run(run_id).await {
        Ok(run) => run,
        Err(e) => return report_error(&CliError::from(e), None, None),
    };
    let pipeline = match project.load_pipeline(&run.pipeline_name) {
        Ok(p) => p,
        Err(e) => return report_error(&e, None, None),
    };

    let from_step = match from_step {
        Some(step) => step,
        None => match first_incomplete_step(engine, run_id, &pipeline).await {
            Some(step) => step,
            None => {
                eprintln!("error: every step of `{run_id}` is already complete");
                return ExitCode::from(EXIT_ERROR);
            }
        },
    };

    let options = RunOptions { force, ..RunOptions::default() };
    let pidfile = write_pidfile(project, run_id);
    let cancel = engine.cancellation();
    let result = engine.executor().resume(&pipeline, &run.input, run_id, &from_step, options, cancel).await;
    if pidfile {
        let _ = std::fs::remove_file(project.pidfile_path(run_id));
    }
    finish_run(&pipeline, result, "text").await
}

async fn first_incomplete_step(engine: &Engine, run_id: &str, pipeline: &PipelineDef) -> Option<String> {
    let progress = engine.store().list_step_progress(run_id).await.ok()?;
    let done: std::collections::HashSet<&str> = progress
        .iter()
        .filter(|row| row.state == "completed")
        .map(|row| row.step_id.as_str())
        .collect();
    let order = pipeline.topological_order().ok()?;
    order.into_iter().find(|id| !done.contains(id.as_str()))
}

async fn finish_run(pipeline: &PipelineDef, result: Result<String, wave_core::error::StepError>, output: &str) -> ExitCode {
    match result {
        Ok(run_id) => {
            if output == "json" {
                println!("{}", serde_json::json!({ "run_id": run_id, "status": "completed" }));
            } else if output != "quiet" {
                println!("run {run_id} completed");
            }
            ExitCode::from(EXIT_OK)
        }
        Err(err) => {
            let cancelled = err.inner.to_string().contains("cancelled");
            let ctx = RecoveryContext {
                pipeline_name: &pipeline.metadata.name,
                input: "",
                step_id: &err.step_id,
                workspace_path: None,
                missing_names: &[],
            };
            let hint = recovery::hint_for(err.inner.as_ref(), &ctx);
            eprintln!("error: step `{}` failed: {}", err.step_id, err.inner);
            render::print_recovery_hint(&hint);

            if cancelled {
                ExitCode::from(EXIT_CANCELLED)
            } else {
                ExitCode::from(EXIT_ERROR)
            }
        }
    }
}

async fn cancel_cmd(project: &Project, engine: &Engine, run_id: Option<String>, force: bool) -> ExitCode {
    let run_id = match resolve_run_id(engine, run_id).await {
        Ok(id) => id,
        Err(e) => return report_error(&e, None, None),
    };

    let pidfile = project.pidfile_path(&run_id);
    match std::fs::read_to_string(&pidfile) {
        Ok(text) => {
            if let Ok(pid) = text.trim().parse::<i32>() {
                let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
                unsafe {
                    libc::kill(pid, signal);
                }
                println!("sent signal to run `{run_id}` (pid {pid})");
            }
        }
        Err(_) => {
            // No pidfile: the run isn't active in another process. Mark it
            // cancelled in the store so `wave status` reflects reality.
            let _ = engine.store().update_run_status(&run_id, RunStatus::Cancelled, chrono::Utc::now()).await;
            println!("run `{run_id}` has no active process; marked cancelled");
        }
    }
    ExitCode::from(EXIT_OK)
}

async fn resolve_run_id(engine: &Engine, run_id: Option<String>) -> Result<String, CliError> {
    match run_id {
        Some(id) => Ok(id),
        None => {
            let running = engine.store().list_runs(Some(RunStatus::Running), None, 1).await?;
            running.into_iter().next().map(|r| r.run_id).ok_or(CliError::NoActiveRun)
        }
    }
}

async fn status_cmd(engine: &Engine, run_id: Option<String>, all: bool, format: &str) -> ExitCode {
    let format = match parse_format(format) {
        Ok(f) => f,
        Err(e) => return report_error(&e, None, None),
    };

    if all || run_id.is_none() {
        let runs = match engine.store().list_runs(None, None, 100).await {
            Ok(runs) => runs,
            Err(e) => return report_error(&CliError::from(e), None, None),
        };
        render::print_run_list(&runs, format);
        return ExitCode::from(EXIT_OK);
    }

    let run_id = run_id.expect("checked above");
    let run = match engine.store().get_run(&run_id).await {
        Ok(run) => run,
        Err(e) => return report_error(&CliError::from(e), None, None),
    };
    let steps = engine.store().list_step_progress(&run_id).await.unwrap_or_default();
    render::print_run_details(&run, &steps, format);
    ExitCode::from(EXIT_OK)
}

async fn logs_cmd(engine: &Engine, run_id: Option<String>, step: Option<String>, follow: bool, level: &str) -> ExitCode {
    let run_id = match resolve_run_id(engine, run_id).await {
        Ok(id) => id,
        Err(e) => return report_error(&e, None, None),
    };

    let events = match engine.store().list_events(&run_id, step.as_deref(), 500).await {
        Ok(events) => events,
        Err(e) => return report_error(&CliError::from(e), None, None),
    };
    for event in &events {
        print_event(event, level);
    }

    if follow {
        let (subscriber_id, mut rx) = engine.broker().subscribe(run_id.clone()).await;
        while let Some(message) = rx.recv().await {
            if let wave_engine::broker::BrokerMessage::Event(event) = message {
                if step.as_deref().is_some_and(|s| event.step_id.as_deref() != Some(s)) {
                    continue;
                }
                print_event(&event, level);
            }
        }
        engine.broker().unsubscribe(run_id, subscriber_id);
    }
    ExitCode::from(EXIT_OK)
}

fn print_event(event: &wave_core::Event, level: &str) {
    let is_error = matches!(
        event.kind,
        wave_core::EventKind::RunFailed | wave_core::EventKind::StepFailed | wave_core::EventKind::ContractFailed
    );
    if level == "error" && !is_error {
        return;
    }
    let step = event.step_id.as_deref().unwrap_or("-");
    println!("{}  [{}]  {:?}  {}", event.created_at.format("%H:%M:%S"), step, event.kind, event.payload);
}

async fn artifacts_cmd(project: &Project, engine: &Engine, run_id: Option<String>, step: Option<String>, export: Option<PathBuf>, format: &str) -> ExitCode {
    let format = match parse_format(format) {
        Ok(f) => f,
        Err(e) => return report_error(&e, None, None),
    };
    let run_id = match resolve_run_id(engine, run_id).await {
        Ok(id) => id,
        Err(e) => return report_error(&e, None, None),
    };

    let artifacts = match engine.store().list_artifacts(&run_id, step.as_deref()).await {
        Ok(rows) => rows,
        Err(e) => return report_error(&CliError::from(e), None, None),
    };

    if let Some(dir) = export {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_ERROR);
        }
        for artifact in &artifacts {
            let source = project.artifacts_root.join(&artifact.path);
            let dest = dir.join(format!("{}-{}", artifact.step_id, artifact.name));
            if let Err(e) = std::fs::copy(&source, &dest) {
                eprintln!("error: failed to export `{}`: {e}", source.display());
                return ExitCode::from(EXIT_ERROR);
            }
        }
        println!("exported {} artifact(s) to {}", artifacts.len(), dir.display());
        return ExitCode::from(EXIT_OK);
    }

    render::print_artifacts(&artifacts, format);
    ExitCode::from(EXIT_OK)
}

async fn clean_cmd(
    project: &Project,
    engine: &Engine,
    all: bool,
    pipeline: Option<String>,
    keep_last: Option<usize>,
    dry_run: bool,
    force: bool,
    quiet: bool,
) -> ExitCode {
    let runs = match engine.store().list_runs(None, pipeline.as_deref(), 10_000).await {
        Ok(runs) => runs,
        Err(e) => return report_error(&CliError::from(e), None, None),
    };

    let mut doomed: Vec<_> = runs.into_iter().filter(|r| r.status.is_terminal()).collect();
    if !all {
        if let Some(keep) = keep_last {
            doomed.sort_by_key(|r| std::cmp::Reverse(r.created_at));
            doomed = doomed.into_iter().skip(keep).collect();
        }
    }

    if doomed.is_empty() {
        if !quiet {
            println!("nothing to clean");
        }
        return ExitCode::from(EXIT_OK);
    }

    if dry_run {
        for run in &doomed {
            println!("would remove run `{}` ({})", run.run_id, run.pipeline_name);
        }
        return ExitCode::from(EXIT_OK);
    }

    if !force && !quiet {
        eprintln!("refusing to delete {} run(s) without --force", doomed.len());
        return ExitCode::from(EXIT_ERROR);
    }

    for run in &doomed {
        for artifact in engine.store().list_artifacts(&run.run_id, None).await.unwrap_or_default() {
            let path = project.artifacts_root.join(&artifact.path);
            let _ = std::fs::remove_file(path);
        }
        let _ = engine.store().delete_run(&run.run_id).await;
        if !quiet {
            println!("removed run `{}`", run.run_id);
        }
    }
    ExitCode::from(EXIT_OK)
}

async fn list_cmd(project: &Project, what: ListWhat) -> ExitCode {
    match what {
        ListWhat::Pipelines { format } => {
            let format = match parse_format(&format) {
                Ok(f) => f,
                Err(e) => return report_error(&e, None, None),
            };
            let names = project.list_pipeline_names();
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&names).unwrap_or_default());
            } else {
                for name in names {
                    println!("{name}");
                }
            }
        }
        ListWhat::Personas { format } => {
            let format = match parse_format(&format) {
                Ok(f) => f,
                Err(e) => return report_error(&e, None, None),
            };
            let names: Vec<&String> = project.manifest.personas.keys().collect();
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&names).unwrap_or_default());
            } else {
                for name in names {
                    println!("{name}");
                }
            }
        }
        ListWhat::Adapters { format } => {
            let format = match parse_format(&format) {
                Ok(f) => f,
                Err(e) => return report_error(&e, None, None),
            };
            let names: Vec<&String> = project.manifest.adapters.keys().collect();
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&names).unwrap_or_default());
            } else {
                for name in names {
                    println!("{name}");
                }
            }
        }
    }
    ExitCode::from(EXIT_OK)
}

async fn serve_cmd(engine: &Engine, bind: &str, port: u16) -> ExitCode {
    let bind: std::net::IpAddr = match bind.parse() {
        Ok(ip) => ip,
        Err(e) => {
            eprintln!("error: invalid bind address `{bind}`: {e}");
            return ExitCode::from(EXIT_VALIDATION);
        }
    };
    let state = std::sync::Arc::new(wave_engine::http::AppState {
        store: engine.store().clone(),
        broker: engine.broker().clone(),
    });
    tokio::select! {
        result = wave_engine::http::start_server(state, bind, port) => {
            if let Err(e) = result {
                eprintln!("error: {e}");
                return ExitCode::from(EXIT_ERROR);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("shutting down");
        }
    }
    ExitCode::from(EXIT_OK)
}

fn run_validate(project: &Project) -> Result<(), CliError> {
    project.manifest.validate().map_err(project::ProjectError::from)?;
    for name in project.list_pipeline_names() {
        let pipeline = project.load_pipeline(&name)?;
        if let Err(e) = pipeline.validate() {
            return Err(CliError::PipelineInvalid(format!("pipeline `{name}` failed validation: {e}")));
        }
    }
    println!("manifest and pipelines are valid");
    Ok(())
}

fn run_init(path: PathBuf) -> std::io::Result<()> {
    std::fs::create_dir_all(&path)?;
    std::fs::create_dir_all(path.join("pipelines"))?;
    std::fs::create_dir_all(path.join("personas"))?;
    std::fs::create_dir_all(path.join("schemas"))?;

    let manifest = path.join("wave.yaml");
    if !manifest.exists() {
        std::fs::write(&manifest, DEFAULT_MANIFEST)?;
    }
    let persona = path.join("personas/reviewer.md");
    if !persona.exists() {
        std::fs::write(&persona, DEFAULT_PERSONA)?;
    }
    let pipeline = path.join("pipelines/review.yaml");
    if !pipeline.exists() {
        std::fs::write(&pipeline, DEFAULT_PIPELINE)?;
    }
    println!("scaffolded a wave project in {}", path.display());
    Ok(())
}

const DEFAULT_MANIFEST: &str = r#"adapters:
  claude:
    type: claude
    command: claude

personas:
  reviewer:
    adapter: claude
    system_prompt_file: personas/reviewer.md
    allowed_tools: ["Read", "Grep"]

pipelines_dir: pipelines
personas_dir: personas

runtime:
  run_root: .wave
  worktree_root: .wave/workspaces
  db_path: .wave/state.db
"#;

const DEFAULT_PERSONA: &str = "You are a meticulous code reviewer. Point out correctness issues first, \
style issues last.\n";

const DEFAULT_PIPELINE: &str = r#"kind: WavePipeline
metadata:
  name: review

input: "$ARG"

steps:
  - id: review
    persona: reviewer
    exec:
      type: prompt
      template: "Review the following change:\n\n{{input}}"
"#;

fn report_error(err: &dyn std::error::Error, _workspace: Option<&str>, _missing: Option<&[String]>) -> ExitCode {
    eprintln!("error: {err}");
    ExitCode::from(EXIT_VALIDATION)
}
