//! Terminal output for Wave CLI commands: a `table` renderer matching the
//! fixed-width convention used throughout, and a `json` renderer that is
//! just `serde_json::to_string_pretty` on the same values.

use chrono::{DateTime, Utc};
use wave_core::{Run, RunStatus};
use wave_engine::recovery::RecoveryHint;
use wave_engine::store::{ArtifactRow, StepProgressRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown format `{other}` (expected `table` or `json`)")),
        }
    }
}

pub fn print_run_list(runs: &[Run], format: OutputFormat) {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(runs).unwrap_or_default());
        return;
    }
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }
    println!("{:<40}  {:<20}  {:<10}  {:<20}", "RUN ID", "PIPELINE", "STATUS", "CREATED");
    println!("{}", "-".repeat(96));
    for run in runs {
        println!(
            "{:<40}  {:<20}  {:<10}  {:<20}",
            truncate(&run.run_id, 40),
            truncate(&run.pipeline_name, 20),
            format_status(run.status),
            format_time(&run.created_at),
        );
    }
    println!();
    println!("{} run(s)", runs.len());
}

pub fn print_run_details(run: &Run, steps: &[StepProgressRow], format: OutputFormat) {
    if format == OutputFormat::Json {
        println!("{}", serde_json::json!({ "run": run, "steps": steps }));
        return;
    }

    println!("Run:      {}", run.run_id);
    println!("Pipeline: {}", run.pipeline_name);
    println!("Status:   {}", format_status(run.status));
    println!("Input:    {}", run.input);
    println!("Created:  {}", format_time(&run.created_at));
    println!("Updated:  {}", format_time(&run.updated_at));
    if let Some(completed_at) = run.completed_at {
        println!("Finished: {}", format_time(&completed_at));
    }

    if !steps.is_empty() {
        println!();
        println!("{:<20}  {:<14}  {:<10}  {:>8}  {:>6}", "STEP", "PERSONA", "STATE", "PROGRESS", "TOKENS");
        println!("{}", "-".repeat(66));
        for step in steps {
            println!(
                "{:<20}  {:<14}  {:<10}  {:>7.0}%  {:>6}",
                truncate(&step.step_id, 20),
                truncate(&step.persona, 14),
                step.state,
                step.progress * 100.0,
                step.tokens_used,
            );
        }
    }
}

pub fn print_artifacts(artifacts: &[ArtifactRow], format: OutputFormat) {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(artifacts).unwrap_or_default());
        return;
    }
    if artifacts.is_empty() {
        println!("No artifacts registered.");
        return;
    }
    println!("{:<16}  {:<20}  {:>10}  {:<20}", "STEP", "NAME", "BYTES", "PATH");
    println!("{}", "-".repeat(90));
    for artifact in artifacts {
        println!(
            "{:<16}  {:<20}  {:>10}  {:<20}",
            truncate(&artifact.step_id, 16),
            truncate(&artifact.name, 20),
            artifact.size_bytes,
            artifact.path,
        );
    }
}

pub fn print_recovery_hint(hint: &RecoveryHint) {
    eprintln!();
    eprintln!("Recovery ({:?}):", hint.class);
    for line in &hint.lines {
        eprintln!("  {line}");
    }
}

fn format_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Paused => "paused",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

fn format_time(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}…", &s[..max_len.saturating_sub(1)])
    }
}
