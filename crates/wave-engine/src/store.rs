//! SQLite-backed state store: runs, events, step progress, artifacts, and
//! pipeline progress. One writer (the executor), many readers (the HTTP API
//! and `Resume`).

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::{Pool, Sqlite, sqlite::SqlitePoolOptions};
use std::path::Path;
use thiserror::Error;

use wave_core::{Artifact, Event, EventKind, Run, RunStatus, StepPhase, StepProgress, TokenUsage};

const RUNS_COLUMNS: &str = "run_id, pipeline_name, status, input, current_step, total_tokens, \
    started_at, completed_at, cancelled_at, error_message, tags_json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("run not found: {0}")]
    RunNotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&db_url).await?;
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        let store = Self { pool };
        store.migrate_embedded().await?;
        Ok(store)
    }

    /// In-memory pool for tests; still runs the real migrations.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await?;
        let store = Self { pool };
        store.migrate_embedded().await?;
        Ok(store)
    }

    /// Idempotent `CREATE TABLE IF NOT EXISTS` plus column-add migrations.
    /// Opening an older on-disk schema is fine; a newer one than this binary
    /// understands would need an explicit version check, which isn't needed
    /// yet since every migration so far is additive.
    async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [
            include_str!("../../../migrations/0001_init.sql"),
            include_str!("../../../migrations/0002_add_matrix_index.sql"),
        ];
        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- runs ---

    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs (run_id, pipeline_name, status, input, current_step, total_tokens, \
             started_at, completed_at, cancelled_at, error_message, tags_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, NULL, NULL, NULL)",
        )
        .bind(&run.run_id)
        .bind(&run.pipeline_name)
        .bind(status_str(run.status))
        .bind(&run.input)
        .bind(&run.resumed_from_step)
        .bind(run.created_at.timestamp_millis())
        .bind(run.completed_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        let row = sqlx::query_as::<_, RunRow>(&format!("SELECT {RUNS_COLUMNS} FROM runs WHERE run_id = ?1"))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        Ok(row.into_run())
    }

    pub async fn list_runs(&self, status: Option<RunStatus>, pipeline_name: Option<&str>, limit: i64) -> Result<Vec<Run>> {
        let mut query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE 1=1");
        if status.is_some() {
            query.push_str(" AND status = ?1");
        }
        if pipeline_name.is_some() {
            query.push_str(" AND pipeline_name = ?2");
        }
        query.push_str(" ORDER BY started_at DESC LIMIT ?3");

        let mut q = sqlx::query_as::<_, RunRow>(&query);
        if let Some(status) = status {
            q = q.bind(status_str(status));
        }
        if let Some(pipeline_name) = pipeline_name {
            q = q.bind(pipeline_name);
        }
        q = q.bind(limit);
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    pub async fn update_run_status(&self, run_id: &str, status: RunStatus, now: DateTime<Utc>) -> Result<()> {
        let completed_at = status.is_terminal().then(|| now.timestamp_millis());
        let cancelled_at = matches!(status, RunStatus::Cancelled).then(|| now.timestamp_millis());
        let result = sqlx::query(
            "UPDATE runs SET status = ?1, completed_at = COALESCE(?2, completed_at), \
             cancelled_at = COALESCE(?3, cancelled_at) WHERE run_id = ?4",
        )
        .bind(status_str(status))
        .bind(completed_at)
        .bind(cancelled_at)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    pub async fn set_run_error(&self, run_id: &str, message: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET error_message = ?1 WHERE run_id = ?2")
            .bind(message)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_run_tokens(&self, run_id: &str, tokens: u64) -> Result<()> {
        sqlx::query("UPDATE runs SET total_tokens = total_tokens + ?1 WHERE run_id = ?2")
            .bind(tokens as i64)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- events ---

    /// One of the four write entry points; appends to the audit log. The
    /// structured fields the schema carries alongside `state` (`persona`,
    /// `message`, `tokens_used`, `duration_ms`) are pulled out of the event's
    /// JSON payload when present; the full payload always round-trips inside
    /// `message` as a fallback for keys the schema doesn't model explicitly.
    pub async fn log_event(&self, event: &Event) -> Result<()> {
        let persona = event.payload.get("persona").and_then(|v| v.as_str());
        let message = event.payload.get("message").and_then(|v| v.as_str());
        let tokens_used = event.payload.get("tokens_used").and_then(|v| v.as_i64());
        let duration_ms = event.payload.get("duration_ms").and_then(|v| v.as_i64());

        sqlx::query(
            "INSERT INTO events (run_id, timestamp, step_id, state, persona, message, tokens_used, duration_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&event.run_id)
        .bind(event.created_at.timestamp_millis())
        .bind(&event.step_id)
        .bind(event_kind_str(event.kind))
        .bind(persona)
        .bind(message)
        .bind(tokens_used)
        .bind(duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_events(&self, run_id: &str, step_id: Option<&str>, limit: i64) -> Result<Vec<Event>> {
        let mut query = "SELECT id, run_id, timestamp, step_id, state, persona, message, tokens_used, duration_ms \
             FROM events WHERE run_id = ?1"
            .to_string();
        if step_id.is_some() {
            query.push_str(" AND step_id = ?2");
        }
        query.push_str(" ORDER BY id ASC LIMIT ?3");

        let mut q = sqlx::query_as::<_, EventRow>(&query).bind(run_id);
        if let Some(step_id) = step_id {
            q = q.bind(step_id);
        }
        q = q.bind(limit);
        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    // --- step progress ---

    /// One of the four write entry points; upserts a step's current phase.
    /// `persona` is passed separately since `StepProgress` itself doesn't
    /// carry it (the executor resolves persona from the pipeline, not the
    /// progress record).
    pub async fn update_step_progress(&self, progress: &StepProgress, persona: &str) -> Result<()> {
        let updated_at = progress.finished_at.unwrap_or_else(Utc::now);
        sqlx::query(
            "INSERT INTO step_progress (run_id, step_id, persona, state, progress, current_action, \
             message, started_at, updated_at, estimated_completion_ms, tokens_used, matrix_index) \
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6, ?7, NULL, ?8, ?9) \
             ON CONFLICT(run_id, step_id) DO UPDATE SET \
             state = excluded.state, updated_at = excluded.updated_at, tokens_used = excluded.tokens_used",
        )
        .bind(&progress.run_id)
        .bind(&progress.step_id)
        .bind(persona)
        .bind(phase_str(progress.phase))
        .bind(phase_progress_fraction(progress.phase))
        .bind(progress.started_at.map(|t| t.timestamp_millis()))
        .bind(updated_at.timestamp_millis())
        .bind(progress.tokens.billable_tokens() as i64)
        .bind(progress.matrix_index.map(|i| i as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_step_progress(&self, run_id: &str) -> Result<Vec<StepProgressRow>> {
        let rows = sqlx::query_as::<_, StepProgressRow>(
            "SELECT run_id, step_id, persona, state, progress, started_at, updated_at, tokens_used, matrix_index \
             FROM step_progress WHERE run_id = ?1 ORDER BY step_id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // --- artifacts ---

    /// One of the four write entry points.
    pub async fn register_artifact(&self, artifact: &Artifact) -> Result<()> {
        sqlx::query(
            "INSERT INTO artifacts (run_id, step_id, name, path, type, size_bytes, created_at, matrix_index) \
             VALUES (?1, ?2, ?3, ?4, 'file', ?5, ?6, ?7)",
        )
        .bind(&artifact.run_id)
        .bind(&artifact.step_id)
        .bind(&artifact.name)
        .bind(&artifact.relative_path)
        .bind(artifact.size_bytes as i64)
        .bind(artifact.created_at.timestamp_millis())
        .bind(artifact.matrix_index.map(|i| i as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_artifacts(&self, run_id: &str, step_id: Option<&str>) -> Result<Vec<ArtifactRow>> {
        let mut query =
            "SELECT run_id, step_id, name, path, size_bytes, created_at, matrix_index FROM artifacts WHERE run_id = ?1"
                .to_string();
        if step_id.is_some() {
            query.push_str(" AND step_id = ?2");
        }
        let mut q = sqlx::query_as::<_, ArtifactRow>(&query).bind(run_id);
        if let Some(step_id) = step_id {
            q = q.bind(step_id);
        }
        Ok(q.fetch_all(&self.pool).await?)
    }

    // --- pipeline progress ---

    /// One of the four write entry points.
    pub async fn update_pipeline_progress(&self, run_id: &str, total_steps: usize, completed_steps: usize, now: DateTime<Utc>) -> Result<()> {
        let overall_progress = if total_steps == 0 { 0.0 } else { completed_steps as f64 / total_steps as f64 };
        sqlx::query(
            "INSERT INTO pipeline_progress (run_id, total_steps, completed_steps, current_step_index, \
             overall_progress, estimated_completion_ms, updated_at) \
             VALUES (?1, ?2, ?3, ?3, ?4, NULL, ?5) \
             ON CONFLICT(run_id) DO UPDATE SET \
             completed_steps = excluded.completed_steps, current_step_index = excluded.current_step_index, \
             overall_progress = excluded.overall_progress, updated_at = excluded.updated_at",
        )
        .bind(run_id)
        .bind(total_steps as i64)
        .bind(completed_steps as i64)
        .bind(overall_progress)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- cleanup ---

    /// Removes every row for `run_id` across all tables. Callers are
    /// responsible for deleting the artifact files themselves first, since
    /// this only drops the database rows.
    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        for table in ["pipeline_progress", "artifacts", "step_progress", "events", "runs"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE run_id = ?1")).bind(run_id).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Paused => "paused",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

fn status_from_str(s: &str) -> RunStatus {
    match s {
        "running" => RunStatus::Running,
        "paused" => RunStatus::Paused,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        "cancelled" => RunStatus::Cancelled,
        _ => RunStatus::Pending,
    }
}

fn event_kind_str(kind: EventKind) -> &'static str {
    match kind {
        EventKind::RunStarted => "started",
        EventKind::RunCompleted => "completed",
        EventKind::RunFailed => "failed",
        EventKind::RunCancelled => "cancelled",
        EventKind::StepStarted => "running",
        EventKind::StepProgress => "step_progress",
        EventKind::StepCompleted => "completed",
        EventKind::StepFailed => "failed",
        EventKind::StepSkipped => "step_progress",
        EventKind::ContractFailed => "contract_failed",
        EventKind::ContractRetried => "contract_retried",
    }
}

fn phase_str(phase: StepPhase) -> &'static str {
    match phase {
        StepPhase::Pending => "pending",
        StepPhase::Preflight => "preflight",
        StepPhase::Running => "running",
        StepPhase::ValidatingContract => "validating_contract",
        StepPhase::Retrying => "retrying",
        StepPhase::Completed => "completed",
        StepPhase::Failed => "failed",
        StepPhase::Skipped => "skipped",
        StepPhase::Cancelled => "cancelled",
    }
}

fn phase_progress_fraction(phase: StepPhase) -> f64 {
    match phase {
        StepPhase::Pending => 0.0,
        StepPhase::Preflight => 0.1,
        StepPhase::Running => 0.5,
        StepPhase::ValidatingContract => 0.8,
        StepPhase::Retrying => 0.5,
        StepPhase::Completed => 1.0,
        StepPhase::Failed | StepPhase::Skipped | StepPhase::Cancelled => 1.0,
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    pipeline_name: String,
    status: String,
    input: String,
    current_step: Option<String>,
    #[allow(dead_code)]
    total_tokens: i64,
    started_at: i64,
    completed_at: Option<i64>,
    #[allow(dead_code)]
    cancelled_at: Option<i64>,
    #[allow(dead_code)]
    error_message: Option<String>,
    #[allow(dead_code)]
    tags_json: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Run {
        Run {
            id: wave_core::Id::from_string(self.run_id.clone()),
            run_id: self.run_id,
            pipeline_name: self.pipeline_name,
            input: self.input,
            status: status_from_str(&self.status),
            created_at: millis_to_utc(self.started_at),
            updated_at: self.completed_at.map(millis_to_utc).unwrap_or_else(|| millis_to_utc(self.started_at)),
            completed_at: self.completed_at.map(millis_to_utc),
            resumed_from_step: self.current_step,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    run_id: String,
    timestamp: i64,
    step_id: Option<String>,
    state: String,
    #[allow(dead_code)]
    persona: Option<String>,
    #[allow(dead_code)]
    message: Option<String>,
    #[allow(dead_code)]
    tokens_used: Option<i64>,
    #[allow(dead_code)]
    duration_ms: Option<i64>,
}

impl EventRow {
    fn into_event(self) -> Result<Event> {
        let kind = event_kind_from_state(&self.state);
        let mut event = Event::new(self.run_id, kind, serde_json::Value::Null, self.id as u64, millis_to_utc(self.timestamp));
        event.step_id = self.step_id;
        Ok(event)
    }
}

fn event_kind_from_state(state: &str) -> EventKind {
    match state {
        "started" => EventKind::RunStarted,
        "running" => EventKind::StepStarted,
        "completed" => EventKind::StepCompleted,
        "failed" => EventKind::StepFailed,
        "cancelled" => EventKind::RunCancelled,
        "contract_failed" => EventKind::ContractFailed,
        "contract_retried" => EventKind::ContractRetried,
        _ => EventKind::StepProgress,
    }
}

#[derive(sqlx::FromRow, Debug, Clone, Serialize)]
pub struct StepProgressRow {
    pub run_id: String,
    pub step_id: String,
    pub persona: String,
    pub state: String,
    pub progress: f64,
    pub started_at: Option<i64>,
    pub updated_at: i64,
    pub tokens_used: i64,
    pub matrix_index: Option<i64>,
}

#[derive(sqlx::FromRow, Debug, Clone, Serialize)]
pub struct ArtifactRow {
    pub run_id: String,
    pub step_id: String,
    pub name: String,
    pub path: String,
    pub size_bytes: i64,
    pub created_at: i64,
    pub matrix_index: Option<i64>,
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wave_core::step_progress::TokenUsage as _TokenUsage;

    async fn open() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn insert_and_fetch_run_round_trips() {
        let store = open().await;
        let run = Run::new("demo-20260101-000000-abcd".into(), "demo", "{}", Utc::now());
        store.insert_run(&run).await.unwrap();
        let fetched = store.get_run(&run.run_id).await.unwrap();
        assert_eq!(fetched.pipeline_name, "demo");
        assert_eq!(fetched.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn missing_run_is_reported() {
        let store = open().await;
        let err = store.get_run("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn update_run_status_sets_completed_at_on_terminal_transition() {
        let store = open().await;
        let run = Run::new("demo-20260101-000000-abcd".into(), "demo", "{}", Utc::now());
        store.insert_run(&run).await.unwrap();
        store.update_run_status(&run.run_id, RunStatus::Completed, Utc::now()).await.unwrap();
        let fetched = store.get_run(&run.run_id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Completed);
        assert!(fetched.completed_at.is_some());
    }

    #[tokio::test]
    async fn step_progress_upserts_on_conflict() {
        let store = open().await;
        let run = Run::new("demo-20260101-000000-abcd".into(), "demo", "{}", Utc::now());
        store.insert_run(&run).await.unwrap();

        let mut progress = StepProgress::pending(&run.run_id, "a");
        progress.tokens = _TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            cached_read_tokens: 0,
        };
        store.update_step_progress(&progress, "coder").await.unwrap();
        progress.phase = StepPhase::Completed;
        store.update_step_progress(&progress, "coder").await.unwrap();

        let rows = store.list_step_progress(&run.run_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "completed");
    }

    #[tokio::test]
    async fn register_and_list_artifacts() {
        let store = open().await;
        let run = Run::new("demo-20260101-000000-abcd".into(), "demo", "{}", Utc::now());
        store.insert_run(&run).await.unwrap();

        let artifact = Artifact {
            id: wave_core::Id::new(),
            run_id: run.run_id.clone(),
            step_id: "a".to_string(),
            name: "output".to_string(),
            relative_path: "a/output.json".to_string(),
            size_bytes: 42,
            sha256: "deadbeef".to_string(),
            created_at: Utc::now(),
            matrix_index: None,
        };
        store.register_artifact(&artifact).await.unwrap();
        let rows = store.list_artifacts(&run.run_id, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "output");
    }

    #[tokio::test]
    async fn pipeline_progress_upserts() {
        let store = open().await;
        let run = Run::new("demo-20260101-000000-abcd".into(), "demo", "{}", Utc::now());
        store.insert_run(&run).await.unwrap();
        store.update_pipeline_progress(&run.run_id, 3, 1, Utc::now()).await.unwrap();
        store.update_pipeline_progress(&run.run_id, 3, 2, Utc::now()).await.unwrap();
    }
}
