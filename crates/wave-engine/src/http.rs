//! Read-only REST API plus SSE subscription. No write endpoints: runs are
//! started and driven from the CLI process, which calls the executor
//! in-process rather than over HTTP.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::get,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::broker::{BrokerHandle, BrokerMessage};
use crate::store::Store;

pub struct AppState {
    pub store: Store,
    pub broker: BrokerHandle,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/events", get(list_events))
        .route("/api/runs/{id}/steps", get(list_steps))
        .route("/api/runs/{id}/artifacts", get(list_artifacts))
        .route("/api/runs/{id}/progress", get(get_progress))
        .route("/api/events", get(stream_events))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(state: Arc<AppState>, bind: std::net::IpAddr, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = SocketAddr::from((bind, port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, router).await
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> (StatusCode, Json<ErrorBody>) {
    error!(error = %err, context, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: err.to_string() }))
}

fn not_found(message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (StatusCode::NOT_FOUND, Json(ErrorBody { error: message.into() }))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize, Default)]
struct ListRunsQuery {
    status: Option<String>,
    pipeline: Option<String>,
    limit: Option<i64>,
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let status = query.status.as_deref().map(parse_status);
    let runs = state
        .store
        .list_runs(status, query.pipeline.as_deref(), query.limit.unwrap_or(100))
        .await
        .map_err(|e| internal_error("list_runs", e))?;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

fn parse_status(s: &str) -> wave_core::RunStatus {
    use wave_core::RunStatus::*;
    match s {
        "running" => Running,
        "paused" => Paused,
        "completed" => Completed,
        "failed" => Failed,
        "cancelled" => Cancelled,
        _ => Pending,
    }
}

async fn get_run(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let run = state.store.get_run(&id).await.map_err(|_| not_found(format!("run {id} not found")))?;
    let progress = state.store.list_step_progress(&id).await.map_err(|e| internal_error("get_run/progress", e))?;
    Ok(Json(serde_json::json!({ "run": run, "steps": progress })))
}

#[derive(Debug, Deserialize, Default)]
struct ListEventsQuery {
    step: Option<String>,
    limit: Option<i64>,
}

async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ListEventsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let events = state
        .store
        .list_events(&id, query.step.as_deref(), query.limit.unwrap_or(500))
        .await
        .map_err(|e| internal_error("list_events", e))?;
    Ok(Json(serde_json::json!({ "events": events })))
}

async fn list_steps(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let steps = state.store.list_step_progress(&id).await.map_err(|e| internal_error("list_steps", e))?;
    Ok(Json(serde_json::json!({ "steps": steps })))
}

#[derive(Debug, Deserialize, Default)]
struct ListArtifactsQuery {
    step: Option<String>,
}

async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ListArtifactsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let artifacts = state
        .store
        .list_artifacts(&id, query.step.as_deref())
        .await
        .map_err(|e| internal_error("list_artifacts", e))?;
    Ok(Json(serde_json::json!({ "artifacts": artifacts })))
}

async fn get_progress(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let steps = state.store.list_step_progress(&id).await.map_err(|e| internal_error("get_progress", e))?;
    let total = steps.len();
    let completed = steps.iter().filter(|s| s.state == "completed").count();
    Ok(Json(serde_json::json!({
        "run_id": id,
        "total_steps": total,
        "completed_steps": completed,
        "overall_progress": if total == 0 { 0.0 } else { completed as f64 / total as f64 },
    })))
}

#[derive(Debug, Deserialize)]
struct StreamEventsQuery {
    run_id: String,
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamEventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (subscriber_id, mut rx) = state.broker.subscribe(query.run_id.clone()).await;
    let broker = state.broker.clone();
    let run_id = query.run_id;

    let stream = stream::unfold((), move |()| {
        let broker = broker.clone();
        let run_id = run_id.clone();
        async move {
            match rx.recv().await {
                Some(BrokerMessage::Event(event)) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    Some((Ok(SseEvent::default().data(json)), ()))
                }
                Some(BrokerMessage::Heartbeat) => Some((Ok(SseEvent::default().event("heartbeat").data("")), ())),
                None => {
                    broker.unsubscribe(run_id, subscriber_id);
                    None
                }
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
