//! JSON status and operator API for the analysis engine.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use dealflow_analysis::{
    AnalysisServices, EnqueueError, EnqueueRequest, RuntimeConfig, SafeUpdateError,
};
use dealflow_core::{BlockScope, Priority};
use dealflow_storage::{EnqueueOutcome, JobStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealflow-web";

const DEFAULT_SAFE_UPDATE_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<AnalysisServices>,
}

impl AppState {
    pub fn new(services: Arc<AnalysisServices>) -> Self {
        Self { services }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/queue", get(queue_handler))
        .route("/api/jobs", post(enqueue_handler))
        .route("/api/subjects/{id}/completion", get(completion_handler))
        .route("/api/subjects/{id}/block", get(block_status_handler))
        .route("/api/subjects/{id}/settings", patch(settings_handler))
        .route("/api/tenants/{id}/safety", get(safety_handler))
        .route("/api/scheduler/tick", post(tick_handler))
        .route("/api/scheduler/enabled", post(enabled_handler))
        .route("/api/zombies/reclaim", post(reclaim_handler))
        .route("/api/blocks", get(list_blocks_handler).post(add_block_handler))
        .route("/api/blocks/{id}", delete(remove_block_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(services: Arc<AnalysisServices>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "analysis API listening");
    axum::serve(listener, app(AppState::new(services))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let runtime = RuntimeConfig::from_env();
    let services = Arc::new(AnalysisServices::from_env(&runtime).await?);
    serve(services, runtime.web_port).await
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

fn json_error(status: StatusCode, code: &'static str, message: impl ToString) -> Response {
    (
        status,
        Json(ErrorBody {
            code,
            message: message.to_string(),
        }),
    )
        .into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", err)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "enabled": state.services.kill_switch.is_enabled(),
        "phase": state.services.scheduler.phase(),
    }))
    .into_response()
}

async fn queue_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.services.store.queue_depth().await {
        Ok(depth) => Json(serde_json::json!({ "depth": depth })).into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct EnqueueBody {
    subject_id: String,
    tenant_id: String,
    /// Omit to queue every configured engine.
    #[serde(default)]
    engine_name: Option<String>,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    delay_secs: u64,
}

#[derive(Debug, Serialize)]
struct EnqueuedJob {
    engine_name: String,
    job_id: Option<Uuid>,
    outcome: &'static str,
    error: Option<String>,
}

impl EnqueuedJob {
    fn from_result(engine_name: String, result: Result<EnqueueOutcome, EnqueueError>) -> Self {
        match result {
            Ok(EnqueueOutcome::Created(id)) => Self {
                engine_name,
                job_id: Some(id),
                outcome: "created",
                error: None,
            },
            Ok(EnqueueOutcome::Promoted { id, .. }) => Self {
                engine_name,
                job_id: Some(id),
                outcome: "promoted",
                error: None,
            },
            Err(EnqueueError::Store(StoreError::DuplicateActiveJob { existing_id, .. })) => Self {
                engine_name,
                job_id: Some(existing_id),
                outcome: "already_active",
                error: None,
            },
            Err(err) => Self {
                engine_name,
                job_id: None,
                outcome: "rejected",
                error: Some(err.to_string()),
            },
        }
    }
}

fn enqueue_error(err: EnqueueError) -> Response {
    match err {
        EnqueueError::SubjectBlocked {
            subject_id,
            reason,
            blocked_until,
        } => (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "code": "subject_blocked",
                "subject_id": subject_id,
                "reason": reason,
                "blocked_until": blocked_until,
            })),
        )
            .into_response(),
        EnqueueError::Validation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "validation_failed", msg)
        }
        EnqueueError::Store(err @ StoreError::DuplicateActiveJob { .. }) => {
            json_error(StatusCode::CONFLICT, "duplicate_active_job", err)
        }
        EnqueueError::Store(err) => server_error(err),
    }
}

async fn enqueue_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnqueueBody>,
) -> Response {
    let queue = &state.services.queue;
    let jobs = match body.engine_name {
        Some(engine_name) => {
            let request = EnqueueRequest {
                subject_id: body.subject_id,
                tenant_id: body.tenant_id,
                engine_name: engine_name.clone(),
                priority: body.priority,
                delay: Duration::from_secs(body.delay_secs),
            };
            match queue.enqueue(request).await {
                Ok(outcome) => vec![EnqueuedJob::from_result(engine_name, Ok(outcome))],
                Err(err) => return enqueue_error(err),
            }
        }
        None => match queue
            .enqueue_waterfall(&body.subject_id, &body.tenant_id, body.priority)
            .await
        {
            Ok(results) => results
                .into_iter()
                .map(|(engine, result)| EnqueuedJob::from_result(engine, result))
                .collect(),
            Err(err) => return enqueue_error(err),
        },
    };
    (StatusCode::CREATED, Json(serde_json::json!({ "jobs": jobs }))).into_response()
}

async fn completion_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.services.tracker.evaluate(&id).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => server_error(err),
    }
}

async fn block_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.services.kill_switch.is_blocked(&id).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => server_error(err),
    }
}

async fn safety_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.services.conflict.check_safety(&id).await {
        Ok(check) => Json(check).into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct SettingsBody {
    patch: serde_json::Value,
    #[serde(default)]
    max_retries: Option<u32>,
}

async fn settings_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<SettingsBody>,
) -> Response {
    let max_retries = body.max_retries.unwrap_or(DEFAULT_SAFE_UPDATE_RETRIES);
    match state
        .services
        .conflict
        .safe_update(&id, &body.patch, max_retries)
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => {
            let status = match &err {
                SafeUpdateError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                SafeUpdateError::MaxRetriesExceeded { .. } => StatusCode::CONFLICT,
                SafeUpdateError::NotFound(_) => StatusCode::NOT_FOUND,
                SafeUpdateError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            json_error(status, err.code(), err)
        }
    }
}

async fn tick_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.services.scheduler.tick().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

async fn reclaim_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.services.reclaimer.reclaim().await).into_response()
}

#[derive(Debug, Deserialize)]
struct EnabledBody {
    enabled: bool,
}

async fn enabled_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnabledBody>,
) -> Response {
    state.services.kill_switch.set_enabled(body.enabled);
    Json(serde_json::json!({ "enabled": state.services.kill_switch.is_enabled() })).into_response()
}

#[derive(Debug, Deserialize)]
struct BlockBody {
    /// Omit for a global block.
    #[serde(default)]
    subject_id: Option<String>,
    reason: String,
    #[serde(default)]
    blocked_until: Option<DateTime<Utc>>,
}

async fn list_blocks_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.services.kill_switch.list().await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => server_error(err),
    }
}

async fn add_block_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BlockBody>,
) -> Response {
    if body.reason.trim().is_empty() {
        return json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation_failed",
            "a block needs a reason",
        );
    }
    let scope = match body.subject_id {
        Some(subject_id) => BlockScope::Subject(subject_id),
        None => BlockScope::Global,
    };
    match state
        .services
        .kill_switch
        .block(scope, body.reason, body.blocked_until)
        .await
    {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn remove_block_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.services.kill_switch.unblock(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "not_found", format!("block {id}")),
        Err(err) => server_error(err),
    }
}
