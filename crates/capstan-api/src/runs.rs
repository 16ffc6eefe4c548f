//! Run control HTTP routes

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use capstan_codec::{CodecValue, ErrorValue};
use capstan_engine::{CorrelationId, StartOptions};
use capstan_storage::{
    Pagination, RunFilter, RunId, RunStatus, StoreError, WorkflowRun,
};

use crate::AppState;

/// Run representation returned by the API
#[derive(Debug, Serialize, ToSchema)]
pub struct RunDto {
    pub run_id: String,
    pub workflow_name: String,
    pub status: String,
    #[schema(value_type = Option<Object>)]
    pub error: Option<ErrorValue>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<WorkflowRun> for RunDto {
    fn from(run: WorkflowRun) -> Self {
        Self {
            run_id: run.run_id.into(),
            workflow_name: run.workflow_name,
            status: run.status.to_string(),
            error: run.error,
            created_at: run.created_at,
            started_at: run.started_at,
            completed_at: run.completed_at,
        }
    }
}

/// Request to start a run
#[derive(Debug, Deserialize, ToSchema)]
pub struct StartRunRequest {
    /// Symbolic workflow name (`workflow//<module>//<function>`)
    pub workflow_name: String,

    /// Plain JSON arguments (rich values arrive through SDK clients)
    #[serde(default)]
    pub args: Vec<serde_json::Value>,

    pub deployment_id: Option<String>,
}

/// Query parameters for listing runs
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListRunsParams {
    pub status: Option<String>,
    pub workflow_name: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

/// Request body for waking a run
#[derive(Debug, Deserialize, ToSchema)]
pub struct WakeUpRequest {
    /// Complete only these waits; all pending waits when absent
    pub correlation_ids: Option<Vec<String>>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/runs", get(list_runs).post(start_run))
        .route("/v1/runs/:run_id", get(get_run))
        .route("/v1/runs/:run_id/cancel", patch(cancel_run))
        .route("/v1/runs/:run_id/wake-up", post(wake_up_run))
        .route("/v1/runs/:run_id/recreate", post(recreate_run))
        .route("/v1/runs/:run_id/streams", get(list_streams))
        .route("/v1/runs/:run_id/streams/:name", get(read_stream))
        .with_state(state)
}

fn store_status(e: &StoreError) -> StatusCode {
    StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn parse_run_id(raw: &str) -> Result<RunId, StatusCode> {
    RunId::parse(raw).map_err(|_| StatusCode::BAD_REQUEST)
}

/// POST /v1/runs - Start a workflow run
#[utoipa::path(
    post,
    path = "/v1/runs",
    request_body = StartRunRequest,
    responses(
        (status = 201, description = "Run started", body = RunDto),
        (status = 404, description = "Unknown workflow"),
        (status = 500, description = "Internal server error")
    ),
    tag = "runs"
)]
pub async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<RunDto>), StatusCode> {
    let args = req.args.into_iter().map(CodecValue::from_json).collect();

    let handle = state
        .runtime
        .start(
            &req.workflow_name,
            args,
            StartOptions {
                deployment_id: req.deployment_id,
                trace_carrier: None,
            },
        )
        .await
        .map_err(|e| match e {
            capstan_engine::EngineError::UnknownWorkflow(_) => StatusCode::NOT_FOUND,
            _ => {
                tracing::error!("failed to start run: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;

    let run = handle.get().await.map_err(|e| {
        tracing::error!("failed to read started run: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok((StatusCode::CREATED, Json(run.into())))
}

/// GET /v1/runs - List runs
#[utoipa::path(
    get,
    path = "/v1/runs",
    params(
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("workflow_name" = Option<String>, Query, description = "Filter by workflow"),
        ("limit" = Option<u32>, Query, description = "Max results (default 20)"),
        ("offset" = Option<u32>, Query, description = "Offset for pagination")
    ),
    responses(
        (status = 200, description = "List of runs", body = Vec<RunDto>),
        (status = 500, description = "Internal server error")
    ),
    tag = "runs"
)]
pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<Vec<RunDto>>, StatusCode> {
    let filter = RunFilter {
        status: params.status.as_deref().and_then(RunStatus::parse),
        workflow_name: params.workflow_name,
    };

    let runs = state
        .runtime
        .storage()
        .list_runs(
            filter,
            Pagination {
                offset: params.offset,
                limit: params.limit,
            },
        )
        .await
        .map_err(|e| {
            tracing::error!("failed to list runs: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(runs.into_iter().map(RunDto::from).collect()))
}

/// GET /v1/runs/:run_id
#[utoipa::path(
    get,
    path = "/v1/runs/{run_id}",
    params(("run_id" = String, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run found", body = RunDto),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunDto>, StatusCode> {
    let run_id = parse_run_id(&run_id)?;
    let run = state
        .runtime
        .storage()
        .get_run(&run_id)
        .await
        .map_err(|e| store_status(&e))?;
    Ok(Json(run.into()))
}

/// PATCH /v1/runs/:run_id/cancel
#[utoipa::path(
    patch,
    path = "/v1/runs/{run_id}/cancel",
    params(("run_id" = String, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run cancelled", body = RunDto),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunDto>, StatusCode> {
    let run_id = parse_run_id(&run_id)?;
    state.runtime.cancel_run(&run_id).await.map_err(|e| {
        tracing::error!("failed to cancel run: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let run = state
        .runtime
        .storage()
        .get_run(&run_id)
        .await
        .map_err(|e| store_status(&e))?;
    Ok(Json(run.into()))
}

/// POST /v1/runs/:run_id/wake-up
#[utoipa::path(
    post,
    path = "/v1/runs/{run_id}/wake-up",
    params(("run_id" = String, Path, description = "Run ID")),
    request_body = WakeUpRequest,
    responses(
        (status = 200, description = "Waits completed"),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn wake_up_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(req): Json<WakeUpRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let run_id = parse_run_id(&run_id)?;
    let selected: Option<Vec<CorrelationId>> = req
        .correlation_ids
        .map(|ids| ids.into_iter().map(CorrelationId::new).collect());

    let stopped = state
        .runtime
        .wake_up_run(&run_id, selected.as_deref())
        .await
        .map_err(|e| match e {
            capstan_engine::EngineError::Store(ref se) => store_status(se),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        })?;

    Ok(Json(serde_json::json!({ "stopped": stopped })))
}

/// POST /v1/runs/:run_id/recreate
#[utoipa::path(
    post,
    path = "/v1/runs/{run_id}/recreate",
    params(("run_id" = String, Path, description = "Run ID")),
    responses(
        (status = 201, description = "Fresh run started", body = RunDto),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn recreate_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<(StatusCode, Json<RunDto>), StatusCode> {
    let run_id = parse_run_id(&run_id)?;
    let handle = state
        .runtime
        .recreate_run_from_existing(&run_id, Default::default())
        .await
        .map_err(|e| match e {
            capstan_engine::EngineError::Store(ref se) => store_status(se),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        })?;

    let run = handle.get().await.map_err(|e| {
        tracing::error!("failed to read recreated run: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok((StatusCode::CREATED, Json(run.into())))
}

/// GET /v1/runs/:run_id/streams
#[utoipa::path(
    get,
    path = "/v1/runs/{run_id}/streams",
    params(("run_id" = String, Path, description = "Run ID")),
    responses((status = 200, description = "Stream names", body = Vec<String>)),
    tag = "runs"
)]
pub async fn list_streams(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<String>>, StatusCode> {
    let run_id = parse_run_id(&run_id)?;
    let names = state.runtime.list_streams(&run_id).await.map_err(|e| {
        tracing::error!("failed to list streams: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(names))
}

/// GET /v1/runs/:run_id/streams/:name - Drain a stream's chunks
#[utoipa::path(
    get,
    path = "/v1/runs/{run_id}/streams/{name}",
    params(
        ("run_id" = String, Path, description = "Run ID"),
        ("name" = String, Path, description = "Stream name")
    ),
    responses((status = 200, description = "Stream contents")),
    tag = "runs"
)]
pub async fn read_stream(
    State(state): State<AppState>,
    Path((run_id, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, StatusCode> {
    let run_id = parse_run_id(&run_id)?;

    let mut reader = state.runtime.read_stream(&run_id, &name, 0);
    let mut bytes = Vec::new();
    while let Some(chunk) = reader.next().await {
        match chunk {
            Ok(chunk) => bytes.extend_from_slice(&chunk),
            Err(e) => {
                tracing::error!("stream read failed: {e}");
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    }

    Ok(bytes)
}
