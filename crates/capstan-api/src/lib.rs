//! # HTTP surface
//!
//! Assembles the engine's external routes over an installed
//! [`Runtime`]:
//!
//! - `POST /__wkf_workflow_<name>` / `POST /__wkf_step_<name>` — queue
//!   delivery endpoints (200 ack or `{"timeoutSeconds": n}` defer),
//!   with `?__health` probes,
//! - `ANY /.well-known/workflow/v1/webhook/<token>` — webhook intake,
//! - `/v1/runs…` — run control.

use std::sync::Arc;

use axum::routing::{any, get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use capstan_engine::Runtime;

mod queues;
mod runs;
mod webhook;

pub use queues::DeferResponse;
pub use runs::{ListRunsParams, RunDto, StartRunRequest, WakeUpRequest};

/// Shared route state
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        runs::start_run,
        runs::list_runs,
        runs::get_run,
        runs::cancel_run,
        runs::wake_up_run,
        runs::recreate_run,
        runs::list_streams,
        runs::read_stream,
    ),
    components(schemas(
        runs::RunDto,
        runs::StartRunRequest,
        runs::ListRunsParams,
        runs::WakeUpRequest,
    )),
    tags((name = "runs", description = "Workflow run control"))
)]
struct ApiDoc;

/// Build the full router
pub fn router(state: AppState) -> Router {
    let intake = Router::new()
        .route(
            "/.well-known/workflow/v1/webhook/:token",
            any(webhook::webhook_endpoint),
        )
        // Queue names arrive URL-encoded as one path segment.
        .route("/:queue_name", post(queues::queue_endpoint))
        .with_state(state.clone());

    Router::new()
        .merge(intake)
        .merge(runs::routes(state))
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .layer(TraceLayer::new_for_http())
}
