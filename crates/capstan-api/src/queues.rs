//! Internal queue endpoints
//!
//! Cloud queue backends deliver messages into the process over HTTP:
//! `POST /__wkf_workflow_<name>` for continuations and
//! `POST /__wkf_step_<name>` for step invocations. A handler answers
//! 200 to ack or `{"timeoutSeconds": n}` to defer redelivery. Both
//! endpoints accept `?__health` as an unauthenticated probe.

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::warn;

use capstan_engine::HandlerOutcome;

use crate::AppState;

/// Defer body returned to the queue backend
#[derive(Debug, Serialize)]
pub struct DeferResponse {
    #[serde(rename = "timeoutSeconds")]
    pub timeout_seconds: u64,
}

pub async fn queue_endpoint(
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    // Unauthenticated health probe.
    if query.as_deref().is_some_and(|q| q.contains("__health")) {
        return (StatusCode::OK, "ok").into_response();
    }

    match state
        .runtime
        .dispatch_queue(&queue_name, body.to_vec())
        .await
    {
        Ok(HandlerOutcome::Ack) => StatusCode::OK.into_response(),
        Ok(HandlerOutcome::Defer { timeout }) => Json(DeferResponse {
            timeout_seconds: timeout.as_secs().max(1),
        })
        .into_response(),
        Err(e) => {
            warn!(queue = %queue_name, "queue handler failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
