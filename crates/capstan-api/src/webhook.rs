//! Well-known webhook endpoint
//!
//! `ANY /.well-known/workflow/v1/webhook/<token>` resolves the hook by
//! token, delivers the serialized request as a hook payload, and
//! returns whatever the hook's respond mode dictates: a fixed response,
//! the workflow's manual response, or a 202 acknowledgement.

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use tracing::warn;

use capstan_codec::{BytesValue, CodecValue, RequestValue};
use capstan_engine::EngineError;
use capstan_storage::StoreError;

use crate::AppState;

pub async fn webhook_endpoint(
    State(state): State<AppState>,
    Path(token): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = RequestValue {
        method: method.to_string(),
        url: uri.to_string(),
        headers: headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect(),
        body: (!body.is_empty())
            .then(|| CodecValue::Bytes(BytesValue::plain(body.to_vec()))),
    };

    match state.runtime.resume_webhook(&token, request).await {
        Ok(response) => {
            let mut builder = Response::builder().status(response.status);
            for (name, value) in &response.headers {
                builder = builder.header(name, value);
            }
            let body = match response.body {
                Some(CodecValue::Bytes(bytes)) => Body::from(bytes.data),
                Some(CodecValue::String(text)) => Body::from(text),
                _ => Body::empty(),
            };
            builder
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(EngineError::Store(StoreError::NotFound { .. })) => {
            (StatusCode::NOT_FOUND, "unknown webhook token").into_response()
        }
        Err(e) => {
            warn!(%token, "webhook resume failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
