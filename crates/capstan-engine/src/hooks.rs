//! External resumption: hooks, webhooks, and wake-ups
//!
//! These APIs are called by request handlers, never by workflow code.
//! They resolve a token or run id, append the resumption event, and
//! re-enqueue the workflow. Webhooks layer a respond mode on top of a
//! hook: a fixed response, a 202 acknowledgement, or a manual response
//! the workflow supplies through a response stream tunneled inside the
//! serialized request.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{info, instrument};

use capstan_codec::{
    decode_envelope, encode_envelope, Boundary, CodecValue, DeserializationError, RequestValue,
    ResponseValue, SerializableClass, StreamRevival,
};
use capstan_storage::{CorrelationId, CreateEvent, EventData, RunId, StoreError, WaitStatus};

use crate::client::Runtime;
use crate::context::StepCtx;
use crate::error::EngineError;

/// Stream carrying a manual webhook response, one per hook
fn webhook_response_stream(hook_id: &capstan_storage::HookId) -> String {
    format!("__whkres__{hook_id}")
}

/// The value a webhook delivers to the workflow: the serialized request
/// plus, in manual respond mode, the name of the response stream.
///
/// Crosses boundaries as a registered serialization class, so steps
/// receive a live instance they can answer through.
pub struct WebhookRequest {
    pub request: RequestValue,
    pub run_id: String,
    pub response_stream: Option<String>,
}

impl WebhookRequest {
    /// Downcast a hydrated hook payload
    pub fn from_value(value: &CodecValue) -> Option<Arc<WebhookRequest>> {
        match value {
            CodecValue::Instance(instance) => instance.downcast::<WebhookRequest>(),
            _ => None,
        }
    }

    /// Answer a manual-mode webhook. The external caller blocked in
    /// `resume_webhook` receives exactly this response.
    pub async fn respond_with(
        &self,
        ctx: &StepCtx,
        response: ResponseValue,
    ) -> Result<(), EngineError> {
        let name = self.response_stream.as_ref().ok_or_else(|| {
            EngineError::Runtime("webhook is not in manual respond mode".into())
        })?;

        let bytes = encode_envelope(
            &CodecValue::Response(Box::new(response)),
            ctx.codec().classes(),
        )?;

        let streams = ctx.streams();
        streams.write_to_stream(name, &self.run_id, bytes).await?;
        streams.close_stream(name, &self.run_id).await?;
        Ok(())
    }
}

impl SerializableClass for WebhookRequest {
    const CLASS_ID: &'static str = "class//workflow//WebhookRequest";

    fn encode(&self) -> CodecValue {
        let mut entries = vec![
            (
                "request".to_string(),
                CodecValue::Request(Box::new(self.request.clone())),
            ),
            ("run_id".to_string(), CodecValue::String(self.run_id.clone())),
        ];
        if let Some(stream) = &self.response_stream {
            entries.push((
                "response_stream".to_string(),
                CodecValue::String(stream.clone()),
            ));
        }
        CodecValue::Object(entries)
    }

    fn decode(data: CodecValue) -> Result<Self, DeserializationError> {
        let request = match data.get("request") {
            Some(CodecValue::Request(request)) => (**request).clone(),
            _ => return Err(DeserializationError::malformed("WebhookRequest: no request")),
        };
        let run_id = data
            .get("run_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DeserializationError::malformed("WebhookRequest: no run_id"))?
            .to_string();
        let response_stream = data
            .get("response_stream")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(Self {
            request,
            run_id,
            response_stream,
        })
    }
}

impl Runtime {
    /// Deliver a payload to a hook by token and wake the workflow.
    #[instrument(skip(self, payload))]
    pub async fn resume_hook(
        self: &Arc<Self>,
        token: &str,
        payload: CodecValue,
    ) -> Result<(), EngineError> {
        let storage = self.world().storage();
        let hook = storage.get_hook_by_token(token).await?;
        let run = storage.get_run(&hook.run_id).await?;

        let bytes = self
            .codec()
            .dehydrate(Boundary::WorkflowArguments, &payload, run.run_id.as_str())?
            .flush()
            .await?;

        storage
            .create_event(
                CreateEvent::new(
                    run.run_id.clone(),
                    EventData::HookReceived { payload: bytes },
                )
                .with_correlation(hook.hook_id.clone()),
            )
            .await?;

        self.enqueue_run(&run.workflow_name, &run.run_id, None)
            .await?;

        info!(%token, run_id = %run.run_id, "hook resumed");
        Ok(())
    }

    /// Deliver an HTTP request to a webhook by token and produce the
    /// response dictated by the hook's respond mode.
    #[instrument(skip(self, request))]
    pub async fn resume_webhook(
        self: &Arc<Self>,
        token: &str,
        request: RequestValue,
    ) -> Result<ResponseValue, EngineError> {
        let storage = self.world().storage();
        let hook = storage.get_hook_by_token(token).await?;
        let run = storage.get_run(&hook.run_id).await?;

        let metadata = match &hook.metadata {
            Some(bytes) => self.codec().hydrate(Boundary::WorkflowReturn, bytes)?,
            None => CodecValue::Null,
        };
        let mode = metadata
            .get("respond_with")
            .and_then(|v| v.as_str())
            .unwrap_or("ack")
            .to_string();

        let response_stream =
            (mode == "manual").then(|| webhook_response_stream(&hook.hook_id));

        let webhook_request = WebhookRequest {
            request,
            run_id: run.run_id.as_str().to_string(),
            response_stream: response_stream.clone(),
        };

        let payload = self
            .codec()
            .dehydrate(
                Boundary::WorkflowArguments,
                &capstan_codec::instance(webhook_request),
                run.run_id.as_str(),
            )?
            .flush()
            .await?;

        storage
            .create_event(
                CreateEvent::new(run.run_id.clone(), EventData::HookReceived { payload })
                    .with_correlation(hook.hook_id.clone()),
            )
            .await?;

        self.enqueue_run(&run.workflow_name, &run.run_id, None)
            .await?;

        match mode.as_str() {
            "static" => match metadata.get("response") {
                Some(CodecValue::Response(response)) => Ok((**response).clone()),
                _ => Err(EngineError::Runtime(
                    "static webhook carries no response".into(),
                )),
            },
            "manual" => {
                // Block cooperatively until the workflow's step answers
                // through the response stream.
                let name = webhook_response_stream(&hook.hook_id);
                let mut reader = self
                    .world()
                    .streams()
                    .read_from_stream(&name, run.run_id.as_str(), 0);
                let chunk = reader
                    .next()
                    .await
                    .ok_or_else(|| {
                        EngineError::Runtime("webhook response stream closed empty".into())
                    })?
                    .map_err(EngineError::Stream)?;

                match decode_envelope(&chunk, self.codec().classes(), StreamRevival::Store)? {
                    CodecValue::Response(response) => Ok(*response),
                    other => Err(EngineError::Runtime(format!(
                        "webhook response stream carried a {}",
                        other.kind()
                    ))),
                }
            }
            _ => Ok(ResponseValue {
                status: 202,
                headers: vec![],
                body: None,
            }),
        }
    }

    /// Delete a hook by token, freeing its slot in the token namespace.
    /// Pending `next()` calls in the workflow stay suspended.
    #[instrument(skip(self))]
    pub async fn dispose_hook(self: &Arc<Self>, token: &str) -> Result<(), EngineError> {
        let storage = self.world().storage();
        let hook = storage.get_hook_by_token(token).await?;

        storage
            .create_event(
                CreateEvent::new(hook.run_id.clone(), EventData::HookDisposed {})
                    .with_correlation(hook.hook_id.clone()),
            )
            .await?;

        info!(%token, run_id = %hook.run_id, "hook disposed");
        Ok(())
    }

    /// Complete all (or selected) pending waits of a run and wake it.
    /// Returns how many waits were stopped; an already-completed wait
    /// counts as stopped.
    #[instrument(skip(self))]
    pub async fn wake_up_run(
        self: &Arc<Self>,
        run_id: &RunId,
        correlation_ids: Option<&[CorrelationId]>,
    ) -> Result<usize, EngineError> {
        let storage = self.world().storage();
        let run = storage.get_run(run_id).await?;

        let mut stopped = 0usize;
        for wait in storage.list_waits(run_id).await? {
            if let Some(selected) = correlation_ids {
                if !selected.contains(&wait.correlation_id) {
                    continue;
                }
            }
            if wait.status != WaitStatus::Waiting {
                stopped += 1;
                continue;
            }
            match storage
                .create_event(
                    CreateEvent::new(run_id.clone(), EventData::WaitCompleted {})
                        .with_correlation(wait.correlation_id.clone()),
                )
                .await
            {
                Ok(_) => stopped += 1,
                // Lost a race to the timer; the wait is stopped either way.
                Err(StoreError::Conflict { .. }) => stopped += 1,
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.enqueue_run(&run.workflow_name, run_id, None).await?;
        info!(%run_id, stopped, "run woken");
        Ok(stopped)
    }
}
