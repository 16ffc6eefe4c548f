//! Step executor
//!
//! Consumes step invocation messages: starts the attempt (writing
//! `step_started` and interpreting the store's ordering signals), runs
//! the user function once, and records the outcome. Failures propagate
//! by retry class; transient store errors retry in-process with bounded
//! backoff before falling back to queue redelivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use capstan_codec::{Boundary, BoundaryCodec, CodecValue, ErrorValue};
use capstan_storage::{
    CorrelationId, CreateEvent, EventData, EventOutcome, StepRecord, Storage, StoreError,
};

use crate::context::StepCtx;
use crate::error::{EngineError, StepFailureKind};
use crate::names::workflow_queue;
use crate::registry::StepRegistry;
use crate::world::{HandlerOutcome, QueueOptions, StepQueueMessage, World, WorkflowQueueMessage};

/// In-process backoff for transient (5xx) store errors
const SERVER_ERROR_BACKOFF: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

/// Throttle pauses below this are slept out in-process; longer ones
/// defer through the queue.
const THROTTLE_IN_PROCESS_LIMIT: Duration = Duration::from_secs(10);

/// Delay before the next attempt of a generically-failed step
const GENERIC_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Append an event, retrying transient failures in-process.
///
/// 5xx errors retry up to three times (0.5 s / 1 s / 2 s); short 429
/// pauses are slept out. Anything else returns to the caller.
pub(crate) async fn create_event_with_retry(
    storage: &Arc<dyn Storage>,
    input: CreateEvent,
) -> Result<EventOutcome, StoreError> {
    let mut server_errors = 0usize;
    loop {
        match storage.create_event(input.clone()).await {
            Err(StoreError::Unavailable(msg)) => {
                if server_errors >= SERVER_ERROR_BACKOFF.len() {
                    return Err(StoreError::Unavailable(msg));
                }
                let pause = SERVER_ERROR_BACKOFF[server_errors];
                warn!(?pause, "store unavailable; retrying in-process: {msg}");
                tokio::time::sleep(pause).await;
                server_errors += 1;
            }
            Err(StoreError::Throttled { retry_after })
                if retry_after < THROTTLE_IN_PROCESS_LIMIT =>
            {
                debug!(?retry_after, "store throttled; sleeping in-process");
                tokio::time::sleep(retry_after).await;
            }
            other => return other,
        }
    }
}

/// The step-queue side of the engine
pub(crate) struct StepExecutor {
    world: Arc<dyn World>,
    steps: Arc<StepRegistry>,
    /// Step-context codec: revives streams as live store references
    codec: BoundaryCodec,
}

impl StepExecutor {
    pub fn new(world: Arc<dyn World>, steps: Arc<StepRegistry>, codec: BoundaryCodec) -> Self {
        Self {
            world,
            steps,
            codec,
        }
    }

    /// Process one step invocation message.
    #[instrument(skip(self, message), fields(run_id = %message.workflow_run_id, step_id = %message.step_id))]
    pub async fn handle_message(
        &self,
        message: StepQueueMessage,
    ) -> Result<HandlerOutcome, EngineError> {
        let storage = self.world.storage();
        let correlation = CorrelationId::from(message.step_id.clone());

        // Start the attempt. The store's rejections are ordering
        // signals, not faults.
        let step = match create_event_with_retry(
            &storage,
            CreateEvent::new(message.workflow_run_id.clone(), EventData::StepStarted {})
                .with_correlation(correlation.clone()),
        )
        .await
        {
            Ok(outcome) => outcome
                .step
                .ok_or_else(|| EngineError::Runtime("step_started returned no step".into()))?,
            Err(StoreError::TooEarly { retry_at }) => {
                let remaining = (retry_at - Utc::now()).to_std().unwrap_or_default();
                return Ok(HandlerOutcome::Defer {
                    timeout: self.world.config().clamp_defer(remaining),
                });
            }
            Err(StoreError::Conflict { .. }) => {
                // Already terminal; make sure the workflow notices.
                self.wake_workflow(&message).await?;
                return Ok(HandlerOutcome::Ack);
            }
            Err(StoreError::RunTerminal(_)) => return Ok(HandlerOutcome::Ack),
            Err(StoreError::NotFound { .. }) => {
                // The step (or its run) no longer exists; redelivery
                // cannot help.
                warn!("step invocation for missing step; dropping");
                return Ok(HandlerOutcome::Ack);
            }
            Err(StoreError::Throttled { retry_after }) => {
                return Ok(HandlerOutcome::Defer {
                    timeout: self.world.config().clamp_defer(retry_after),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let Some(descriptor) = self.steps.get(&step.step_name).cloned() else {
            self.finish_failed(
                &message,
                &correlation,
                ErrorValue::new(format!("unknown step `{}`", step.step_name))
                    .with_code("UNKNOWN_STEP"),
            )
            .await?;
            return Ok(HandlerOutcome::Ack);
        };
        let max_attempts = descriptor.max_retries as i32 + 1;

        if step.attempt > max_attempts {
            self.finish_failed(
                &message,
                &correlation,
                ErrorValue::new(format!(
                    "step exceeded max retries ({} attempts allowed)",
                    max_attempts
                ))
                .with_code("MAX_RETRIES_EXCEEDED"),
            )
            .await?;
            return Ok(HandlerOutcome::Ack);
        }

        // Hydrate the arguments. A payload that cannot hydrate will
        // never succeed, so it is fatal.
        let (args, closure_vars) = match self.hydrate_input(&step) {
            Ok(parts) => parts,
            Err(e) => {
                self.finish_failed(
                    &message,
                    &correlation,
                    ErrorValue::new(format!("step input failed to hydrate: {e}"))
                        .with_code("DESERIALIZATION_ERROR"),
                )
                .await?;
                return Ok(HandlerOutcome::Ack);
            }
        };

        let ctx = StepCtx::new(
            message.workflow_run_id.clone(),
            message.workflow_name.clone(),
            message.workflow_started_at,
            message.step_id.clone(),
            step.attempt,
            step.started_at,
            args,
            closure_vars,
            self.world.streams(),
            self.steps.clone(),
            self.codec.clone(),
        );

        debug!(attempt = step.attempt, step_name = %step.step_name, "executing step");
        let result = (descriptor.func)(ctx).await;

        match result {
            Ok(value) => self.finish_completed(&message, &correlation, value).await,
            Err(failure) => match failure.kind {
                StepFailureKind::Fatal => {
                    info!(error = %failure.error.message, "step failed fatally");
                    self.finish_failed(&message, &correlation, failure.error)
                        .await?;
                    Ok(HandlerOutcome::Ack)
                }
                StepFailureKind::Retryable {
                    retry_after: Some(retry_at),
                } => {
                    self.write_retrying(&message, &correlation, failure.error, Some(retry_at))
                        .await?;
                    let remaining = (retry_at - Utc::now()).to_std().unwrap_or_default();
                    Ok(HandlerOutcome::Defer {
                        timeout: self.world.config().clamp_defer(remaining),
                    })
                }
                StepFailureKind::Retryable { retry_after: None } | StepFailureKind::Generic => {
                    if step.attempt < max_attempts {
                        self.write_retrying(&message, &correlation, failure.error, None)
                            .await?;
                        Ok(HandlerOutcome::Defer {
                            timeout: GENERIC_RETRY_DELAY,
                        })
                    } else {
                        info!(
                            attempt = step.attempt,
                            "retry budget exhausted; failing step"
                        );
                        self.finish_failed(&message, &correlation, failure.error)
                            .await?;
                        Ok(HandlerOutcome::Ack)
                    }
                }
            },
        }
    }

    fn hydrate_input(
        &self,
        step: &StepRecord,
    ) -> Result<(Vec<CodecValue>, Option<CodecValue>), EngineError> {
        let input = self.codec.hydrate(Boundary::StepArguments, &step.input)?;
        let args = match input.get("args") {
            Some(CodecValue::List(items)) => items.clone(),
            _ => Vec::new(),
        };
        let closure_vars = input.get("closure").cloned();
        Ok((args, closure_vars))
    }

    async fn finish_completed(
        &self,
        message: &StepQueueMessage,
        correlation: &CorrelationId,
        value: CodecValue,
    ) -> Result<HandlerOutcome, EngineError> {
        let dehydrated = match self.codec.dehydrate(
            Boundary::StepReturn,
            &value,
            message.workflow_run_id.as_str(),
        ) {
            Ok(d) => d,
            Err(e) => {
                // The result cannot cross the boundary; that is a step
                // failure, not an infrastructure fault.
                self.finish_failed(
                    message,
                    correlation,
                    ErrorValue::new(format!("step result failed to serialize: {e}"))
                        .with_code("SERIALIZATION_ERROR"),
                )
                .await?;
                return Ok(HandlerOutcome::Ack);
            }
        };
        let output = dehydrated.flush().await?;

        match create_event_with_retry(
            &self.world.storage(),
            CreateEvent::new(
                message.workflow_run_id.clone(),
                EventData::StepCompleted { output },
            )
            .with_correlation(correlation.clone()),
        )
        .await
        {
            Ok(_) => {
                self.wake_workflow(message).await?;
                Ok(HandlerOutcome::Ack)
            }
            Err(StoreError::Conflict { .. }) => {
                // A concurrent delivery already finished this step.
                self.wake_workflow(message).await?;
                Ok(HandlerOutcome::Ack)
            }
            Err(StoreError::RunTerminal(_)) => Ok(HandlerOutcome::Ack),
            Err(StoreError::Throttled { retry_after }) => Ok(HandlerOutcome::Defer {
                timeout: self.world.config().clamp_defer(retry_after),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `step_failed` and wake the workflow
    async fn finish_failed(
        &self,
        message: &StepQueueMessage,
        correlation: &CorrelationId,
        error: ErrorValue,
    ) -> Result<(), EngineError> {
        match create_event_with_retry(
            &self.world.storage(),
            CreateEvent::new(
                message.workflow_run_id.clone(),
                EventData::StepFailed { error },
            )
            .with_correlation(correlation.clone()),
        )
        .await
        {
            Ok(_) | Err(StoreError::Conflict { .. }) => {
                self.wake_workflow(message).await?;
                Ok(())
            }
            Err(StoreError::RunTerminal(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_retrying(
        &self,
        message: &StepQueueMessage,
        correlation: &CorrelationId,
        error: ErrorValue,
        retry_after: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        match create_event_with_retry(
            &self.world.storage(),
            CreateEvent::new(
                message.workflow_run_id.clone(),
                EventData::StepRetrying { error, retry_after },
            )
            .with_correlation(correlation.clone()),
        )
        .await
        {
            Ok(_) | Err(StoreError::Conflict { .. }) | Err(StoreError::RunTerminal(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wake_workflow(&self, message: &StepQueueMessage) -> Result<(), EngineError> {
        let payload = serde_json::to_vec(&WorkflowQueueMessage {
            run_id: message.workflow_run_id.clone(),
            trace_carrier: message.trace_carrier.clone(),
            requested_at: Some(Utc::now()),
        })
        .map_err(|e| EngineError::Queue(e.to_string()))?;

        self.world
            .queue(
                &workflow_queue(&message.workflow_name),
                payload,
                QueueOptions::default(),
            )
            .await
    }
}
