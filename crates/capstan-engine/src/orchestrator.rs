//! Replay-based workflow orchestrator
//!
//! A turn replays the run's full event log through the workflow
//! function inside the deterministic sandbox and drives the future
//! until it either finishes or quiesces. Suspension is a returned
//! outcome, not control flow: when no further progress is possible the
//! turn yields the invocations queue, and the orchestrator writes
//! creation events and enqueues work for every invocation that has no
//! events yet. Concurrent turns over the same run are safe; the
//! conditional appends dedup the losers.

use std::future::Future;
use std::sync::Arc;
use std::task::Poll;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::task::noop_waker;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use capstan_codec::{Boundary, BoundaryCodec, CodecValue, ErrorValue};
use capstan_storage::{
    load_all_events, CreateEvent, EventData, RunId, RunStatus, StoreError, WaitStatus,
    WorkflowRun,
};

use crate::context::{Invocation, InvocationKind, TurnState, WorkflowCtx};
use crate::error::EngineError;
use crate::names::{step_queue, workflow_queue};
use crate::registry::WorkflowRegistry;
use crate::world::{
    HandlerOutcome, QueueOptions, StepQueueMessage, TraceCarrier, World, WorkflowQueueMessage,
};

/// Result of driving one turn of a workflow
pub(crate) enum TurnOutcome {
    Completed(CodecValue),
    Failed(ErrorValue),
    /// Log corruption; fails the run and is not catchable
    Corrupted(String),
    Suspended(Vec<Invocation>),
}

/// Poll the workflow future against the replay state until it returns
/// or no suspended call can make further progress.
pub(crate) fn drive_turn(
    mut future: BoxFuture<'static, Result<CodecValue, ErrorValue>>,
    state: &Arc<Mutex<TurnState>>,
) -> TurnOutcome {
    let waker = noop_waker();
    let mut cx = std::task::Context::from_waker(&waker);

    loop {
        state.lock().progressed = false;
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(value)) => return TurnOutcome::Completed(value),
            Poll::Ready(Err(error)) => return TurnOutcome::Failed(error),
            Poll::Pending => {
                let mut guard = state.lock();
                if let Some(reason) = guard.corruption.take() {
                    return TurnOutcome::Corrupted(reason);
                }
                if !guard.progressed {
                    return TurnOutcome::Suspended(std::mem::take(&mut guard.invocations));
                }
                // Something resolved mid-poll; give combinators another
                // pass before concluding the turn.
            }
        }
    }
}

/// The workflow-queue side of the engine
pub(crate) struct Orchestrator {
    world: Arc<dyn World>,
    workflows: Arc<WorkflowRegistry>,
    /// Workflow-context codec: revives streams as sandbox placeholders
    codec: BoundaryCodec,
}

impl Orchestrator {
    pub fn new(
        world: Arc<dyn World>,
        workflows: Arc<WorkflowRegistry>,
        codec: BoundaryCodec,
    ) -> Self {
        Self {
            world,
            workflows,
            codec,
        }
    }

    /// Process one workflow continuation message.
    #[instrument(skip(self, message), fields(run_id = %message.run_id))]
    pub async fn handle_message(
        &self,
        message: WorkflowQueueMessage,
    ) -> Result<HandlerOutcome, EngineError> {
        let storage = self.world.storage();
        let run_id = message.run_id.clone();

        let mut run = match storage.get_run(&run_id).await {
            Ok(run) => run,
            Err(StoreError::NotFound { .. }) => {
                warn!("continuation for unknown run; dropping");
                return Ok(HandlerOutcome::Ack);
            }
            Err(e) => return Err(e.into()),
        };

        if run.status.is_terminal() {
            debug!(status = %run.status, "run already terminal; dropping continuation");
            return Ok(HandlerOutcome::Ack);
        }

        if run.status == RunStatus::Pending {
            match storage
                .create_event(CreateEvent::new(run_id.clone(), EventData::RunStarted {}))
                .await
            {
                Ok(outcome) => {
                    if let Some(updated) = outcome.run {
                        run = updated;
                    }
                }
                // Another continuation started it first.
                Err(StoreError::Conflict { .. }) => run = storage.get_run(&run_id).await?,
                Err(e) => return Err(e.into()),
            }
        }

        self.complete_due_waits(&run).await?;

        let Some(descriptor) = self.workflows.get(&run.workflow_name).cloned() else {
            self.fail_run(
                &run_id,
                ErrorValue::new(format!("unknown workflow `{}`", run.workflow_name))
                    .with_code("UNKNOWN_WORKFLOW"),
            )
            .await?;
            return Ok(HandlerOutcome::Ack);
        };

        let events = load_all_events(storage.as_ref(), &run_id).await?;

        let input = match self.codec.hydrate(Boundary::WorkflowArguments, &run.input) {
            Ok(value) => value,
            Err(e) => {
                self.fail_run(
                    &run_id,
                    ErrorValue::new(format!("workflow input failed to hydrate: {e}"))
                        .with_code("DESERIALIZATION_ERROR"),
                )
                .await?;
                return Ok(HandlerOutcome::Ack);
            }
        };

        let state = Arc::new(Mutex::new(TurnState::new(
            &run,
            events,
            self.codec.clone(),
        )));
        let ctx = WorkflowCtx::new(state.clone(), input);
        let future = (descriptor.func)(ctx);

        match drive_turn(future, &state) {
            TurnOutcome::Completed(value) => {
                info!("workflow returned; completing run");
                let dehydrated =
                    match self
                        .codec
                        .dehydrate(Boundary::WorkflowReturn, &value, run_id.as_str())
                    {
                        Ok(d) => d,
                        Err(e) => {
                            self.fail_run(
                                &run_id,
                                ErrorValue::new(format!(
                                    "workflow return value failed to serialize: {e}"
                                ))
                                .with_code("SERIALIZATION_ERROR"),
                            )
                            .await?;
                            return Ok(HandlerOutcome::Ack);
                        }
                    };
                let output = dehydrated.flush().await?;

                match storage
                    .create_event(CreateEvent::new(
                        run_id.clone(),
                        EventData::RunCompleted { output },
                    ))
                    .await
                {
                    Ok(_) => {}
                    // A concurrent continuation already terminated the run.
                    Err(StoreError::Conflict { .. }) | Err(StoreError::RunTerminal(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(HandlerOutcome::Ack)
            }

            TurnOutcome::Failed(error) => {
                info!(error = %error.message, "workflow raised; failing run");
                self.fail_run(&run_id, error).await?;
                Ok(HandlerOutcome::Ack)
            }

            TurnOutcome::Corrupted(reason) => {
                warn!(%reason, "event log corruption detected");
                self.fail_run(
                    &run_id,
                    ErrorValue::new(reason).with_code("WORKFLOW_RUNTIME_ERROR"),
                )
                .await?;
                Ok(HandlerOutcome::Ack)
            }

            TurnOutcome::Suspended(invocations) => {
                debug!(count = invocations.len(), "workflow suspended");
                for invocation in invocations {
                    self.dispatch(&run, invocation, message.trace_carrier.as_ref())
                        .await?;
                }
                Ok(HandlerOutcome::Ack)
            }
        }
    }

    /// Write `wait_completed` for every wait whose resume time has
    /// passed. Idempotent: losers of a concurrent race hit the 409 and
    /// move on.
    async fn complete_due_waits(&self, run: &WorkflowRun) -> Result<(), EngineError> {
        let storage = self.world.storage();
        let now = Utc::now();

        for wait in storage.list_waits(&run.run_id).await? {
            if wait.status != WaitStatus::Waiting {
                continue;
            }
            let due = wait.resume_at.map_or(false, |at| at <= now);
            if !due {
                continue;
            }
            match storage
                .create_event(
                    CreateEvent::new(run.run_id.clone(), EventData::WaitCompleted {})
                        .with_correlation(wait.correlation_id.clone()),
                )
                .await
            {
                Ok(_) => {}
                Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Write the creation event for a fresh invocation and enqueue the
    /// corresponding work. Invocations whose creation event already
    /// exists skip the write but still enqueue; the queue idempotency
    /// key makes the duplicate a no-op.
    async fn dispatch(
        &self,
        run: &WorkflowRun,
        invocation: Invocation,
        trace_carrier: Option<&TraceCarrier>,
    ) -> Result<(), EngineError> {
        let storage = self.world.storage();
        let has_created = invocation.has_created;

        match invocation.kind {
            InvocationKind::Step {
                step_id,
                step_name,
                args,
            } => {
                if !has_created {
                    let dehydrated = self.codec.dehydrate(
                        Boundary::StepArguments,
                        &args,
                        run.run_id.as_str(),
                    )?;
                    let input = dehydrated.flush().await?;

                    match storage
                        .create_event(
                            CreateEvent::new(
                                run.run_id.clone(),
                                EventData::StepCreated {
                                    step_name: step_name.clone(),
                                    input,
                                },
                            )
                            .with_correlation(step_id.clone()),
                        )
                        .await
                    {
                        Ok(_) => {}
                        // A concurrent continuation created it; the enqueue
                        // below dedups on the idempotency key.
                        Err(StoreError::Conflict { .. }) => {}
                        Err(StoreError::RunTerminal(_)) => return Ok(()),
                        Err(e) => return Err(e.into()),
                    }
                }

                let payload = serde_json::to_vec(&StepQueueMessage {
                    workflow_name: run.workflow_name.clone(),
                    workflow_run_id: run.run_id.clone(),
                    workflow_started_at: run.started_at,
                    step_id: step_id.clone(),
                    trace_carrier: trace_carrier.cloned(),
                    requested_at: Utc::now(),
                })
                .map_err(|e| EngineError::Queue(e.to_string()))?;

                self.world
                    .queue(
                        &step_queue(&step_name),
                        payload,
                        QueueOptions {
                            deployment_id: run.deployment_id.clone(),
                            idempotency_key: Some(format!("step-created:{step_id}")),
                            ..Default::default()
                        },
                    )
                    .await?;
            }

            InvocationKind::Sleep {
                correlation,
                resume_at,
            } => {
                if !has_created {
                    match storage
                        .create_event(
                            CreateEvent::new(
                                run.run_id.clone(),
                                EventData::WaitCreated { resume_at },
                            )
                            .with_correlation(correlation.clone()),
                        )
                        .await
                    {
                        Ok(_) => {}
                        Err(StoreError::Conflict { .. }) => {}
                        Err(StoreError::RunTerminal(_)) => return Ok(()),
                        Err(e) => return Err(e.into()),
                    }
                }

                let delay = (resume_at - Utc::now()).to_std().unwrap_or_default();
                self.enqueue_continuation(
                    run,
                    trace_carrier,
                    QueueOptions {
                        delay: Some(delay),
                        idempotency_key: Some(format!("wait-timer:{correlation}")),
                        ..Default::default()
                    },
                )
                .await?;
            }

            InvocationKind::Hook {
                hook_id,
                token,
                metadata,
            } => {
                if has_created {
                    return Ok(());
                }
                let metadata = match metadata {
                    Some(value) => Some(
                        self.codec
                            .dehydrate(Boundary::WorkflowReturn, &value, run.run_id.as_str())?
                            .flush()
                            .await?,
                    ),
                    None => None,
                };

                match storage
                    .create_event(
                        CreateEvent::new(
                            run.run_id.clone(),
                            EventData::HookCreated { token, metadata },
                        )
                        .with_correlation(hook_id.clone()),
                    )
                    .await
                {
                    Ok(outcome) => {
                        if outcome.event.event_type() == "hook_conflict" {
                            // Surfaced to the workflow on its next
                            // replay; wake it so it notices promptly.
                            self.enqueue_continuation(run, trace_carrier, QueueOptions::default())
                                .await?;
                        }
                    }
                    Err(StoreError::Conflict { .. }) => {}
                    Err(StoreError::RunTerminal(_)) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(())
    }

    async fn enqueue_continuation(
        &self,
        run: &WorkflowRun,
        trace_carrier: Option<&TraceCarrier>,
        options: QueueOptions,
    ) -> Result<(), EngineError> {
        let payload = serde_json::to_vec(&WorkflowQueueMessage {
            run_id: run.run_id.clone(),
            trace_carrier: trace_carrier.cloned(),
            requested_at: Some(Utc::now()),
        })
        .map_err(|e| EngineError::Queue(e.to_string()))?;

        self.world
            .queue(&workflow_queue(&run.workflow_name), payload, options)
            .await
    }

    async fn fail_run(&self, run_id: &RunId, error: ErrorValue) -> Result<(), EngineError> {
        match self
            .world
            .storage()
            .create_event(CreateEvent::new(
                run_id.clone(),
                EventData::RunFailed { error },
            ))
            .await
        {
            Ok(_) => Ok(()),
            // Already terminal; nothing left to record.
            Err(StoreError::Conflict { .. }) | Err(StoreError::RunTerminal(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
