//! Runtime assembly and run control
//!
//! The `Runtime` carries the world handle and the registries (no
//! process-wide globals), mounts the workflow and step queue consumers,
//! and exposes the run control surface: start, get, cancel, recreate,
//! wake, and stream reads.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{info, instrument};

use capstan_codec::{
    Boundary, BoundaryCodec, ClassRegistry, CodecValue, ErrorValue, SerializationError,
    StreamEnvironment,
};
use capstan_storage::{
    CreateEvent, EventData, RunId, RunStatus, StoreError, StreamError, StreamStore, WorkflowRun,
};

use crate::context::RUN_OUTPUT_STREAM;
use crate::error::EngineError;
use crate::executor::StepExecutor;
use crate::hooks::WebhookRequest;
use crate::names::{
    health_check_stream, workflow_queue, STEP_HEALTH_QUEUE, STEP_QUEUE_PREFIX,
    WORKFLOW_HEALTH_QUEUE, WORKFLOW_QUEUE_PREFIX,
};
use crate::orchestrator::Orchestrator;
use crate::registry::{StepRegistry, WorkflowRegistry};
use crate::world::{
    HandlerOutcome, HealthCheckMessage, QueueHandler, QueueOptions, StepQueueMessage, TraceCarrier,
    World, WorkflowQueueMessage,
};

/// Polling interval for `RunHandle::return_value`
const RETURN_VALUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Adapts the stream store to the codec's pump interface
struct StoreStreamEnvironment {
    streams: Arc<dyn StreamStore>,
}

#[async_trait]
impl StreamEnvironment for StoreStreamEnvironment {
    async fn write_chunks(
        &self,
        name: &str,
        run_id: &str,
        chunks: Vec<Vec<u8>>,
    ) -> Result<(), SerializationError> {
        self.streams
            .write_to_stream_multi(name, run_id, chunks)
            .await
            .map_err(|e| SerializationError::StreamDrain {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn close_stream(&self, name: &str, run_id: &str) -> Result<(), SerializationError> {
        self.streams
            .close_stream(name, run_id)
            .await
            .map_err(|e| SerializationError::StreamDrain {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Options for starting a run
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub deployment_id: Option<String>,
    pub trace_carrier: Option<TraceCarrier>,
}

/// Options for recreating a run from an existing one
#[derive(Debug, Clone, Default)]
pub struct RecreateOptions {
    pub deployment_id: Option<String>,
}

/// Error surfaced by `RunHandle::return_value`
#[derive(Debug, thiserror::Error)]
pub enum RunWaitError {
    #[error("run {0} was cancelled")]
    Cancelled(RunId),

    #[error("run {run_id} failed: {error}")]
    Failed { run_id: RunId, error: ErrorValue },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// The assembled engine: world + registries + codec.
pub struct Runtime {
    world: Arc<dyn World>,
    workflows: Arc<WorkflowRegistry>,
    steps: Arc<StepRegistry>,
    codec: BoundaryCodec,
    workflow_consumer: Arc<WorkflowConsumer>,
    step_consumer: Arc<StepConsumer>,
}

impl Runtime {
    /// Assemble a runtime. The registries are fixed from here on; the
    /// engine's own serialization classes are registered automatically.
    pub fn new(
        world: Arc<dyn World>,
        workflows: WorkflowRegistry,
        steps: StepRegistry,
        mut classes: ClassRegistry,
    ) -> Arc<Self> {
        classes.register::<WebhookRequest>();

        let stream_env = Arc::new(StoreStreamEnvironment {
            streams: world.streams(),
        });
        let mut codec = BoundaryCodec::new(Arc::new(classes)).with_streams(stream_env);
        if let Some(encryption) = world.encryption() {
            codec = codec.with_encryption(encryption);
        }

        let workflows = Arc::new(workflows);
        let steps = Arc::new(steps);

        let workflow_consumer = Arc::new(WorkflowConsumer {
            orchestrator: Arc::new(Orchestrator::new(
                world.clone(),
                workflows.clone(),
                codec.clone(),
            )),
            streams: world.streams(),
        });
        let step_consumer = Arc::new(StepConsumer {
            executor: Arc::new(StepExecutor::new(world.clone(), steps.clone(), codec.clone())),
            streams: world.streams(),
        });

        Arc::new(Self {
            world,
            workflows,
            steps,
            codec,
            workflow_consumer,
            step_consumer,
        })
    }

    /// Mount the queue consumers on the world. Call once at boot.
    pub fn install(self: &Arc<Self>) {
        self.world
            .create_queue_handler(WORKFLOW_QUEUE_PREFIX, self.workflow_consumer.clone());
        self.world
            .create_queue_handler(STEP_QUEUE_PREFIX, self.step_consumer.clone());

        info!(
            workflows = self.workflows.len(),
            steps = self.steps.len(),
            "runtime installed"
        );
    }

    /// Route a queue delivery arriving from outside the world (the HTTP
    /// queue endpoints) into the matching consumer.
    pub async fn dispatch_queue(
        &self,
        queue_name: &str,
        payload: Vec<u8>,
    ) -> Result<HandlerOutcome, EngineError> {
        if queue_name.starts_with(STEP_QUEUE_PREFIX) {
            self.step_consumer.handle(queue_name, payload).await
        } else if queue_name.starts_with(WORKFLOW_QUEUE_PREFIX) {
            self.workflow_consumer.handle(queue_name, payload).await
        } else {
            Err(EngineError::Queue(format!("unknown queue `{queue_name}`")))
        }
    }

    /// The world's event/entity store
    pub fn storage(&self) -> Arc<dyn capstan_storage::Storage> {
        self.world.storage()
    }

    pub(crate) fn world(&self) -> &Arc<dyn World> {
        &self.world
    }

    pub(crate) fn codec(&self) -> &BoundaryCodec {
        &self.codec
    }

    /// Start a new run of a registered workflow.
    #[instrument(skip(self, args, options))]
    pub async fn start(
        self: &Arc<Self>,
        workflow_name: &str,
        args: Vec<CodecValue>,
        options: StartOptions,
    ) -> Result<RunHandle, EngineError> {
        if !self.workflows.contains(workflow_name) {
            return Err(EngineError::UnknownWorkflow(workflow_name.to_string()));
        }

        let run_id = RunId::generate();
        let input = self
            .codec
            .dehydrate(
                Boundary::WorkflowArguments,
                &CodecValue::List(args),
                run_id.as_str(),
            )?
            .flush()
            .await?;

        let execution_context = options
            .trace_carrier
            .as_ref()
            .and_then(|carrier| serde_json::to_value(carrier).ok())
            .map(|trace| serde_json::json!({ "trace": trace }));

        self.world
            .storage()
            .create_event(CreateEvent::new(
                run_id.clone(),
                EventData::RunCreated {
                    workflow_name: workflow_name.to_string(),
                    deployment_id: options
                        .deployment_id
                        .or_else(|| Some(self.world.config().deployment_id.clone())),
                    input,
                    execution_context,
                },
            ))
            .await?;

        self.enqueue_run(workflow_name, &run_id, options.trace_carrier)
            .await?;

        info!(%run_id, %workflow_name, "run started");
        Ok(RunHandle {
            runtime: self.clone(),
            run_id,
        })
    }

    /// Handle to an existing run
    pub fn run(self: &Arc<Self>, run_id: RunId) -> RunHandle {
        RunHandle {
            runtime: self.clone(),
            run_id,
        }
    }

    /// Append `run_cancelled`. Idempotent: cancelling an
    /// already-terminal run is a no-op in effect.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<(), EngineError> {
        match self
            .world
            .storage()
            .create_event(CreateEvent::new(run_id.clone(), EventData::RunCancelled {}))
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::RunTerminal(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Start a fresh run with the same workflow and input as an
    /// existing one.
    pub async fn recreate_run_from_existing(
        self: &Arc<Self>,
        run_id: &RunId,
        options: RecreateOptions,
    ) -> Result<RunHandle, EngineError> {
        let storage = self.world.storage();
        let original = storage.get_run(run_id).await?;

        let new_run_id = RunId::generate();
        storage
            .create_event(CreateEvent::new(
                new_run_id.clone(),
                EventData::RunCreated {
                    workflow_name: original.workflow_name.clone(),
                    deployment_id: options.deployment_id.or(original.deployment_id),
                    input: original.input.clone(),
                    execution_context: original.execution_context.clone(),
                },
            ))
            .await?;

        self.enqueue_run(&original.workflow_name, &new_run_id, None)
            .await?;

        info!(original = %run_id, new = %new_run_id, "run recreated");
        Ok(RunHandle {
            runtime: self.clone(),
            run_id: new_run_id,
        })
    }

    /// Read a named stream of a run from `start_index`.
    pub fn read_stream(
        &self,
        run_id: &RunId,
        name: &str,
        start_index: usize,
    ) -> BoxStream<'static, Result<Vec<u8>, StreamError>> {
        self.world
            .streams()
            .read_from_stream(name, run_id.as_str(), start_index)
    }

    pub async fn list_streams(&self, run_id: &RunId) -> Result<Vec<String>, EngineError> {
        Ok(self
            .world
            .streams()
            .list_streams_by_run_id(run_id.as_str())
            .await?)
    }

    /// Round-trip a health probe through the queue and stream store.
    pub async fn health_check(&self, queue_name: &str) -> Result<bool, EngineError> {
        let correlation_id = ulid::Ulid::new().to_string();
        let payload = serde_json::to_vec(&HealthCheckMessage {
            correlation_id: correlation_id.clone(),
        })
        .map_err(|e| EngineError::Queue(e.to_string()))?;

        self.world
            .queue(queue_name, payload, QueueOptions::default())
            .await?;

        let mut reader = self.world.streams().read_from_stream(
            &health_check_stream(&correlation_id),
            &correlation_id,
            0,
        );
        let answer = tokio::time::timeout(Duration::from_secs(5), reader.next()).await;
        Ok(matches!(answer, Ok(Some(Ok(chunk))) if chunk == b"ok"))
    }

    pub(crate) async fn enqueue_run(
        &self,
        workflow_name: &str,
        run_id: &RunId,
        trace_carrier: Option<TraceCarrier>,
    ) -> Result<(), EngineError> {
        let payload = serde_json::to_vec(&WorkflowQueueMessage {
            run_id: run_id.clone(),
            trace_carrier,
            requested_at: Some(Utc::now()),
        })
        .map_err(|e| EngineError::Queue(e.to_string()))?;

        self.world
            .queue(
                &workflow_queue(workflow_name),
                payload,
                QueueOptions::default(),
            )
            .await
    }
}

/// Handle to one run
#[derive(Clone)]
pub struct RunHandle {
    runtime: Arc<Runtime>,
    run_id: RunId,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Current run row
    pub async fn get(&self) -> Result<WorkflowRun, EngineError> {
        Ok(self
            .runtime
            .world()
            .storage()
            .get_run(&self.run_id)
            .await?)
    }

    pub async fn status(&self) -> Result<RunStatus, EngineError> {
        Ok(self.get().await?.status)
    }

    pub async fn workflow_name(&self) -> Result<String, EngineError> {
        Ok(self.get().await?.workflow_name)
    }

    pub async fn created_at(&self) -> Result<DateTime<Utc>, EngineError> {
        Ok(self.get().await?.created_at)
    }

    pub async fn started_at(&self) -> Result<Option<DateTime<Utc>>, EngineError> {
        Ok(self.get().await?.started_at)
    }

    pub async fn completed_at(&self) -> Result<Option<DateTime<Utc>>, EngineError> {
        Ok(self.get().await?.completed_at)
    }

    /// Poll until the run is terminal; hydrate the return value on
    /// success and surface typed errors otherwise.
    pub async fn return_value(&self) -> Result<CodecValue, RunWaitError> {
        loop {
            let run = self.get().await?;
            match run.status {
                RunStatus::Completed => {
                    let output = run.output.unwrap_or_default();
                    return self
                        .runtime
                        .codec()
                        .hydrate(Boundary::WorkflowReturn, &output)
                        .map_err(|e| RunWaitError::Engine(e.into()));
                }
                RunStatus::Failed => {
                    return Err(RunWaitError::Failed {
                        run_id: self.run_id.clone(),
                        error: run
                            .error
                            .unwrap_or_else(|| ErrorValue::new("run failed")),
                    })
                }
                RunStatus::Cancelled => {
                    return Err(RunWaitError::Cancelled(self.run_id.clone()))
                }
                RunStatus::Pending | RunStatus::Running => {
                    tokio::time::sleep(RETURN_VALUE_POLL_INTERVAL).await;
                }
            }
        }
    }

    pub async fn cancel(&self) -> Result<(), EngineError> {
        self.runtime.cancel_run(&self.run_id).await
    }

    /// The run's default output stream
    pub fn readable(&self) -> BoxStream<'static, Result<Vec<u8>, StreamError>> {
        self.runtime.read_stream(&self.run_id, RUN_OUTPUT_STREAM, 0)
    }

    pub fn read_stream(
        &self,
        name: &str,
        start_index: usize,
    ) -> BoxStream<'static, Result<Vec<u8>, StreamError>> {
        self.runtime.read_stream(&self.run_id, name, start_index)
    }
}

/// Workflow-queue consumer: health probes and continuations
struct WorkflowConsumer {
    orchestrator: Arc<Orchestrator>,
    streams: Arc<dyn StreamStore>,
}

#[async_trait]
impl QueueHandler for WorkflowConsumer {
    async fn handle(
        &self,
        queue_name: &str,
        payload: Vec<u8>,
    ) -> Result<HandlerOutcome, EngineError> {
        if queue_name == WORKFLOW_HEALTH_QUEUE {
            return respond_to_health_probe(&self.streams, &payload).await;
        }
        let message: WorkflowQueueMessage = serde_json::from_slice(&payload)
            .map_err(|e| EngineError::Queue(format!("bad workflow message: {e}")))?;
        self.orchestrator.handle_message(message).await
    }
}

/// Step-queue consumer: health probes and invocations
struct StepConsumer {
    executor: Arc<StepExecutor>,
    streams: Arc<dyn StreamStore>,
}

#[async_trait]
impl QueueHandler for StepConsumer {
    async fn handle(
        &self,
        queue_name: &str,
        payload: Vec<u8>,
    ) -> Result<HandlerOutcome, EngineError> {
        if queue_name == STEP_HEALTH_QUEUE {
            return respond_to_health_probe(&self.streams, &payload).await;
        }
        let message: StepQueueMessage = serde_json::from_slice(&payload)
            .map_err(|e| EngineError::Queue(format!("bad step message: {e}")))?;
        self.executor.handle_message(message).await
    }
}

/// Answer a health probe into its one-shot stream
async fn respond_to_health_probe(
    streams: &Arc<dyn StreamStore>,
    payload: &[u8],
) -> Result<HandlerOutcome, EngineError> {
    let probe: HealthCheckMessage = serde_json::from_slice(payload)
        .map_err(|e| EngineError::Queue(format!("bad health probe: {e}")))?;

    let name = health_check_stream(&probe.correlation_id);
    streams
        .write_to_stream(&name, &probe.correlation_id, b"ok".to_vec())
        .await?;
    streams.close_stream(&name, &probe.correlation_id).await?;
    Ok(HandlerOutcome::Ack)
}
