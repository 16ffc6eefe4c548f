//! # Durable workflow engine core
//!
//! Workflows are ordinary async functions that orchestrate
//! side-effecting steps. The engine persists every state change as an
//! event and replays workflow code deterministically from that log, so
//! orchestrations survive crashes, restarts, and redeploys.
//!
//! Two directives split the programming model:
//!
//! - a **workflow** must be deterministic and only reaches the outside
//!   world through the [`WorkflowCtx`] primitives (steps, sleeps,
//!   hooks),
//! - a **step** may perform arbitrary I/O, runs at-least-once, and
//!   propagates failures by retry class ([`StepFailure`]).
//!
//! ```ignore
//! let mut workflows = WorkflowRegistry::new();
//! workflows.register(WorkflowDescriptor::new(
//!     SymbolicName::workflow("./src/jobs/order", "process"),
//!     |ctx: WorkflowCtx| async move {
//!         let charged = ctx
//!             .step("step//./src/jobs/order//charge", vec![ctx.arg(0).cloned().unwrap()])
//!             .await?;
//!         Ok(charged)
//!     },
//! ));
//!
//! let world = Arc::new(LocalWorld::in_memory());
//! let runtime = Runtime::new(world, workflows, steps, ClassRegistry::new());
//! runtime.install();
//!
//! let run = runtime.start("workflow//./src/jobs/order//process", args, Default::default()).await?;
//! let result = run.return_value().await?;
//! ```

mod client;
mod context;
mod error;
mod executor;
mod hooks;
mod local;
mod names;
mod orchestrator;
mod registry;
mod sandbox;
mod world;

pub use client::{RecreateOptions, RunHandle, RunWaitError, Runtime, StartOptions};
pub use context::{
    Hook, HookOptions, RespondWith, SleepFuture, StepCtx, StepFuture, WebhookOptions,
    WorkflowCtx, RUN_OUTPUT_STREAM,
};
pub use error::{EngineError, FatalError, StepFailure, StepFailureKind};
pub use hooks::WebhookRequest;
pub use local::LocalWorld;
pub use names::{
    health_check_stream, step_queue, workflow_queue, NameError, NamePrefix, SymbolicName,
    STEP_HEALTH_QUEUE, STEP_QUEUE_PREFIX, WORKFLOW_HEALTH_QUEUE, WORKFLOW_QUEUE_PREFIX,
};
pub use registry::{
    StepDescriptor, StepFn, StepRegistry, WorkflowDescriptor, WorkflowFn, WorkflowRegistry,
    DEFAULT_MAX_RETRIES,
};
pub use world::{
    HandlerOutcome, HealthCheckMessage, QueueHandler, QueueOptions, StepQueueMessage,
    TraceCarrier, World, WorldConfig, WorkflowQueueMessage,
};

// Commonly re-exported collaborator types
pub use capstan_codec::{
    instance, Boundary, BoundaryCodec, ClassRegistry, CodecValue, ErrorValue, RequestValue,
    ResponseValue, SerializableClass, StepRefValue, StreamKind, StreamValue,
};
pub use capstan_storage::{
    CorrelationId, EventData, EventOrder, EventPage, HookId, RunId, RunStatus, StepId,
    StepStatus, Storage, StoreError, StreamStore,
};
