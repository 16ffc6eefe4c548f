//! Workflow and step execution contexts
//!
//! The workflow context is the deterministic sandbox: every primitive a
//! workflow may call lives here as a method, and each suspension point
//! (step call, sleep, hook) allocates a deterministic correlation id
//! and resolves against the replayed event log. Calls with no matching
//! events register in the turn's invocations queue; the orchestrator
//! writes their creation events once the workflow quiesces.
//!
//! The step context is ordinary async Rust: it carries the attempt
//! metadata, the hydrated arguments, and live access to the stream
//! store and the process-local step registry.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use parking_lot::Mutex;

use capstan_codec::{
    Boundary, BoundaryCodec, CodecValue, StepRefValue, StreamKind, StreamValue,
};
use capstan_storage::{
    CorrelationId, Event, EventData, HookId, RunId, StepId, StreamError, StreamStore,
    StreamWriter, WorkflowRun,
};

use crate::error::{EngineError, FatalError, StepFailure};
use crate::registry::StepRegistry;
use crate::sandbox::{DeterministicIds, ReplayClock, SandboxRng};

/// Stream name used by `get_writable` when no name is given; the run
/// handle's `readable` side reads it back.
pub const RUN_OUTPUT_STREAM: &str = "output";

/// One outstanding invocation in first-call order.
///
/// `has_created` marks invocations whose creation event is already in
/// the log; the orchestrator skips re-emitting the event for those but
/// still enqueues their work, relying on queue idempotency keys to
/// dedup. This is what heals a crash between the event write and the
/// enqueue.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub kind: InvocationKind,
    pub has_created: bool,
}

#[derive(Debug, Clone)]
pub(crate) enum InvocationKind {
    Step {
        step_id: StepId,
        step_name: String,
        args: CodecValue,
    },
    Sleep {
        correlation: CorrelationId,
        resume_at: DateTime<Utc>,
    },
    Hook {
        hook_id: HookId,
        token: String,
        metadata: Option<CodecValue>,
    },
}

impl Invocation {
    pub(crate) fn correlation(&self) -> CorrelationId {
        match &self.kind {
            InvocationKind::Step { step_id, .. } => CorrelationId::from(step_id.clone()),
            InvocationKind::Sleep { correlation, .. } => correlation.clone(),
            InvocationKind::Hook { hook_id, .. } => CorrelationId::from(hook_id.clone()),
        }
    }
}

/// Sandbox state for one orchestration turn
pub(crate) struct TurnState {
    pub run_id: RunId,
    pub events: HashMap<CorrelationId, Vec<Event>>,
    pub invocations: Vec<Invocation>,
    pub ids: DeterministicIds,
    pub rng: SandboxRng,
    pub clock: ReplayClock,
    pub codec: BoundaryCodec,
    /// Set whenever a suspended future consumed an event this poll pass
    pub progressed: bool,
    /// Log corruption detected during replay; fails the run
    pub corruption: Option<String>,
}

impl TurnState {
    pub fn new(run: &WorkflowRun, events: Vec<Event>, codec: BoundaryCodec) -> Self {
        let mut by_correlation: HashMap<CorrelationId, Vec<Event>> = HashMap::new();
        for event in events {
            if let Some(correlation) = event.correlation_id.clone() {
                by_correlation.entry(correlation).or_default().push(event);
            }
        }

        Self {
            run_id: run.run_id.clone(),
            events: by_correlation,
            invocations: Vec::new(),
            ids: DeterministicIds::new(&run.run_id, run.created_at),
            rng: SandboxRng::new(&run.run_id),
            clock: ReplayClock::new(run.created_at),
            codec,
            progressed: false,
            corruption: None,
        }
    }

    fn record_corruption(&mut self, correlation: &CorrelationId, event_type: &str) {
        self.corruption = Some(format!(
            "unexpected event type `{event_type}` on correlation {correlation}"
        ));
    }
}

/// Options for `create_hook`
#[derive(Debug, Clone, Default)]
pub struct HookOptions {
    /// External match token; a deterministic `whk_<ULID>` is assigned
    /// when absent
    pub token: Option<String>,
    pub metadata: Option<CodecValue>,
}

/// Response behavior of a webhook
#[derive(Debug, Clone, PartialEq)]
pub enum RespondWith {
    /// HTTP 202 acknowledgement (default)
    Acknowledge,
    /// Fixed response returned immediately by the HTTP wrapper
    Static(capstan_codec::ResponseValue),
    /// The workflow supplies the response through a response stream
    Manual,
}

/// Options for `create_webhook`
#[derive(Debug, Clone)]
pub struct WebhookOptions {
    pub token: Option<String>,
    pub respond_with: RespondWith,
}

impl Default for WebhookOptions {
    fn default() -> Self {
        Self {
            token: None,
            respond_with: RespondWith::Acknowledge,
        }
    }
}

/// The deterministic workflow context.
///
/// Cheap to clone; all clones share the turn state.
#[derive(Clone)]
pub struct WorkflowCtx {
    pub(crate) state: Arc<Mutex<TurnState>>,
    input: CodecValue,
    run_id: RunId,
}

impl WorkflowCtx {
    pub(crate) fn new(state: Arc<Mutex<TurnState>>, input: CodecValue) -> Self {
        let run_id = state.lock().run_id.clone();
        Self {
            state,
            input,
            run_id,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Hydrated workflow arguments
    pub fn input(&self) -> &CodecValue {
        &self.input
    }

    /// Positional argument accessor
    pub fn arg(&self, index: usize) -> Option<&CodecValue> {
        match &self.input {
            CodecValue::List(items) => items.get(index),
            _ => None,
        }
    }

    /// Replay-stable current time
    pub fn now(&self) -> DateTime<Utc> {
        self.state.lock().clock.now()
    }

    /// Replay-stable uniform random in `[0, 1)`
    pub fn random(&self) -> f64 {
        self.state.lock().rng.random()
    }

    /// Invoke a registered step by symbolic name.
    ///
    /// The returned future resolves once the step's terminal event is in
    /// the log; until then the workflow suspends at this point.
    pub fn step(&self, step_name: &str, args: Vec<CodecValue>) -> StepFuture {
        self.enqueue_step(step_name.to_string(), args, None)
    }

    /// Invoke a step received as a serialized step-function reference.
    pub fn invoke(&self, step_ref: &StepRefValue, args: Vec<CodecValue>) -> StepFuture {
        self.enqueue_step(
            step_ref.step_id.clone(),
            args,
            step_ref.closure_vars.as_deref().cloned(),
        )
    }

    fn enqueue_step(
        &self,
        step_name: String,
        args: Vec<CodecValue>,
        closure_vars: Option<CodecValue>,
    ) -> StepFuture {
        let mut state = self.state.lock();
        let step_id = state.ids.next_step();
        let correlation = CorrelationId::from(step_id.clone());

        let resolution = state
            .events
            .get(&correlation)
            .map(|events| scan_step_events(events));
        let outstanding = !matches!(
            resolution,
            Some(Resolution::Completed(..) | Resolution::Failed(..) | Resolution::Corrupt(_))
        );

        if outstanding {
            let mut entries = vec![("args".to_string(), CodecValue::List(args))];
            if let Some(vars) = closure_vars {
                entries.push(("closure".to_string(), vars));
            }
            state.invocations.push(Invocation {
                kind: InvocationKind::Step {
                    step_id,
                    step_name,
                    args: CodecValue::Object(entries),
                },
                has_created: resolution.is_some(),
            });
        }

        StepFuture {
            state: self.state.clone(),
            correlation,
        }
    }

    /// Suspend for at least `duration` of wall-clock time.
    pub fn sleep(&self, duration: Duration) -> SleepFuture {
        let mut state = self.state.lock();
        let correlation = state.ids.next_wait();
        let resume_at =
            state.clock.now() + chrono::Duration::milliseconds(duration.as_millis() as i64);

        let resolution = state
            .events
            .get(&correlation)
            .map(|events| scan_wait_events(events));
        let outstanding = !matches!(
            resolution,
            Some(Resolution::WaitDone(_) | Resolution::Corrupt(_))
        );

        if outstanding {
            state.invocations.push(Invocation {
                kind: InvocationKind::Sleep {
                    correlation: correlation.clone(),
                    resume_at,
                },
                has_created: resolution.is_some(),
            });
        }

        SleepFuture {
            state: self.state.clone(),
            correlation,
        }
    }

    /// Create an external-signal hook. Each delivered payload is
    /// consumed by one `next().await`.
    pub fn create_hook(&self, options: HookOptions) -> Hook {
        let mut state = self.state.lock();
        let hook_id = state.ids.next_hook();
        let token = options
            .token
            .unwrap_or_else(|| state.ids.next_token());
        let correlation = CorrelationId::from(hook_id.clone());

        if !state.events.contains_key(&correlation) {
            state.invocations.push(Invocation {
                kind: InvocationKind::Hook {
                    hook_id,
                    token: token.clone(),
                    metadata: options.metadata,
                },
                has_created: false,
            });
        }

        Hook {
            state: self.state.clone(),
            correlation,
            token,
            cursor: 0,
        }
    }

    /// Layer webhook semantics on a hook: the respond mode travels in
    /// the hook metadata for the HTTP wrapper to act on.
    pub fn create_webhook(&self, options: WebhookOptions) -> Hook {
        let mut metadata = vec![(
            "respond_with".to_string(),
            CodecValue::String(
                match &options.respond_with {
                    RespondWith::Acknowledge => "ack",
                    RespondWith::Static(_) => "static",
                    RespondWith::Manual => "manual",
                }
                .to_string(),
            ),
        )];
        if let RespondWith::Static(response) = options.respond_with {
            metadata.push((
                "response".to_string(),
                CodecValue::Response(Box::new(response)),
            ));
        }

        self.create_hook(HookOptions {
            token: options.token,
            metadata: Some(CodecValue::Object(metadata)),
        })
    }

    /// A named writable stream reference to hand to steps. Without a
    /// name this is the run's default output stream.
    pub fn get_writable(&self, name: Option<&str>) -> StreamValue {
        let name = match name {
            Some(name) => name.to_string(),
            None => RUN_OUTPUT_STREAM.to_string(),
        };
        StreamValue::named(name, StreamKind::Writable)
    }
}

/// What the scan of one correlation's events produced
enum Resolution {
    Pending,
    Completed(Vec<u8>, DateTime<Utc>),
    Failed(capstan_codec::ErrorValue, DateTime<Utc>),
    WaitDone(DateTime<Utc>),
    HookPayload(Vec<u8>, DateTime<Utc>),
    HookConflict(String),
    Corrupt(&'static str),
}

fn scan_step_events(events: &[Event]) -> Resolution {
    for event in events {
        match &event.data {
            EventData::StepCompleted { output } => {
                return Resolution::Completed(output.clone(), event.created_at)
            }
            EventData::StepFailed { error } => {
                return Resolution::Failed(error.clone(), event.created_at)
            }
            EventData::StepCreated { .. }
            | EventData::StepStarted {}
            | EventData::StepRetrying { .. } => {}
            other => return Resolution::Corrupt(other.event_type()),
        }
    }
    Resolution::Pending
}

fn scan_wait_events(events: &[Event]) -> Resolution {
    for event in events {
        match &event.data {
            EventData::WaitCompleted {} => return Resolution::WaitDone(event.created_at),
            EventData::WaitCreated { .. } => {}
            other => return Resolution::Corrupt(other.event_type()),
        }
    }
    Resolution::Pending
}

fn scan_hook_events(events: &[Event], cursor: usize) -> Resolution {
    let mut received = 0usize;
    for event in events {
        match &event.data {
            EventData::HookConflict { token } => {
                return Resolution::HookConflict(token.clone())
            }
            EventData::HookReceived { payload } => {
                if received == cursor {
                    return Resolution::HookPayload(payload.clone(), event.created_at);
                }
                received += 1;
            }
            EventData::HookCreated { .. } | EventData::HookDisposed {} => {}
            other => return Resolution::Corrupt(other.event_type()),
        }
    }
    Resolution::Pending
}

/// A step proxy awaiting its terminal event
pub struct StepFuture {
    state: Arc<Mutex<TurnState>>,
    correlation: CorrelationId,
}

impl std::future::Future for StepFuture {
    type Output = Result<CodecValue, FatalError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        let resolution = match state.events.get(&self.correlation) {
            None => return Poll::Pending,
            Some(events) => scan_step_events(events),
        };

        match resolution {
            Resolution::Pending => Poll::Pending,
            Resolution::Completed(output, ts) => {
                match state.codec.hydrate(Boundary::StepReturn, &output) {
                    Ok(value) => {
                        state.clock.advance_to(ts);
                        state.progressed = true;
                        Poll::Ready(Ok(value))
                    }
                    Err(e) => {
                        state.corruption =
                            Some(format!("step output failed to hydrate: {e}"));
                        Poll::Pending
                    }
                }
            }
            Resolution::Failed(error, ts) => {
                state.clock.advance_to(ts);
                state.progressed = true;
                Poll::Ready(Err(FatalError::new(error)))
            }
            Resolution::Corrupt(event_type) => {
                let correlation = self.correlation.clone();
                state.record_corruption(&correlation, event_type);
                Poll::Pending
            }
            _ => {
                let correlation = self.correlation.clone();
                state.record_corruption(&correlation, "non-step resolution");
                Poll::Pending
            }
        }
    }
}

/// A sleep awaiting its `wait_completed`
pub struct SleepFuture {
    state: Arc<Mutex<TurnState>>,
    correlation: CorrelationId,
}

impl std::future::Future for SleepFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        let resolution = match state.events.get(&self.correlation) {
            None => return Poll::Pending,
            Some(events) => scan_wait_events(events),
        };

        match resolution {
            Resolution::Pending => Poll::Pending,
            Resolution::WaitDone(ts) => {
                state.clock.advance_to(ts);
                state.progressed = true;
                Poll::Ready(())
            }
            Resolution::Corrupt(event_type) => {
                let correlation = self.correlation.clone();
                state.record_corruption(&correlation, event_type);
                Poll::Pending
            }
            _ => {
                let correlation = self.correlation.clone();
                state.record_corruption(&correlation, "non-wait resolution");
                Poll::Pending
            }
        }
    }
}

/// An external-signal hook; iterable over delivered payloads
pub struct Hook {
    state: Arc<Mutex<TurnState>>,
    correlation: CorrelationId,
    token: String,
    cursor: usize,
}

impl Hook {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Await the next delivered payload. Distinct `hook_received`
    /// events yield successive payloads; a token conflict surfaces as a
    /// catchable error.
    pub async fn next(&mut self) -> Result<CodecValue, FatalError> {
        futures::future::poll_fn(|_cx| {
            let mut state = self.state.lock();
            let resolution = match state.events.get(&self.correlation) {
                None => return Poll::Pending,
                Some(events) => scan_hook_events(events, self.cursor),
            };

            match resolution {
                Resolution::Pending => Poll::Pending,
                Resolution::HookPayload(payload, ts) => {
                    match state.codec.hydrate(Boundary::WorkflowArguments, &payload) {
                        Ok(value) => {
                            state.clock.advance_to(ts);
                            state.progressed = true;
                            self.cursor += 1;
                            Poll::Ready(Ok(value))
                        }
                        Err(e) => {
                            state.corruption =
                                Some(format!("hook payload failed to hydrate: {e}"));
                            Poll::Pending
                        }
                    }
                }
                Resolution::HookConflict(token) => {
                    state.progressed = true;
                    Poll::Ready(Err(FatalError::new(
                        capstan_codec::ErrorValue::new(format!(
                            "hook token `{token}` is already in use"
                        ))
                        .with_code("HOOK_CONFLICT"),
                    )))
                }
                Resolution::Corrupt(event_type) => {
                    let correlation = self.correlation.clone();
                    state.record_corruption(&correlation, event_type);
                    Poll::Pending
                }
                _ => {
                    let correlation = self.correlation.clone();
                    state.record_corruption(&correlation, "non-hook resolution");
                    Poll::Pending
                }
            }
        })
        .await
    }
}

/// Context passed to step functions
#[derive(Clone)]
pub struct StepCtx {
    run_id: RunId,
    workflow_name: String,
    workflow_started_at: Option<DateTime<Utc>>,
    step_id: StepId,
    attempt: i32,
    step_started_at: Option<DateTime<Utc>>,
    args: Vec<CodecValue>,
    closure_vars: Option<CodecValue>,
    streams: Arc<dyn StreamStore>,
    steps: Arc<StepRegistry>,
    codec: BoundaryCodec,
}

impl StepCtx {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: RunId,
        workflow_name: String,
        workflow_started_at: Option<DateTime<Utc>>,
        step_id: StepId,
        attempt: i32,
        step_started_at: Option<DateTime<Utc>>,
        args: Vec<CodecValue>,
        closure_vars: Option<CodecValue>,
        streams: Arc<dyn StreamStore>,
        steps: Arc<StepRegistry>,
        codec: BoundaryCodec,
    ) -> Self {
        Self {
            run_id,
            workflow_name,
            workflow_started_at,
            step_id,
            attempt,
            step_started_at,
            args,
            closure_vars,
            streams,
            steps,
            codec,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn workflow_started_at(&self) -> Option<DateTime<Utc>> {
        self.workflow_started_at
    }

    pub fn step_id(&self) -> &StepId {
        &self.step_id
    }

    /// Attempt counter as seen after the `step_started` increment; the
    /// first execution sees `1`.
    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn step_started_at(&self) -> Option<DateTime<Utc>> {
        self.step_started_at
    }

    pub fn args(&self) -> &[CodecValue] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&CodecValue> {
        self.args.get(index)
    }

    pub fn closure_vars(&self) -> Option<&CodecValue> {
        self.closure_vars.as_ref()
    }

    pub(crate) fn codec(&self) -> &BoundaryCodec {
        &self.codec
    }

    pub(crate) fn streams(&self) -> Arc<dyn StreamStore> {
        self.streams.clone()
    }

    /// Coalescing writer over a writable stream reference
    pub fn writer(&self, stream: &StreamValue) -> Result<StreamWriter, EngineError> {
        let name = stream.name().ok_or_else(|| {
            EngineError::Stream(StreamError::NotFound("unnamed stream".into()))
        })?;
        Ok(StreamWriter::new(
            self.streams.clone(),
            name,
            self.run_id.as_str(),
        ))
    }

    /// Chunk reader over a readable stream reference
    pub fn reader(
        &self,
        stream: &StreamValue,
    ) -> Result<BoxStream<'static, Result<Vec<u8>, StreamError>>, EngineError> {
        let name = stream.name().ok_or_else(|| {
            EngineError::Stream(StreamError::NotFound("unnamed stream".into()))
        })?;
        Ok(self.streams.read_from_stream(&name, self.run_id.as_str(), 0))
    }

    /// Call a step function received as a reference. In step context
    /// this resolves through the process-local registry and runs
    /// inline, as a plain function call.
    pub async fn invoke(
        &self,
        step_ref: &StepRefValue,
        args: Vec<CodecValue>,
    ) -> Result<CodecValue, StepFailure> {
        let descriptor = self
            .steps
            .get(&step_ref.step_id)
            .ok_or_else(|| StepFailure::fatal(format!("unknown step `{}`", step_ref.step_id)))?
            .clone();

        let nested = StepCtx {
            args,
            closure_vars: step_ref.closure_vars.as_deref().cloned(),
            ..self.clone()
        };
        (descriptor.func)(nested).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_codec::ClassRegistry;
    use capstan_storage::{EventId, RunStatus};
    use futures::task::noop_waker;
    use std::future::Future;

    fn test_run() -> WorkflowRun {
        WorkflowRun {
            run_id: RunId::generate(),
            workflow_name: "workflow//./src/wf//main".into(),
            deployment_id: None,
            spec_version: capstan_storage::CURRENT_SPEC_VERSION,
            status: RunStatus::Running,
            input: vec![],
            output: None,
            error: None,
            execution_context: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    fn test_codec() -> BoundaryCodec {
        BoundaryCodec::new(Arc::new(ClassRegistry::new()))
    }

    fn ctx_for(run: &WorkflowRun, events: Vec<Event>) -> WorkflowCtx {
        let state = Arc::new(Mutex::new(TurnState::new(run, events, test_codec())));
        WorkflowCtx::new(state, CodecValue::List(vec![CodecValue::Int(2)]))
    }

    fn completed_event(run: &WorkflowRun, correlation: CorrelationId, output: &[u8]) -> Event {
        Event {
            event_id: EventId::generate(),
            run_id: run.run_id.clone(),
            correlation_id: Some(correlation),
            spec_version: run.spec_version,
            data: EventData::StepCompleted {
                output: output.to_vec(),
            },
            created_at: Utc::now(),
        }
    }

    fn poll_once<F: std::future::Future + Unpin>(future: &mut F) -> Poll<F::Output> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn test_three_identical_calls_get_distinct_correlations() {
        let run = test_run();
        let ctx = ctx_for(&run, vec![]);

        let _a = ctx.step("step//./src/math//add", vec![CodecValue::Int(1)]);
        let _b = ctx.step("step//./src/math//add", vec![CodecValue::Int(1)]);
        let _c = ctx.step("step//./src/math//add", vec![CodecValue::Int(1)]);

        let state = ctx.state.lock();
        assert_eq!(state.invocations.len(), 3);
        let mut correlations: Vec<_> = state
            .invocations
            .iter()
            .map(|i| i.correlation())
            .collect();
        let ordered = correlations.clone();
        correlations.sort();
        correlations.dedup();
        assert_eq!(correlations.len(), 3);

        // Queue order is the order the proxies were created.
        let replay_state = Arc::new(Mutex::new(TurnState::new(&run, vec![], test_codec())));
        let replay_ctx = WorkflowCtx::new(replay_state, CodecValue::Null);
        let _ = replay_ctx.step("step//./src/math//add", vec![]);
        let _ = replay_ctx.step("step//./src/math//add", vec![]);
        let _ = replay_ctx.step("step//./src/math//add", vec![]);
        let replayed: Vec<_> = replay_ctx
            .state
            .lock()
            .invocations
            .iter()
            .map(|i| i.correlation())
            .collect();
        assert_eq!(ordered, replayed);
    }

    #[test]
    fn test_step_future_resolves_from_log() {
        let run = test_run();

        // Discover the deterministic correlation of the first call.
        let probe = ctx_for(&run, vec![]);
        let _ = probe.step("step//./src/math//add", vec![]);
        let correlation = probe.state.lock().invocations[0].correlation();

        let codec = test_codec();
        let output = codec
            .dehydrate(Boundary::StepReturn, &CodecValue::Int(7), run.run_id.as_str())
            .unwrap()
            .bytes;

        let ctx = ctx_for(&run, vec![completed_event(&run, correlation, &output)]);
        let mut future = ctx.step("step//./src/math//add", vec![]);

        match poll_once(&mut future) {
            Poll::Ready(Ok(value)) => assert_eq!(value, CodecValue::Int(7)),
            other => panic!("expected ready, got {other:?}"),
        }

        // Replayed calls with events do not queue new invocations.
        assert!(ctx.state.lock().invocations.is_empty());
        assert!(ctx.state.lock().progressed);
    }

    #[test]
    fn test_unexpected_event_flags_corruption() {
        let run = test_run();
        let probe = ctx_for(&run, vec![]);
        let _ = probe.step("step//./src/math//add", vec![]);
        let correlation = probe.state.lock().invocations[0].correlation();

        let bogus = Event {
            event_id: EventId::generate(),
            run_id: run.run_id.clone(),
            correlation_id: Some(correlation),
            spec_version: run.spec_version,
            data: EventData::WaitCompleted {},
            created_at: Utc::now(),
        };

        let ctx = ctx_for(&run, vec![bogus]);
        let mut future = ctx.step("step//./src/math//add", vec![]);
        assert!(poll_once(&mut future).is_pending());
        assert!(ctx.state.lock().corruption.is_some());
    }

    #[test]
    fn test_sleep_registers_wait_invocation() {
        let run = test_run();
        let ctx = ctx_for(&run, vec![]);
        let mut future = ctx.sleep(Duration::from_secs(10));
        assert!(poll_once(&mut future).is_pending());

        let state = ctx.state.lock();
        assert!(!state.invocations[0].has_created);
        match &state.invocations[0].kind {
            InvocationKind::Sleep { resume_at, .. } => {
                let expected = run.created_at + chrono::Duration::seconds(10);
                assert_eq!(*resume_at, expected);
            }
            other => panic!("expected sleep invocation, got {other:?}"),
        }
    }

    #[test]
    fn test_hook_tokens_are_deterministic() {
        let run = test_run();
        let first = ctx_for(&run, vec![]).create_hook(HookOptions::default());
        let second = ctx_for(&run, vec![]).create_hook(HookOptions::default());
        assert_eq!(first.token(), second.token());
        assert!(first.token().starts_with("whk_"));
    }

    #[test]
    fn test_now_is_replay_stable() {
        let run = test_run();
        let ctx = ctx_for(&run, vec![]);
        assert_eq!(ctx.now(), run.created_at);
        let again = ctx_for(&run, vec![]);
        assert_eq!(ctx.now(), again.now());
    }
}
