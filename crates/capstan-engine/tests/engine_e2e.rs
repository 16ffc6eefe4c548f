//! End-to-end engine scenarios on the in-memory world.
//!
//! Each test assembles a runtime over `LocalWorld::in_memory()`, starts
//! a run, and drives it purely through the queue machinery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use capstan_engine::{
    ClassRegistry, CodecValue, LocalWorld, RespondWith, ResponseValue, RunWaitError, Runtime,
    StartOptions, StepDescriptor, StepFailure, StepRegistry, SymbolicName, WebhookOptions,
    WebhookRequest, WorkflowCtx, WorkflowDescriptor, WorkflowRegistry, World,
};
use capstan_storage::{load_all_events, RunId, RunStatus, Storage};

const ADD_STEP: &str = "step//./src/demo//add";
const FLAKY_STEP: &str = "step//./src/demo//flaky";
const BOOM_STEP: &str = "step//./src/demo//boom";
const ONCE_STEP: &str = "step//./src/demo//once";
const RESPOND_STEP: &str = "step//./src/demo//respond";

fn harness(
    workflows: WorkflowRegistry,
    steps: StepRegistry,
) -> (Arc<LocalWorld>, Arc<Runtime>) {
    let world = Arc::new(LocalWorld::in_memory());
    let runtime = Runtime::new(world.clone(), workflows, steps, ClassRegistry::new());
    runtime.install();
    (world, runtime)
}

async fn event_type_count(storage: &Arc<dyn Storage>, run_id: &RunId, event_type: &str) -> usize {
    load_all_events(storage.as_ref(), run_id)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type() == event_type)
        .count()
}

fn add_step() -> StepDescriptor {
    StepDescriptor::new(SymbolicName::step("./src/demo", "add"), |ctx| async move {
        let a = ctx.arg(0).and_then(|v| v.as_i64()).unwrap_or(0);
        let b = ctx.arg(1).and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(CodecValue::Int(a + b))
    })
}

#[tokio::test(start_paused = true)]
async fn add_ten_runs_three_steps_in_series() {
    let mut steps = StepRegistry::new();
    steps.register(add_step());

    let mut workflows = WorkflowRegistry::new();
    workflows.register(WorkflowDescriptor::new(
        SymbolicName::workflow("./src/demo", "add_ten"),
        |ctx: WorkflowCtx| async move {
            let mut value = ctx.arg(0).cloned().unwrap_or(CodecValue::Int(0));
            for increment in [2i64, 3, 5] {
                value = ctx
                    .step(ADD_STEP, vec![value, CodecValue::Int(increment)])
                    .await?;
            }
            Ok(value)
        },
    ));

    let (world, runtime) = harness(workflows, steps);
    let run = runtime
        .start(
            "workflow//./src/demo//add_ten",
            vec![CodecValue::Int(2)],
            StartOptions::default(),
        )
        .await
        .unwrap();

    let result = run.return_value().await.unwrap();
    assert_eq!(result, CodecValue::Int(12));

    let storage = world.storage();
    let run_id = run.run_id();
    assert_eq!(event_type_count(&storage, run_id, "step_created").await, 3);
    assert_eq!(event_type_count(&storage, run_id, "step_started").await, 3);
    assert_eq!(event_type_count(&storage, run_id, "step_completed").await, 3);
    assert_eq!(event_type_count(&storage, run_id, "run_started").await, 1);
    assert_eq!(event_type_count(&storage, run_id, "run_completed").await, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_success_records_each_attempt() {
    let mut steps = StepRegistry::new();
    steps.register(StepDescriptor::new(
        SymbolicName::step("./src/demo", "flaky"),
        |ctx| async move {
            if ctx.attempt() < 3 {
                Err(StepFailure::retryable("not yet"))
            } else {
                Ok(CodecValue::Int(ctx.attempt() as i64))
            }
        },
    ));

    let mut workflows = WorkflowRegistry::new();
    workflows.register(WorkflowDescriptor::new(
        SymbolicName::workflow("./src/demo", "retry_success"),
        |ctx: WorkflowCtx| async move {
            let final_attempt = ctx.step(FLAKY_STEP, vec![]).await?;
            Ok(CodecValue::object([("finalAttempt", final_attempt)]))
        },
    ));

    let (world, runtime) = harness(workflows, steps);
    let run = runtime
        .start(
            "workflow//./src/demo//retry_success",
            vec![],
            StartOptions::default(),
        )
        .await
        .unwrap();

    let result = run.return_value().await.unwrap();
    assert_eq!(
        result,
        CodecValue::object([("finalAttempt", CodecValue::Int(3))])
    );

    let storage = world.storage();
    let run_id = run.run_id();
    assert_eq!(event_type_count(&storage, run_id, "step_started").await, 3);
    assert_eq!(event_type_count(&storage, run_id, "step_retrying").await, 2);
    assert_eq!(event_type_count(&storage, run_id, "step_completed").await, 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_step_error_is_catchable_by_the_workflow() {
    let mut steps = StepRegistry::new();
    steps.register(StepDescriptor::new(
        SymbolicName::step("./src/demo", "boom"),
        |_ctx| async move { Err(StepFailure::fatal("boom")) },
    ));

    let mut workflows = WorkflowRegistry::new();
    workflows.register(WorkflowDescriptor::new(
        SymbolicName::workflow("./src/demo", "fatal"),
        |ctx: WorkflowCtx| async move {
            match ctx.step(BOOM_STEP, vec![]).await {
                Ok(_) => Ok(CodecValue::String("unexpected success".into())),
                Err(e) => Ok(CodecValue::object([(
                    "caught",
                    CodecValue::String(e.message().to_string()),
                )])),
            }
        },
    ));

    let (world, runtime) = harness(workflows, steps);
    let run = runtime
        .start(
            "workflow//./src/demo//fatal",
            vec![],
            StartOptions::default(),
        )
        .await
        .unwrap();

    let result = run.return_value().await.unwrap();
    match result.get("caught") {
        Some(CodecValue::String(message)) => assert!(message.contains("boom")),
        other => panic!("expected caught message, got {other:?}"),
    }

    let storage = world.storage();
    let run_id = run.run_id();
    assert_eq!(event_type_count(&storage, run_id, "step_started").await, 1);
    assert_eq!(event_type_count(&storage, run_id, "step_failed").await, 1);
    assert_eq!(event_type_count(&storage, run_id, "step_retrying").await, 0);
}

#[tokio::test(start_paused = true)]
async fn zero_max_retries_means_exactly_one_attempt() {
    let mut steps = StepRegistry::new();
    steps.register(
        StepDescriptor::new(SymbolicName::step("./src/demo", "once"), |_ctx| async move {
            Err(StepFailure::retryable("always down"))
        })
        .with_max_retries(0),
    );

    let mut workflows = WorkflowRegistry::new();
    workflows.register(WorkflowDescriptor::new(
        SymbolicName::workflow("./src/demo", "one_shot"),
        |ctx: WorkflowCtx| async move {
            match ctx.step(ONCE_STEP, vec![]).await {
                Ok(value) => Ok(value),
                Err(e) => Ok(CodecValue::String(e.message().to_string())),
            }
        },
    ));

    let (world, runtime) = harness(workflows, steps);
    let run = runtime
        .start(
            "workflow//./src/demo//one_shot",
            vec![],
            StartOptions::default(),
        )
        .await
        .unwrap();

    run.return_value().await.unwrap();

    let storage = world.storage();
    let run_id = run.run_id();
    assert_eq!(event_type_count(&storage, run_id, "step_started").await, 1);
    assert_eq!(event_type_count(&storage, run_id, "step_failed").await, 1);
    assert_eq!(event_type_count(&storage, run_id, "step_retrying").await, 0);
}

#[tokio::test(start_paused = true)]
async fn three_concurrent_proxies_get_three_distinct_steps() {
    let mut steps = StepRegistry::new();
    steps.register(add_step());

    let mut workflows = WorkflowRegistry::new();
    workflows.register(WorkflowDescriptor::new(
        SymbolicName::workflow("./src/demo", "fan_out"),
        |ctx: WorkflowCtx| async move {
            let a = ctx.step(ADD_STEP, vec![CodecValue::Int(1), CodecValue::Int(0)]);
            let b = ctx.step(ADD_STEP, vec![CodecValue::Int(2), CodecValue::Int(0)]);
            let c = ctx.step(ADD_STEP, vec![CodecValue::Int(3), CodecValue::Int(0)]);
            let (a, b, c) = futures::try_join!(a, b, c)?;
            let total = [a, b, c]
                .iter()
                .filter_map(|v| v.as_i64())
                .sum::<i64>();
            Ok(CodecValue::Int(total))
        },
    ));

    let (world, runtime) = harness(workflows, steps);
    let run = runtime
        .start(
            "workflow//./src/demo//fan_out",
            vec![],
            StartOptions::default(),
        )
        .await
        .unwrap();

    let result = run.return_value().await.unwrap();
    assert_eq!(result, CodecValue::Int(6));

    let storage = world.storage();
    let run_id = run.run_id();
    assert_eq!(event_type_count(&storage, run_id, "step_created").await, 3);
    assert_eq!(event_type_count(&storage, run_id, "step_completed").await, 3);

    // Three distinct correlation ids.
    let events = load_all_events(storage.as_ref(), run_id).await.unwrap();
    let mut correlations: Vec<_> = events
        .iter()
        .filter(|e| e.event_type() == "step_created")
        .filter_map(|e| e.correlation_id.clone())
        .collect();
    correlations.sort();
    correlations.dedup();
    assert_eq!(correlations.len(), 3);
}

#[tokio::test]
async fn sleep_suspends_and_resumes_after_the_duration() {
    let turns = Arc::new(AtomicUsize::new(0));
    let turns_in_workflow = turns.clone();

    let mut workflows = WorkflowRegistry::new();
    workflows.register(WorkflowDescriptor::new(
        SymbolicName::workflow("./src/demo", "nap"),
        move |ctx: WorkflowCtx| {
            let turns = turns_in_workflow.clone();
            async move {
                turns.fetch_add(1, Ordering::SeqCst);
                let start = ctx.now();
                ctx.sleep(Duration::from_millis(300)).await;
                let end = ctx.now();
                Ok(CodecValue::object([
                    ("startMs", CodecValue::Int(start.timestamp_millis())),
                    ("endMs", CodecValue::Int(end.timestamp_millis())),
                ]))
            }
        },
    ));

    let (world, runtime) = harness(workflows, StepRegistry::new());
    let run = runtime
        .start(
            "workflow//./src/demo//nap",
            vec![],
            StartOptions::default(),
        )
        .await
        .unwrap();

    let result = run.return_value().await.unwrap();
    let start = result.get("startMs").and_then(|v| v.as_i64()).unwrap();
    let end = result.get("endMs").and_then(|v| v.as_i64()).unwrap();
    assert!(
        end - start >= 300,
        "slept {}ms, expected at least 300",
        end - start
    );

    let storage = world.storage();
    let run_id = run.run_id();
    assert_eq!(event_type_count(&storage, run_id, "wait_created").await, 1);
    assert_eq!(event_type_count(&storage, run_id, "wait_completed").await, 1);

    // One execution before the sleep, one after.
    assert_eq!(turns.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn wake_up_run_skips_a_pending_sleep() {
    let mut workflows = WorkflowRegistry::new();
    workflows.register(WorkflowDescriptor::new(
        SymbolicName::workflow("./src/demo", "long_nap"),
        |ctx: WorkflowCtx| async move {
            ctx.sleep(Duration::from_secs(3600)).await;
            Ok(CodecValue::String("woke".into()))
        },
    ));

    let (world, runtime) = harness(workflows, StepRegistry::new());
    let run = runtime
        .start(
            "workflow//./src/demo//long_nap",
            vec![],
            StartOptions::default(),
        )
        .await
        .unwrap();

    // Let the first turn persist the wait.
    let storage = world.storage();
    loop {
        if event_type_count(&storage, run.run_id(), "wait_created").await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stopped = runtime.wake_up_run(run.run_id(), None).await.unwrap();
    assert_eq!(stopped, 1);

    let result = run.return_value().await.unwrap();
    assert_eq!(result, CodecValue::String("woke".into()));
}

#[tokio::test(start_paused = true)]
async fn webhook_manual_response_round_trip() {
    let mut steps = StepRegistry::new();
    steps.register(StepDescriptor::new(
        SymbolicName::step("./src/demo", "respond"),
        |ctx| async move {
            let request = ctx
                .arg(0)
                .and_then(WebhookRequest::from_value)
                .ok_or_else(|| StepFailure::fatal("expected a webhook request"))?;

            request
                .respond_with(
                    &ctx,
                    ResponseValue {
                        status: 200,
                        headers: vec![("content-type".into(), "text/plain".into())],
                        body: Some(CodecValue::Bytes(capstan_codec_bytes(
                            b"Hello from webhook!",
                        ))),
                    },
                )
                .await
                .map_err(|e| StepFailure::fatal(e.to_string()))?;
            Ok(CodecValue::Null)
        },
    ));

    let mut workflows = WorkflowRegistry::new();
    workflows.register(WorkflowDescriptor::new(
        SymbolicName::workflow("./src/demo", "webhookish"),
        |ctx: WorkflowCtx| async move {
            let mut webhook = ctx.create_webhook(WebhookOptions {
                token: Some("tok-manual".into()),
                respond_with: RespondWith::Manual,
            });
            let payload = webhook.next().await?;
            ctx.step(RESPOND_STEP, vec![payload]).await?;
            Ok(CodecValue::String("responded".into()))
        },
    ));

    let (world, runtime) = harness(workflows, steps);
    let run = runtime
        .start(
            "workflow//./src/demo//webhookish",
            vec![],
            StartOptions::default(),
        )
        .await
        .unwrap();

    // Wait for the hook to exist before resuming it.
    let storage = world.storage();
    loop {
        if event_type_count(&storage, run.run_id(), "hook_created").await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = runtime
        .resume_webhook(
            "tok-manual",
            capstan_engine::RequestValue {
                method: "POST".into(),
                url: "https://example.com/.well-known/workflow/v1/webhook/tok-manual".into(),
                headers: vec![],
                body: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    match response.body {
        Some(CodecValue::Bytes(bytes)) => {
            assert_eq!(bytes.data, b"Hello from webhook!".to_vec())
        }
        other => panic!("expected bytes body, got {other:?}"),
    }

    let result = run.return_value().await.unwrap();
    assert_eq!(result, CodecValue::String("responded".into()));
}

#[tokio::test(start_paused = true)]
async fn cancel_during_sleep_terminates_without_further_steps() {
    let mut steps = StepRegistry::new();
    steps.register(add_step());

    let mut workflows = WorkflowRegistry::new();
    workflows.register(WorkflowDescriptor::new(
        SymbolicName::workflow("./src/demo", "cancel_me"),
        |ctx: WorkflowCtx| async move {
            ctx.sleep(Duration::from_secs(60)).await;
            // Never reached: the run is cancelled mid-sleep.
            ctx.step(ADD_STEP, vec![CodecValue::Int(1), CodecValue::Int(1)])
                .await?;
            Ok(CodecValue::Null)
        },
    ));

    let (world, runtime) = harness(workflows, steps);
    let run = runtime
        .start(
            "workflow//./src/demo//cancel_me",
            vec![],
            StartOptions::default(),
        )
        .await
        .unwrap();

    let storage = world.storage();
    loop {
        if event_type_count(&storage, run.run_id(), "wait_created").await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    run.cancel().await.unwrap();
    // Cancelling twice is accepted.
    run.cancel().await.unwrap();

    match run.return_value().await {
        Err(RunWaitError::Cancelled(run_id)) => assert_eq!(&run_id, run.run_id()),
        other => panic!("expected cancellation, got {other:?}"),
    }

    // Let the pending sleep timer fire against the cancelled run.
    tokio::time::sleep(Duration::from_secs(61)).await;
    world.quiesce().await;

    assert_eq!(event_type_count(&storage, run.run_id(), "step_created").await, 0);
    assert_eq!(run.status().await.unwrap(), RunStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn recreate_runs_the_same_input_again() {
    let mut steps = StepRegistry::new();
    steps.register(add_step());

    let mut workflows = WorkflowRegistry::new();
    workflows.register(WorkflowDescriptor::new(
        SymbolicName::workflow("./src/demo", "doubler"),
        |ctx: WorkflowCtx| async move {
            let input = ctx.arg(0).cloned().unwrap_or(CodecValue::Int(0));
            ctx.step(ADD_STEP, vec![input.clone(), input])
                .await
                .map_err(Into::into)
        },
    ));

    let (_world, runtime) = harness(workflows, steps);
    let run = runtime
        .start(
            "workflow//./src/demo//doubler",
            vec![CodecValue::Int(21)],
            StartOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(run.return_value().await.unwrap(), CodecValue::Int(42));

    let clone = runtime
        .recreate_run_from_existing(run.run_id(), Default::default())
        .await
        .unwrap();
    assert_ne!(clone.run_id(), run.run_id());
    assert_eq!(clone.return_value().await.unwrap(), CodecValue::Int(42));
}

#[tokio::test(start_paused = true)]
async fn health_probes_answer_through_streams() {
    let (_world, runtime) = harness(WorkflowRegistry::new(), StepRegistry::new());

    assert!(runtime
        .health_check(capstan_engine::WORKFLOW_HEALTH_QUEUE)
        .await
        .unwrap());
    assert!(runtime
        .health_check(capstan_engine::STEP_HEALTH_QUEUE)
        .await
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn run_output_stream_reaches_the_caller() {
    let mut steps = StepRegistry::new();
    steps.register(StepDescriptor::new(
        SymbolicName::step("./src/demo", "emit"),
        |ctx| async move {
            let stream = match ctx.arg(0) {
                Some(capstan_engine::CodecValue::Stream(stream)) => stream.clone(),
                other => return Err(StepFailure::fatal(format!("expected stream, got {other:?}"))),
            };
            let writer = ctx
                .writer(&stream)
                .map_err(|e| StepFailure::fatal(e.to_string()))?;
            writer.write(b"chunk-1".to_vec()).map_err(|e| StepFailure::fatal(e.to_string()))?;
            writer.write(b"chunk-2".to_vec()).map_err(|e| StepFailure::fatal(e.to_string()))?;
            writer.close().await.map_err(|e| StepFailure::fatal(e.to_string()))?;
            Ok(CodecValue::Null)
        },
    ));

    let mut workflows = WorkflowRegistry::new();
    workflows.register(WorkflowDescriptor::new(
        SymbolicName::workflow("./src/demo", "streamer"),
        |ctx: WorkflowCtx| async move {
            let writable = ctx.get_writable(None);
            ctx.step("step//./src/demo//emit", vec![CodecValue::Stream(writable)])
                .await?;
            Ok(CodecValue::Null)
        },
    ));

    let (_world, runtime) = harness(workflows, steps);
    let run = runtime
        .start(
            "workflow//./src/demo//streamer",
            vec![],
            StartOptions::default(),
        )
        .await
        .unwrap();

    run.return_value().await.unwrap();

    let chunks: Vec<_> = run.readable().map(|c| c.unwrap()).collect().await;
    assert_eq!(chunks, vec![b"chunk-1".to_vec(), b"chunk-2".to_vec()]);
}

fn capstan_codec_bytes(data: &[u8]) -> capstan_codec::BytesValue {
    capstan_codec::BytesValue::plain(data.to_vec())
}
