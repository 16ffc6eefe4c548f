//! HTTP surface tests against an in-memory runtime.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use capstan_api::{router, AppState};
use capstan_engine::{
    ClassRegistry, CodecValue, LocalWorld, Runtime, StepRegistry, SymbolicName,
    WorkflowCtx, WorkflowDescriptor, WorkflowRegistry,
};

fn test_state() -> AppState {
    let world = Arc::new(LocalWorld::in_memory());

    let mut workflows = WorkflowRegistry::new();
    workflows.register(WorkflowDescriptor::new(
        SymbolicName::workflow("./src/demo", "echo"),
        |ctx: WorkflowCtx| async move {
            Ok(ctx.arg(0).cloned().unwrap_or(CodecValue::Null))
        },
    ));

    let runtime = Runtime::new(world, workflows, StepRegistry::new(), ClassRegistry::new());
    runtime.install();
    AppState { runtime }
}

#[tokio::test]
async fn health_probe_answers_unauthenticated() {
    let app = router(test_state());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/__wkf_workflow_anything?__health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_webhook_token_is_404() {
    let app = router(test_state());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/.well-known/workflow/v1/webhook/tok-nobody")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn start_run_of_unknown_workflow_is_404() {
    let app = router(test_state());

    let body = serde_json::json!({
        "workflow_name": "workflow//./src/demo//missing",
        "args": []
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/runs")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn start_and_fetch_run() {
    let state = test_state();
    let app = router(state.clone());

    let body = serde_json::json!({
        "workflow_name": "workflow//./src/demo//echo",
        "args": [7]
    });

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/runs")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Malformed run ids are rejected before hitting storage.
    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/runs/not-a-run-id")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
