//! In-memory implementation of `Storage`
//!
//! The reference backend: it backs the test suites and the local world,
//! and provides the same semantics as the PostgreSQL implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::event::{Event, EventData};
use crate::ids::{wait_key, CorrelationId, EventId, HookId, RunId, StepId};
use crate::model::{
    Hook, RunStatus, StepRecord, StepStatus, Wait, WaitStatus, WorkflowRun, CURRENT_SPEC_VERSION,
};
use crate::state::{spec_version_gate, terminal_gate};
use crate::store::{
    CreateEvent, EventOrder, EventOutcome, EventPage, Page, Pagination, RunFilter, Storage,
    StoreError,
};

#[derive(Default)]
struct Inner {
    runs: HashMap<RunId, WorkflowRun>,
    steps: HashMap<(RunId, StepId), StepRecord>,
    hooks: HashMap<(RunId, HookId), Hook>,
    /// Live token namespace: token → owning hook
    tokens: HashMap<String, (RunId, HookId)>,
    waits: HashMap<String, Wait>,
    events: HashMap<RunId, Vec<Event>>,
}

impl Inner {
    fn run(&self, run_id: &RunId) -> Result<&WorkflowRun, StoreError> {
        self.runs
            .get(run_id)
            .ok_or_else(|| StoreError::not_found("run", run_id.as_str()))
    }

    /// Drop every hook and wait belonging to a terminated run
    fn release_run_resources(&mut self, run_id: &RunId) {
        self.hooks.retain(|(owner, _), hook| {
            if owner == run_id {
                self.tokens.remove(&hook.token);
                false
            } else {
                true
            }
        });
        self.waits.retain(|_, wait| &wait.run_id != run_id);
    }
}

/// In-memory event log + entity store
pub struct MemoryStorage {
    inner: RwLock<Inner>,
    event_ids: Mutex<ulid::Generator>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            event_ids: Mutex::new(ulid::Generator::new()),
        }
    }

    pub fn run_count(&self) -> usize {
        self.inner.read().runs.len()
    }

    pub fn event_count(&self, run_id: &RunId) -> usize {
        self.inner
            .read()
            .events
            .get(run_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn next_event_id(&self) -> Result<EventId, StoreError> {
        self.event_ids
            .lock()
            .generate()
            .map(EventId::from_ulid)
            .map_err(|e| StoreError::Unavailable(format!("event id generation: {e}")))
    }

    fn step_for<'a>(
        inner: &'a mut Inner,
        run_id: &RunId,
        correlation_id: &Option<CorrelationId>,
    ) -> Result<&'a mut StepRecord, StoreError> {
        let step_id = correlation_id
            .as_ref()
            .and_then(|c| c.as_step_id())
            .ok_or_else(|| {
                StoreError::Serialization("step event requires a step correlation id".into())
            })?;
        inner
            .steps
            .get_mut(&(run_id.clone(), step_id.clone()))
            .ok_or_else(|| StoreError::not_found("step", step_id.as_str()))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_event(&self, input: CreateEvent) -> Result<EventOutcome, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let mut data = input.data.clone();

        // Gates: existence, spec version, terminal-state invariants.
        let spec_version = match &data {
            EventData::RunCreated { .. } => {
                if inner.runs.contains_key(&input.run_id) {
                    return Err(StoreError::conflict(
                        "run",
                        input.run_id.as_str(),
                        "already exists",
                    ));
                }
                CURRENT_SPEC_VERSION
            }
            _ => {
                let run = inner.run(&input.run_id)?;
                spec_version_gate(run)?;

                let step_status = input
                    .correlation_id
                    .as_ref()
                    .and_then(|c| c.as_step_id())
                    .and_then(|sid| inner.steps.get(&(input.run_id.clone(), sid)))
                    .map(|s| s.status);
                let run = inner.run(&input.run_id)?;
                terminal_gate(run, &data, step_status)?;
                run.spec_version
            }
        };

        // Entity effect per event type.
        let mut touched_step: Option<StepId> = None;
        let mut touched_hook: Option<HookId> = None;
        let mut touched_wait: Option<String> = None;
        let mut conflicting_token: Option<String> = None;

        match &data {
            EventData::RunCreated {
                workflow_name,
                deployment_id,
                input: run_input,
                execution_context,
            } => {
                inner.runs.insert(
                    input.run_id.clone(),
                    WorkflowRun {
                        run_id: input.run_id.clone(),
                        workflow_name: workflow_name.clone(),
                        deployment_id: deployment_id.clone(),
                        spec_version,
                        status: RunStatus::Pending,
                        input: run_input.clone(),
                        output: None,
                        error: None,
                        execution_context: execution_context.clone(),
                        created_at: now,
                        started_at: None,
                        completed_at: None,
                    },
                );
            }

            EventData::RunStarted {} => {
                let run = inner.runs.get_mut(&input.run_id).expect("gated above");
                if run.status != RunStatus::Pending {
                    return Err(StoreError::conflict(
                        "run",
                        input.run_id.as_str(),
                        "already started",
                    ));
                }
                run.status = RunStatus::Running;
                run.started_at = Some(now);
            }

            EventData::RunCompleted { output } => {
                let run = inner.runs.get_mut(&input.run_id).expect("gated above");
                run.status = RunStatus::Completed;
                run.output = Some(output.clone());
                run.completed_at = Some(now);
                inner.release_run_resources(&input.run_id);
            }

            EventData::RunFailed { error } => {
                let run = inner.runs.get_mut(&input.run_id).expect("gated above");
                run.status = RunStatus::Failed;
                run.error = Some(error.clone());
                run.completed_at = Some(now);
                inner.release_run_resources(&input.run_id);
            }

            EventData::RunCancelled {} => {
                let run = inner.runs.get_mut(&input.run_id).expect("gated above");
                if run.status != RunStatus::Cancelled {
                    run.status = RunStatus::Cancelled;
                    run.completed_at = Some(now);
                    inner.release_run_resources(&input.run_id);
                }
            }

            EventData::StepCreated {
                step_name,
                input: step_input,
            } => {
                let step_id = input
                    .correlation_id
                    .as_ref()
                    .and_then(|c| c.as_step_id())
                    .ok_or_else(|| {
                        StoreError::Serialization(
                            "step_created requires a step correlation id".into(),
                        )
                    })?;
                let key = (input.run_id.clone(), step_id.clone());
                if inner.steps.contains_key(&key) {
                    return Err(StoreError::conflict(
                        "step",
                        step_id.as_str(),
                        "already exists",
                    ));
                }
                inner.steps.insert(
                    key,
                    StepRecord {
                        run_id: input.run_id.clone(),
                        step_id: step_id.clone(),
                        step_name: step_name.clone(),
                        status: StepStatus::Pending,
                        attempt: 0,
                        input: step_input.clone(),
                        output: None,
                        error: None,
                        started_at: None,
                        retry_after: None,
                        completed_at: None,
                        created_at: now,
                    },
                );
                touched_step = Some(step_id);
            }

            EventData::StepStarted {} => {
                let step = Self::step_for(&mut inner, &input.run_id, &input.correlation_id)?;
                if step.status.is_terminal() {
                    return Err(StoreError::conflict(
                        "step",
                        step.step_id.as_str(),
                        "already terminal",
                    ));
                }
                if let Some(retry_at) = step.retry_after {
                    if retry_at > now {
                        return Err(StoreError::TooEarly { retry_at });
                    }
                }
                step.attempt += 1;
                step.status = StepStatus::Running;
                step.started_at.get_or_insert(now);
                step.retry_after = None;
                touched_step = Some(step.step_id.clone());
            }

            EventData::StepCompleted { output } => {
                let step = Self::step_for(&mut inner, &input.run_id, &input.correlation_id)?;
                if step.status.is_terminal() {
                    return Err(StoreError::conflict(
                        "step",
                        step.step_id.as_str(),
                        "already terminal",
                    ));
                }
                step.status = StepStatus::Completed;
                step.output = Some(output.clone());
                step.completed_at = Some(now);
                touched_step = Some(step.step_id.clone());
            }

            EventData::StepFailed { error } => {
                let step = Self::step_for(&mut inner, &input.run_id, &input.correlation_id)?;
                if step.status.is_terminal() {
                    return Err(StoreError::conflict(
                        "step",
                        step.step_id.as_str(),
                        "already terminal",
                    ));
                }
                step.status = StepStatus::Failed;
                step.error = Some(error.clone());
                step.completed_at = Some(now);
                touched_step = Some(step.step_id.clone());
            }

            EventData::StepRetrying { error, retry_after } => {
                let step = Self::step_for(&mut inner, &input.run_id, &input.correlation_id)?;
                if step.status.is_terminal() {
                    return Err(StoreError::conflict(
                        "step",
                        step.step_id.as_str(),
                        "already terminal",
                    ));
                }
                step.status = StepStatus::Pending;
                step.error = Some(error.clone());
                step.retry_after = *retry_after;
                touched_step = Some(step.step_id.clone());
            }

            EventData::HookCreated { token, metadata } => {
                let hook_id = input
                    .correlation_id
                    .as_ref()
                    .and_then(|c| c.as_hook_id())
                    .ok_or_else(|| {
                        StoreError::Serialization(
                            "hook_created requires a hook correlation id".into(),
                        )
                    })?;
                if inner.tokens.contains_key(token) {
                    // Token collision surfaces as a hook_conflict event,
                    // not an error.
                    conflicting_token = Some(token.clone());
                } else {
                    inner
                        .tokens
                        .insert(token.clone(), (input.run_id.clone(), hook_id.clone()));
                    inner.hooks.insert(
                        (input.run_id.clone(), hook_id.clone()),
                        Hook {
                            run_id: input.run_id.clone(),
                            hook_id: hook_id.clone(),
                            token: token.clone(),
                            metadata: metadata.clone(),
                            spec_version,
                            created_at: now,
                        },
                    );
                    touched_hook = Some(hook_id);
                }
            }

            EventData::HookReceived { .. } => {
                let hook_id = input
                    .correlation_id
                    .as_ref()
                    .and_then(|c| c.as_hook_id())
                    .ok_or_else(|| {
                        StoreError::Serialization(
                            "hook_received requires a hook correlation id".into(),
                        )
                    })?;
                if !inner
                    .hooks
                    .contains_key(&(input.run_id.clone(), hook_id.clone()))
                {
                    return Err(StoreError::not_found("hook", hook_id.as_str()));
                }
                // Non-destructive: payload lives on the event row only.
                touched_hook = Some(hook_id);
            }

            EventData::HookConflict { .. } => {}

            EventData::HookDisposed {} => {
                let hook_id = input
                    .correlation_id
                    .as_ref()
                    .and_then(|c| c.as_hook_id())
                    .ok_or_else(|| {
                        StoreError::Serialization(
                            "hook_disposed requires a hook correlation id".into(),
                        )
                    })?;
                if let Some(hook) = inner.hooks.remove(&(input.run_id.clone(), hook_id)) {
                    inner.tokens.remove(&hook.token);
                }
            }

            EventData::WaitCreated { resume_at } => {
                let correlation = input.correlation_id.clone().ok_or_else(|| {
                    StoreError::Serialization("wait_created requires a correlation id".into())
                })?;
                let key = wait_key(&input.run_id, &correlation);
                inner.waits.insert(
                    key.clone(),
                    Wait {
                        wait_id: key.clone(),
                        run_id: input.run_id.clone(),
                        correlation_id: correlation,
                        status: WaitStatus::Waiting,
                        resume_at: Some(*resume_at),
                        created_at: now,
                    },
                );
                touched_wait = Some(key);
            }

            EventData::WaitCompleted {} => {
                let correlation = input.correlation_id.clone().ok_or_else(|| {
                    StoreError::Serialization("wait_completed requires a correlation id".into())
                })?;
                let key = wait_key(&input.run_id, &correlation);
                let wait = inner
                    .waits
                    .get_mut(&key)
                    .ok_or_else(|| StoreError::not_found("wait", &key))?;
                if wait.status == WaitStatus::Completed {
                    return Err(StoreError::conflict("wait", &key, "already completed"));
                }
                wait.status = WaitStatus::Completed;
                touched_wait = Some(key);
            }
        }

        if let Some(token) = conflicting_token {
            data = EventData::HookConflict { token };
        }

        // Append the event row.
        let event = Event {
            event_id: self.next_event_id()?,
            run_id: input.run_id.clone(),
            correlation_id: input.correlation_id.clone(),
            spec_version,
            data,
            created_at: now,
        };
        inner
            .events
            .entry(input.run_id.clone())
            .or_default()
            .push(event.clone());

        Ok(EventOutcome {
            run: inner.runs.get(&input.run_id).cloned(),
            step: touched_step
                .and_then(|sid| inner.steps.get(&(input.run_id.clone(), sid)).cloned()),
            hook: touched_hook
                .and_then(|hid| inner.hooks.get(&(input.run_id.clone(), hid)).cloned()),
            wait: touched_wait.and_then(|key| inner.waits.get(&key).cloned()),
            event,
        })
    }

    async fn get_run(&self, run_id: &RunId) -> Result<WorkflowRun, StoreError> {
        self.inner.read().run(run_id).cloned()
    }

    async fn list_runs(
        &self,
        filter: RunFilter,
        page: Pagination,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        let inner = self.inner.read();
        let mut runs: Vec<_> = inner
            .runs
            .values()
            .filter(|run| {
                filter.status.map_or(true, |s| run.status == s)
                    && filter
                        .workflow_name
                        .as_deref()
                        .map_or(true, |name| run.workflow_name == name)
            })
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        Ok(runs
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn get_step(&self, run_id: &RunId, step_id: &StepId) -> Result<StepRecord, StoreError> {
        self.inner
            .read()
            .steps
            .get(&(run_id.clone(), step_id.clone()))
            .cloned()
            .ok_or_else(|| StoreError::not_found("step", step_id.as_str()))
    }

    async fn list_steps(&self, run_id: &RunId) -> Result<Vec<StepRecord>, StoreError> {
        let inner = self.inner.read();
        let mut steps: Vec<_> = inner
            .steps
            .values()
            .filter(|s| &s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        Ok(steps)
    }

    async fn get_hook(&self, run_id: &RunId, hook_id: &HookId) -> Result<Hook, StoreError> {
        self.inner
            .read()
            .hooks
            .get(&(run_id.clone(), hook_id.clone()))
            .cloned()
            .ok_or_else(|| StoreError::not_found("hook", hook_id.as_str()))
    }

    async fn get_hook_by_token(&self, token: &str) -> Result<Hook, StoreError> {
        let inner = self.inner.read();
        inner
            .tokens
            .get(token)
            .and_then(|(run_id, hook_id)| inner.hooks.get(&(run_id.clone(), hook_id.clone())))
            .cloned()
            .ok_or_else(|| StoreError::not_found("hook", token))
    }

    async fn list_hooks(&self, run_id: &RunId) -> Result<Vec<Hook>, StoreError> {
        let inner = self.inner.read();
        let mut hooks: Vec<_> = inner
            .hooks
            .values()
            .filter(|h| &h.run_id == run_id)
            .cloned()
            .collect();
        hooks.sort_by(|a, b| a.hook_id.cmp(&b.hook_id));
        Ok(hooks)
    }

    async fn list_waits(&self, run_id: &RunId) -> Result<Vec<Wait>, StoreError> {
        let inner = self.inner.read();
        let mut waits: Vec<_> = inner
            .waits
            .values()
            .filter(|w| &w.run_id == run_id)
            .cloned()
            .collect();
        waits.sort_by(|a, b| a.wait_id.cmp(&b.wait_id));
        Ok(waits)
    }

    async fn list_events(
        &self,
        run_id: &RunId,
        page: EventPage,
    ) -> Result<Page<Event>, StoreError> {
        let inner = self.inner.read();
        let all = inner.events.get(run_id).cloned().unwrap_or_default();

        let filtered: Vec<Event> = match page.order {
            EventOrder::Ascending => all
                .into_iter()
                .filter(|e| page.after.as_ref().map_or(true, |c| &e.event_id > c))
                .collect(),
            EventOrder::Descending => {
                let mut items: Vec<Event> = all
                    .into_iter()
                    .filter(|e| page.after.as_ref().map_or(true, |c| &e.event_id < c))
                    .collect();
                items.reverse();
                items
            }
        };

        let has_more = filtered.len() > page.limit;
        Ok(Page {
            items: filtered.into_iter().take(page.limit).collect(),
            has_more,
        })
    }

    async fn list_events_by_correlation(
        &self,
        run_id: &RunId,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .events
            .get(run_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.correlation_id.as_ref() == Some(correlation_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::load_all_events;
    use capstan_codec::ErrorValue;

    fn run_created(run_id: &RunId) -> CreateEvent {
        CreateEvent::new(
            run_id.clone(),
            EventData::RunCreated {
                workflow_name: "workflow//./src/wf//order".into(),
                deployment_id: Some("dpl_1".into()),
                input: b"devl[2]".to_vec(),
                execution_context: None,
            },
        )
    }

    fn step_created(run_id: &RunId, step_id: &StepId) -> CreateEvent {
        CreateEvent::new(
            run_id.clone(),
            EventData::StepCreated {
                step_name: "step//./src/wf//add".into(),
                input: b"devl[1]".to_vec(),
            },
        )
        .with_correlation(step_id.clone())
    }

    async fn started_run(storage: &MemoryStorage) -> RunId {
        let run_id = RunId::generate();
        storage.create_event(run_created(&run_id)).await.unwrap();
        storage
            .create_event(CreateEvent::new(run_id.clone(), EventData::RunStarted {}))
            .await
            .unwrap();
        run_id
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let storage = MemoryStorage::new();
        let run_id = RunId::generate();

        let outcome = storage.create_event(run_created(&run_id)).await.unwrap();
        let run = outcome.run.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.spec_version, CURRENT_SPEC_VERSION);

        let outcome = storage
            .create_event(CreateEvent::new(run_id.clone(), EventData::RunStarted {}))
            .await
            .unwrap();
        let run = outcome.run.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());

        let outcome = storage
            .create_event(CreateEvent::new(
                run_id.clone(),
                EventData::RunCompleted {
                    output: b"devl[12]".to_vec(),
                },
            ))
            .await
            .unwrap();
        assert_eq!(outcome.run.unwrap().status, RunStatus::Completed);

        // No further events after terminal.
        let err = storage
            .create_event(CreateEvent::new(run_id.clone(), EventData::RunStarted {}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RunTerminal(_)));
    }

    #[tokio::test]
    async fn test_step_attempts_increase_without_gaps() {
        let storage = MemoryStorage::new();
        let run_id = started_run(&storage).await;
        let step_id = StepId::generate();

        storage
            .create_event(step_created(&run_id, &step_id))
            .await
            .unwrap();

        for expected in 1..=3 {
            let outcome = storage
                .create_event(
                    CreateEvent::new(run_id.clone(), EventData::StepStarted {})
                        .with_correlation(step_id.clone()),
                )
                .await
                .unwrap();
            assert_eq!(outcome.step.unwrap().attempt, expected);

            if expected < 3 {
                storage
                    .create_event(
                        CreateEvent::new(
                            run_id.clone(),
                            EventData::StepRetrying {
                                error: ErrorValue::new("flaky"),
                                retry_after: None,
                            },
                        )
                        .with_correlation(step_id.clone()),
                    )
                    .await
                    .unwrap();
            }
        }

        let step = storage.get_step(&run_id, &step_id).await.unwrap();
        assert_eq!(step.attempt, 3);
        // started_at was set by the first start only.
        assert!(step.started_at.is_some());
    }

    #[tokio::test]
    async fn test_step_started_too_early() {
        let storage = MemoryStorage::new();
        let run_id = started_run(&storage).await;
        let step_id = StepId::generate();

        storage
            .create_event(step_created(&run_id, &step_id))
            .await
            .unwrap();
        storage
            .create_event(
                CreateEvent::new(run_id.clone(), EventData::StepStarted {})
                    .with_correlation(step_id.clone()),
            )
            .await
            .unwrap();

        let retry_at = Utc::now() + chrono::Duration::seconds(60);
        storage
            .create_event(
                CreateEvent::new(
                    run_id.clone(),
                    EventData::StepRetrying {
                        error: ErrorValue::new("backoff"),
                        retry_after: Some(retry_at),
                    },
                )
                .with_correlation(step_id.clone()),
            )
            .await
            .unwrap();

        let err = storage
            .create_event(
                CreateEvent::new(run_id.clone(), EventData::StepStarted {})
                    .with_correlation(step_id.clone()),
            )
            .await
            .unwrap_err();
        match err {
            StoreError::TooEarly { retry_at: at } => assert_eq!(at, retry_at),
            other => panic!("expected TooEarly, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_step_terminal_at_most_once() {
        let storage = MemoryStorage::new();
        let run_id = started_run(&storage).await;
        let step_id = StepId::generate();

        storage
            .create_event(step_created(&run_id, &step_id))
            .await
            .unwrap();
        storage
            .create_event(
                CreateEvent::new(run_id.clone(), EventData::StepStarted {})
                    .with_correlation(step_id.clone()),
            )
            .await
            .unwrap();
        storage
            .create_event(
                CreateEvent::new(
                    run_id.clone(),
                    EventData::StepCompleted {
                        output: b"devl[5]".to_vec(),
                    },
                )
                .with_correlation(step_id.clone()),
            )
            .await
            .unwrap();

        // A second terminal write is rejected by the conditional update.
        let err = storage
            .create_event(
                CreateEvent::new(
                    run_id.clone(),
                    EventData::StepFailed {
                        error: ErrorValue::new("late"),
                    },
                )
                .with_correlation(step_id.clone()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_running_step_may_finish_after_run_cancelled() {
        let storage = MemoryStorage::new();
        let run_id = started_run(&storage).await;
        let step_id = StepId::generate();

        storage
            .create_event(step_created(&run_id, &step_id))
            .await
            .unwrap();
        storage
            .create_event(
                CreateEvent::new(run_id.clone(), EventData::StepStarted {})
                    .with_correlation(step_id.clone()),
            )
            .await
            .unwrap();

        storage
            .create_event(CreateEvent::new(run_id.clone(), EventData::RunCancelled {}))
            .await
            .unwrap();

        // The in-flight step still lands its completion.
        let outcome = storage
            .create_event(
                CreateEvent::new(
                    run_id.clone(),
                    EventData::StepCompleted {
                        output: b"devl[1]".to_vec(),
                    },
                )
                .with_correlation(step_id.clone()),
            )
            .await
            .unwrap();
        assert_eq!(outcome.step.unwrap().status, StepStatus::Completed);

        // But no new step may start.
        let other_step = StepId::generate();
        let err = storage
            .create_event(step_created(&run_id, &other_step))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RunTerminal(_)));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let storage = MemoryStorage::new();
        let run_id = started_run(&storage).await;

        storage
            .create_event(CreateEvent::new(run_id.clone(), EventData::RunCancelled {}))
            .await
            .unwrap();
        // Second cancel is accepted and appends another event.
        storage
            .create_event(CreateEvent::new(run_id.clone(), EventData::RunCancelled {}))
            .await
            .unwrap();

        let run = storage.get_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(storage.event_count(&run_id), 4);
    }

    #[tokio::test]
    async fn test_hook_token_conflict() {
        let storage = MemoryStorage::new();
        let run_id = started_run(&storage).await;

        let first = HookId::generate();
        let outcome = storage
            .create_event(
                CreateEvent::new(
                    run_id.clone(),
                    EventData::HookCreated {
                        token: "tok-shared".into(),
                        metadata: None,
                    },
                )
                .with_correlation(first.clone()),
            )
            .await
            .unwrap();
        assert!(outcome.hook.is_some());

        // Same token again: a hook_conflict event, not an error and not
        // a second hook.
        let second = HookId::generate();
        let outcome = storage
            .create_event(
                CreateEvent::new(
                    run_id.clone(),
                    EventData::HookCreated {
                        token: "tok-shared".into(),
                        metadata: None,
                    },
                )
                .with_correlation(second.clone()),
            )
            .await
            .unwrap();
        assert!(outcome.hook.is_none());
        assert_eq!(outcome.event.event_type(), "hook_conflict");

        let hook = storage.get_hook_by_token("tok-shared").await.unwrap();
        assert_eq!(hook.hook_id, first);
    }

    #[tokio::test]
    async fn test_run_termination_releases_hooks_and_waits() {
        let storage = MemoryStorage::new();
        let run_id = started_run(&storage).await;

        storage
            .create_event(
                CreateEvent::new(
                    run_id.clone(),
                    EventData::HookCreated {
                        token: "tok-release".into(),
                        metadata: None,
                    },
                )
                .with_correlation(HookId::generate()),
            )
            .await
            .unwrap();
        storage
            .create_event(
                CreateEvent::new(
                    run_id.clone(),
                    EventData::WaitCreated {
                        resume_at: Utc::now(),
                    },
                )
                .with_correlation(CorrelationId::new("wait_01H0000000000000000000000A")),
            )
            .await
            .unwrap();

        storage
            .create_event(CreateEvent::new(
                run_id.clone(),
                EventData::RunCompleted {
                    output: b"devl[0]".to_vec(),
                },
            ))
            .await
            .unwrap();

        assert!(storage.list_hooks(&run_id).await.unwrap().is_empty());
        assert!(storage.list_waits(&run_id).await.unwrap().is_empty());
        // The token namespace is freed for reuse by other runs.
        assert!(storage.get_hook_by_token("tok-release").await.is_err());
    }

    #[tokio::test]
    async fn test_wait_completion_conflict() {
        let storage = MemoryStorage::new();
        let run_id = started_run(&storage).await;
        let corr = CorrelationId::new("wait_01H0000000000000000000000B");

        storage
            .create_event(
                CreateEvent::new(
                    run_id.clone(),
                    EventData::WaitCreated {
                        resume_at: Utc::now(),
                    },
                )
                .with_correlation(corr.clone()),
            )
            .await
            .unwrap();

        storage
            .create_event(
                CreateEvent::new(run_id.clone(), EventData::WaitCompleted {})
                    .with_correlation(corr.clone()),
            )
            .await
            .unwrap();

        let err = storage
            .create_event(
                CreateEvent::new(run_id.clone(), EventData::WaitCompleted {})
                    .with_correlation(corr.clone()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_event_pagination_both_orders() {
        let storage = MemoryStorage::new();
        let run_id = started_run(&storage).await;
        for _ in 0..3 {
            storage
                .create_event(
                    CreateEvent::new(
                        run_id.clone(),
                        EventData::WaitCreated {
                            resume_at: Utc::now(),
                        },
                    )
                    .with_correlation(CorrelationId::new(format!(
                        "wait_{}",
                        ulid::Ulid::new()
                    ))),
                )
                .await
                .unwrap();
        }

        // Ascending, two at a time.
        let first = storage
            .list_events(
                &run_id,
                EventPage {
                    after: None,
                    limit: 2,
                    order: EventOrder::Ascending,
                },
            )
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more);

        let rest = storage
            .list_events(
                &run_id,
                EventPage {
                    after: Some(first.items.last().unwrap().event_id.clone()),
                    limit: 10,
                    order: EventOrder::Ascending,
                },
            )
            .await
            .unwrap();
        assert!(!rest.has_more);
        assert!(first.items.last().unwrap().event_id < rest.items[0].event_id);

        // Full ascending load sees a strictly ordered log.
        let all = load_all_events(&storage, &run_id).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].event_id < w[1].event_id));

        // Descending starts from the newest.
        let desc = storage
            .list_events(
                &run_id,
                EventPage {
                    after: None,
                    limit: 10,
                    order: EventOrder::Descending,
                },
            )
            .await
            .unwrap();
        assert_eq!(desc.items[0].event_id, all.last().unwrap().event_id);
    }
}
