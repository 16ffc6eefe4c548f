//! The `Storage` contract
//!
//! `create_event` is the only mutation: it validates the run's spec
//! version and terminal-state invariants, applies the derived entity
//! effect for the event type, appends the event row, and returns the
//! resulting entity state so callers avoid a second read. Rejections
//! carry the ordering semantics the executors key off (409/410/425).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::event::{Event, EventData};
use crate::ids::{CorrelationId, EventId, HookId, RunId, StepId};
use crate::model::{Hook, RunStatus, StepRecord, Wait, WorkflowRun};

/// Error type for store operations.
///
/// The first five variants are ordering signals, not faults; executors
/// translate them into ack/defer decisions.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Entity does not exist (404)
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Entity already reached a state that rejects this event (409)
    #[error("conflict on {entity} {id}: {reason}")]
    Conflict {
        entity: &'static str,
        id: String,
        reason: String,
    },

    /// The run is terminal and this work is moot (410)
    #[error("run {0} is terminal")]
    RunTerminal(RunId),

    /// Step attempted before its retry_after (425)
    #[error("too early; retry at {retry_at}")]
    TooEarly { retry_at: DateTime<Utc> },

    /// Upstream throttling (429)
    #[error("throttled; retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    /// Persisted run predates the oldest supported spec version
    #[error("run {run_id} has unsupported spec version {spec_version}")]
    UnsupportedSpecVersion { run_id: RunId, spec_version: i32 },

    /// Persisted run requires a newer engine
    #[error("run {run_id} requires a newer runtime (spec version {spec_version})")]
    RequiresNewerRuntime { run_id: RunId, spec_version: i32 },

    /// Transient backend failure (5xx); safe to retry
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Row contents did not round-trip
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn conflict(entity: &'static str, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            entity,
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// True when queue redelivery may eventually succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Throttled { .. })
    }

    /// The HTTP-ish status class this error maps to
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::RunTerminal(_) => 410,
            Self::TooEarly { .. } => 425,
            Self::Throttled { .. } => 429,
            Self::UnsupportedSpecVersion { .. } | Self::RequiresNewerRuntime { .. } => 422,
            Self::Unavailable(_) => 503,
            Self::Serialization(_) => 500,
        }
    }
}

/// Input to `create_event`
#[derive(Debug, Clone)]
pub struct CreateEvent {
    pub run_id: RunId,
    pub correlation_id: Option<CorrelationId>,
    pub data: EventData,
}

impl CreateEvent {
    pub fn new(run_id: RunId, data: EventData) -> Self {
        Self {
            run_id,
            correlation_id: None,
            data,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// The entity state resulting from an event append
#[derive(Debug, Clone)]
pub struct EventOutcome {
    pub event: Event,
    pub run: Option<WorkflowRun>,
    pub step: Option<StepRecord>,
    pub hook: Option<Hook>,
    pub wait: Option<Wait>,
}

/// Event pagination order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrder {
    /// Required for replay
    Ascending,
    /// Observability reads
    Descending,
}

/// Keyset pagination over events
#[derive(Debug, Clone)]
pub struct EventPage {
    /// Exclusive cursor: events strictly after (ascending) or before
    /// (descending) this id
    pub after: Option<EventId>,
    pub limit: usize,
    pub order: EventOrder,
}

impl Default for EventPage {
    fn default() -> Self {
        Self {
            after: None,
            limit: 100,
            order: EventOrder::Ascending,
        }
    }
}

/// One page of results
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

/// Filter for listing runs
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub workflow_name: Option<String>,
}

/// Offset pagination for entity listings
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Event log plus derived entity store.
///
/// Implementations must be thread-safe; concurrent `create_event` calls
/// for the same run are serialized by the backend, and conditional
/// state transitions make duplicate appends commutative-or-rejected.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Append an event, applying its entity effect atomically.
    async fn create_event(&self, input: CreateEvent) -> Result<EventOutcome, StoreError>;

    async fn get_run(&self, run_id: &RunId) -> Result<WorkflowRun, StoreError>;

    async fn list_runs(
        &self,
        filter: RunFilter,
        page: Pagination,
    ) -> Result<Vec<WorkflowRun>, StoreError>;

    async fn get_step(&self, run_id: &RunId, step_id: &StepId) -> Result<StepRecord, StoreError>;

    async fn list_steps(&self, run_id: &RunId) -> Result<Vec<StepRecord>, StoreError>;

    async fn get_hook(&self, run_id: &RunId, hook_id: &HookId) -> Result<Hook, StoreError>;

    /// Resolve a live hook by its external token
    async fn get_hook_by_token(&self, token: &str) -> Result<Hook, StoreError>;

    async fn list_hooks(&self, run_id: &RunId) -> Result<Vec<Hook>, StoreError>;

    async fn list_waits(&self, run_id: &RunId) -> Result<Vec<Wait>, StoreError>;

    async fn list_events(
        &self,
        run_id: &RunId,
        page: EventPage,
    ) -> Result<Page<Event>, StoreError>;

    async fn list_events_by_correlation(
        &self,
        run_id: &RunId,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<Event>, StoreError>;
}

/// Load every event for a run in ascending order, paginating until the
/// log is exhausted. This is the replay read path.
pub async fn load_all_events<S: Storage + ?Sized>(
    storage: &S,
    run_id: &RunId,
) -> Result<Vec<Event>, StoreError> {
    let mut events = Vec::new();
    let mut after: Option<EventId> = None;

    loop {
        let page = storage
            .list_events(
                run_id,
                EventPage {
                    after: after.clone(),
                    limit: 500,
                    order: EventOrder::Ascending,
                },
            )
            .await?;

        after = page.items.last().map(|e| e.event_id.clone());
        let has_more = page.has_more;
        events.extend(page.items);

        if !has_more {
            return Ok(events);
        }
    }
}
