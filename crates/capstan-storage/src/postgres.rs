//! PostgreSQL implementation of `Storage`
//!
//! Production persistence. Every `create_event` runs in one transaction:
//! the run row is locked (`FOR UPDATE`), the shared gates run against
//! the locked row, the entity effect is applied, and the event row is
//! appended. Hot-path step and wait transitions embed the status check
//! in the UPDATE predicate so a lost race surfaces as zero rows rather
//! than a second read.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};

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

/// PostgreSQL event log + entity store
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    event_ids: std::sync::Arc<Mutex<ulid::Generator>>,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            event_ids: std::sync::Arc::new(Mutex::new(ulid::Generator::new())),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn next_event_id(&self) -> Result<EventId, StoreError> {
        self.event_ids
            .lock()
            .generate()
            .map(EventId::from_ulid)
            .map_err(|e| StoreError::Unavailable(format!("event id generation: {e}")))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    error!("database error: {e}");
    StoreError::Unavailable(e.to_string())
}

fn run_from_row(row: &PgRow) -> Result<WorkflowRun, StoreError> {
    let run_id: String = row.get("run_id");
    let status: String = row.get("status");
    let error: Option<serde_json::Value> = row.get("error");

    Ok(WorkflowRun {
        run_id: RunId::parse(&run_id)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        workflow_name: row.get("workflow_name"),
        deployment_id: row.get("deployment_id"),
        spec_version: row.get("spec_version"),
        status: RunStatus::parse(&status)
            .ok_or_else(|| StoreError::Serialization(format!("bad run status `{status}`")))?,
        input: row.get("input"),
        output: row.get("output"),
        error: error
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        execution_context: row.get("execution_context"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn step_from_row(row: &PgRow) -> Result<StepRecord, StoreError> {
    let run_id: String = row.get("run_id");
    let step_id: String = row.get("step_id");
    let status: String = row.get("status");
    let error: Option<serde_json::Value> = row.get("error");

    Ok(StepRecord {
        run_id: RunId::parse(&run_id)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        step_id: StepId::parse(&step_id)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        step_name: row.get("step_name"),
        status: StepStatus::parse(&status)
            .ok_or_else(|| StoreError::Serialization(format!("bad step status `{status}`")))?,
        attempt: row.get("attempt"),
        input: row.get("input"),
        output: row.get("output"),
        error: error
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        started_at: row.get("started_at"),
        retry_after: row.get("retry_after"),
        completed_at: row.get("completed_at"),
        created_at: row.get("created_at"),
    })
}

fn hook_from_row(row: &PgRow) -> Result<Hook, StoreError> {
    let run_id: String = row.get("run_id");
    let hook_id: String = row.get("hook_id");

    Ok(Hook {
        run_id: RunId::parse(&run_id)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        hook_id: HookId::parse(&hook_id)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        token: row.get("token"),
        metadata: row.get("metadata"),
        spec_version: row.get("spec_version"),
        created_at: row.get("created_at"),
    })
}

fn wait_from_row(row: &PgRow) -> Result<Wait, StoreError> {
    let run_id: String = row.get("run_id");
    let status: String = row.get("status");
    let correlation_id: String = row.get("correlation_id");

    Ok(Wait {
        wait_id: row.get("wait_id"),
        run_id: RunId::parse(&run_id)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        correlation_id: CorrelationId::new(correlation_id),
        status: WaitStatus::parse(&status)
            .ok_or_else(|| StoreError::Serialization(format!("bad wait status `{status}`")))?,
        resume_at: row.get("resume_at"),
        created_at: row.get("created_at"),
    })
}

fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    let event_id: String = row.get("event_id");
    let run_id: String = row.get("run_id");
    let correlation_id: Option<String> = row.get("correlation_id");
    let data: serde_json::Value = row.get("event_data");

    Ok(Event {
        event_id: EventId::parse(&event_id)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        run_id: RunId::parse(&run_id)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        correlation_id: correlation_id.map(CorrelationId::new),
        spec_version: row.get("spec_version"),
        data: serde_json::from_value(data)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: row.get("created_at"),
    })
}

/// Fetch the run row under a transaction-scoped lock
async fn lock_run(
    tx: &mut Transaction<'_, Postgres>,
    run_id: &RunId,
) -> Result<Option<WorkflowRun>, StoreError> {
    let row = sqlx::query("SELECT * FROM wkf_runs WHERE run_id = $1 FOR UPDATE")
        .bind(run_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
    row.as_ref().map(run_from_row).transpose()
}

async fn fetch_step(
    tx: &mut Transaction<'_, Postgres>,
    run_id: &RunId,
    step_id: &StepId,
) -> Result<Option<StepRecord>, StoreError> {
    let row = sqlx::query("SELECT * FROM wkf_steps WHERE run_id = $1 AND step_id = $2")
        .bind(run_id.as_str())
        .bind(step_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
    row.as_ref().map(step_from_row).transpose()
}

/// Drop every hook and wait belonging to a terminated run
async fn release_run_resources(
    tx: &mut Transaction<'_, Postgres>,
    run_id: &RunId,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM wkf_hooks WHERE run_id = $1")
        .bind(run_id.as_str())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    sqlx::query("DELETE FROM wkf_waits WHERE run_id = $1")
        .bind(run_id.as_str())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(())
}

fn step_correlation(input: &CreateEvent) -> Result<StepId, StoreError> {
    input
        .correlation_id
        .as_ref()
        .and_then(|c| c.as_step_id())
        .ok_or_else(|| StoreError::Serialization("step event requires a step correlation id".into()))
}

fn hook_correlation(input: &CreateEvent) -> Result<HookId, StoreError> {
    input
        .correlation_id
        .as_ref()
        .and_then(|c| c.as_hook_id())
        .ok_or_else(|| StoreError::Serialization("hook event requires a hook correlation id".into()))
}

#[async_trait]
impl Storage for PostgresStorage {
    #[instrument(skip(self, input), fields(run_id = %input.run_id, event_type = input.data.event_type()))]
    async fn create_event(&self, input: CreateEvent) -> Result<EventOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let now = Utc::now();
        let mut data = input.data.clone();

        let mut run: Option<WorkflowRun> = None;
        let mut step: Option<StepRecord> = None;
        let mut hook: Option<Hook> = None;
        let mut wait: Option<Wait> = None;
        let mut conflicting_token: Option<String> = None;

        // Gates against the locked run row.
        let spec_version = match &data {
            EventData::RunCreated { .. } => {
                if lock_run(&mut tx, &input.run_id).await?.is_some() {
                    return Err(StoreError::conflict(
                        "run",
                        input.run_id.as_str(),
                        "already exists",
                    ));
                }
                CURRENT_SPEC_VERSION
            }
            _ => {
                let current = lock_run(&mut tx, &input.run_id)
                    .await?
                    .ok_or_else(|| StoreError::not_found("run", input.run_id.as_str()))?;
                spec_version_gate(&current)?;

                let step_status = match input.correlation_id.as_ref().and_then(|c| c.as_step_id())
                {
                    Some(step_id) => fetch_step(&mut tx, &input.run_id, &step_id)
                        .await?
                        .map(|s| s.status),
                    None => None,
                };
                terminal_gate(&current, &data, step_status)?;

                let version = current.spec_version;
                run = Some(current);
                version
            }
        };

        // Entity effect per event type.
        match &data {
            EventData::RunCreated {
                workflow_name,
                deployment_id,
                input: run_input,
                execution_context,
            } => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO wkf_runs
                        (run_id, workflow_name, deployment_id, spec_version, status,
                         input, execution_context, created_at)
                    VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
                    RETURNING *
                    "#,
                )
                .bind(input.run_id.as_str())
                .bind(workflow_name)
                .bind(deployment_id)
                .bind(spec_version)
                .bind(run_input)
                .bind(execution_context)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
                run = Some(run_from_row(&row)?);
            }

            EventData::RunStarted {} => {
                let row = sqlx::query(
                    r#"
                    UPDATE wkf_runs SET status = 'running', started_at = $2
                    WHERE run_id = $1 AND status = 'pending'
                    RETURNING *
                    "#,
                )
                .bind(input.run_id.as_str())
                .bind(now)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
                match row {
                    Some(row) => run = Some(run_from_row(&row)?),
                    None => {
                        return Err(StoreError::conflict(
                            "run",
                            input.run_id.as_str(),
                            "already started",
                        ))
                    }
                }
            }

            EventData::RunCompleted { output } => {
                let row = sqlx::query(
                    r#"
                    UPDATE wkf_runs SET status = 'completed', output = $2, completed_at = $3
                    WHERE run_id = $1
                    RETURNING *
                    "#,
                )
                .bind(input.run_id.as_str())
                .bind(output)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
                run = Some(run_from_row(&row)?);
                release_run_resources(&mut tx, &input.run_id).await?;
            }

            EventData::RunFailed { error } => {
                let error_json = serde_json::to_value(error)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                let row = sqlx::query(
                    r#"
                    UPDATE wkf_runs SET status = 'failed', error = $2, completed_at = $3
                    WHERE run_id = $1
                    RETURNING *
                    "#,
                )
                .bind(input.run_id.as_str())
                .bind(error_json)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
                run = Some(run_from_row(&row)?);
                release_run_resources(&mut tx, &input.run_id).await?;
            }

            EventData::RunCancelled {} => {
                let row = sqlx::query(
                    r#"
                    UPDATE wkf_runs SET status = 'cancelled', completed_at = $2
                    WHERE run_id = $1 AND status <> 'cancelled'
                    RETURNING *
                    "#,
                )
                .bind(input.run_id.as_str())
                .bind(now)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
                if let Some(row) = row {
                    run = Some(run_from_row(&row)?);
                    release_run_resources(&mut tx, &input.run_id).await?;
                }
                // Already cancelled: idempotent, the event still appends.
            }

            EventData::StepCreated {
                step_name,
                input: step_input,
            } => {
                let step_id = step_correlation(&input)?;
                if fetch_step(&mut tx, &input.run_id, &step_id).await?.is_some() {
                    return Err(StoreError::conflict(
                        "step",
                        step_id.as_str(),
                        "already exists",
                    ));
                }
                let row = sqlx::query(
                    r#"
                    INSERT INTO wkf_steps
                        (run_id, step_id, step_name, status, attempt, input, created_at)
                    VALUES ($1, $2, $3, 'pending', 0, $4, $5)
                    RETURNING *
                    "#,
                )
                .bind(input.run_id.as_str())
                .bind(step_id.as_str())
                .bind(step_name)
                .bind(step_input)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
                step = Some(step_from_row(&row)?);
            }

            EventData::StepStarted {} => {
                let step_id = step_correlation(&input)?;
                let current = fetch_step(&mut tx, &input.run_id, &step_id)
                    .await?
                    .ok_or_else(|| StoreError::not_found("step", step_id.as_str()))?;
                if current.status.is_terminal() {
                    return Err(StoreError::conflict(
                        "step",
                        step_id.as_str(),
                        "already terminal",
                    ));
                }
                if let Some(retry_at) = current.retry_after {
                    if retry_at > now {
                        return Err(StoreError::TooEarly { retry_at });
                    }
                }
                let row = sqlx::query(
                    r#"
                    UPDATE wkf_steps
                    SET status = 'running',
                        attempt = attempt + 1,
                        started_at = COALESCE(started_at, $3),
                        retry_after = NULL
                    WHERE run_id = $1 AND step_id = $2
                      AND status NOT IN ('completed', 'failed')
                    RETURNING *
                    "#,
                )
                .bind(input.run_id.as_str())
                .bind(step_id.as_str())
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
                step = Some(step_from_row(&row)?);
            }

            EventData::StepCompleted { output } => {
                let step_id = step_correlation(&input)?;
                let row = sqlx::query(
                    r#"
                    UPDATE wkf_steps
                    SET status = 'completed', output = $3, completed_at = $4
                    WHERE run_id = $1 AND step_id = $2
                      AND status NOT IN ('completed', 'failed')
                    RETURNING *
                    "#,
                )
                .bind(input.run_id.as_str())
                .bind(step_id.as_str())
                .bind(output)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
                match row {
                    Some(row) => step = Some(step_from_row(&row)?),
                    None => {
                        return match fetch_step(&mut tx, &input.run_id, &step_id).await? {
                            Some(_) => Err(StoreError::conflict(
                                "step",
                                step_id.as_str(),
                                "already terminal",
                            )),
                            None => Err(StoreError::not_found("step", step_id.as_str())),
                        }
                    }
                }
            }

            EventData::StepFailed { error } => {
                let step_id = step_correlation(&input)?;
                let error_json = serde_json::to_value(error)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                let row = sqlx::query(
                    r#"
                    UPDATE wkf_steps
                    SET status = 'failed', error = $3, completed_at = $4
                    WHERE run_id = $1 AND step_id = $2
                      AND status NOT IN ('completed', 'failed')
                    RETURNING *
                    "#,
                )
                .bind(input.run_id.as_str())
                .bind(step_id.as_str())
                .bind(error_json)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
                match row {
                    Some(row) => step = Some(step_from_row(&row)?),
                    None => {
                        return match fetch_step(&mut tx, &input.run_id, &step_id).await? {
                            Some(_) => Err(StoreError::conflict(
                                "step",
                                step_id.as_str(),
                                "already terminal",
                            )),
                            None => Err(StoreError::not_found("step", step_id.as_str())),
                        }
                    }
                }
            }

            EventData::StepRetrying { error, retry_after } => {
                let step_id = step_correlation(&input)?;
                let error_json = serde_json::to_value(error)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                let row = sqlx::query(
                    r#"
                    UPDATE wkf_steps
                    SET status = 'pending', error = $3, retry_after = $4
                    WHERE run_id = $1 AND step_id = $2
                      AND status NOT IN ('completed', 'failed')
                    RETURNING *
                    "#,
                )
                .bind(input.run_id.as_str())
                .bind(step_id.as_str())
                .bind(error_json)
                .bind(*retry_after)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
                match row {
                    Some(row) => step = Some(step_from_row(&row)?),
                    None => {
                        return match fetch_step(&mut tx, &input.run_id, &step_id).await? {
                            Some(_) => Err(StoreError::conflict(
                                "step",
                                step_id.as_str(),
                                "already terminal",
                            )),
                            None => Err(StoreError::not_found("step", step_id.as_str())),
                        }
                    }
                }
            }

            EventData::HookCreated { token, metadata } => {
                let hook_id = hook_correlation(&input)?;
                let existing = sqlx::query("SELECT 1 FROM wkf_hooks WHERE token = $1")
                    .bind(token)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?;
                if existing.is_some() {
                    // Token collision surfaces as a hook_conflict event,
                    // not an error.
                    conflicting_token = Some(token.clone());
                } else {
                    let row = sqlx::query(
                        r#"
                        INSERT INTO wkf_hooks
                            (run_id, hook_id, token, metadata, spec_version, created_at)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        RETURNING *
                        "#,
                    )
                    .bind(input.run_id.as_str())
                    .bind(hook_id.as_str())
                    .bind(token)
                    .bind(metadata)
                    .bind(spec_version)
                    .bind(now)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db_err)?;
                    hook = Some(hook_from_row(&row)?);
                }
            }

            EventData::HookReceived { .. } => {
                let hook_id = hook_correlation(&input)?;
                let row =
                    sqlx::query("SELECT * FROM wkf_hooks WHERE run_id = $1 AND hook_id = $2")
                        .bind(input.run_id.as_str())
                        .bind(hook_id.as_str())
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(db_err)?
                        .ok_or_else(|| StoreError::not_found("hook", hook_id.as_str()))?;
                // Non-destructive: the payload lives on the event row.
                hook = Some(hook_from_row(&row)?);
            }

            EventData::HookConflict { .. } => {}

            EventData::HookDisposed {} => {
                let hook_id = hook_correlation(&input)?;
                sqlx::query("DELETE FROM wkf_hooks WHERE run_id = $1 AND hook_id = $2")
                    .bind(input.run_id.as_str())
                    .bind(hook_id.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }

            EventData::WaitCreated { resume_at } => {
                let correlation = input.correlation_id.clone().ok_or_else(|| {
                    StoreError::Serialization("wait_created requires a correlation id".into())
                })?;
                let key = wait_key(&input.run_id, &correlation);
                let row = sqlx::query(
                    r#"
                    INSERT INTO wkf_waits
                        (wait_id, run_id, correlation_id, status, resume_at, created_at)
                    VALUES ($1, $2, $3, 'waiting', $4, $5)
                    ON CONFLICT (wait_id) DO UPDATE SET resume_at = EXCLUDED.resume_at
                    RETURNING *
                    "#,
                )
                .bind(&key)
                .bind(input.run_id.as_str())
                .bind(correlation.as_str())
                .bind(*resume_at)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
                wait = Some(wait_from_row(&row)?);
            }

            EventData::WaitCompleted {} => {
                let correlation = input.correlation_id.clone().ok_or_else(|| {
                    StoreError::Serialization("wait_completed requires a correlation id".into())
                })?;
                let key = wait_key(&input.run_id, &correlation);
                let row = sqlx::query(
                    r#"
                    UPDATE wkf_waits SET status = 'completed'
                    WHERE wait_id = $1 AND status = 'waiting'
                    RETURNING *
                    "#,
                )
                .bind(&key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
                match row {
                    Some(row) => wait = Some(wait_from_row(&row)?),
                    None => {
                        let exists = sqlx::query("SELECT 1 FROM wkf_waits WHERE wait_id = $1")
                            .bind(&key)
                            .fetch_optional(&mut *tx)
                            .await
                            .map_err(db_err)?;
                        return match exists {
                            Some(_) => {
                                Err(StoreError::conflict("wait", &key, "already completed"))
                            }
                            None => Err(StoreError::not_found("wait", &key)),
                        };
                    }
                }
            }
        }

        if let Some(token) = conflicting_token {
            data = EventData::HookConflict { token };
        }

        // Append the event row.
        let event_id = self.next_event_id()?;
        let event_data = serde_json::to_value(&data)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO wkf_events
                (event_id, run_id, correlation_id, event_type, event_data,
                 spec_version, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event_id.as_str())
        .bind(input.run_id.as_str())
        .bind(input.correlation_id.as_ref().map(|c| c.as_str()))
        .bind(data.event_type())
        .bind(&event_data)
        .bind(spec_version)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(event_id = %event_id, "appended event");

        Ok(EventOutcome {
            event: Event {
                event_id,
                run_id: input.run_id,
                correlation_id: input.correlation_id,
                spec_version,
                data,
                created_at: now,
            },
            run,
            step,
            hook,
            wait,
        })
    }

    async fn get_run(&self, run_id: &RunId) -> Result<WorkflowRun, StoreError> {
        let row = sqlx::query("SELECT * FROM wkf_runs WHERE run_id = $1")
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("run", run_id.as_str()))?;
        run_from_row(&row)
    }

    async fn list_runs(
        &self,
        filter: RunFilter,
        page: Pagination,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM wkf_runs
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::TEXT IS NULL OR workflow_name = $2)
            ORDER BY run_id DESC
            OFFSET $3 LIMIT $4
            "#,
        )
        .bind(filter.status.map(|s| s.as_str().to_string()))
        .bind(filter.workflow_name)
        .bind(page.offset as i64)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn get_step(&self, run_id: &RunId, step_id: &StepId) -> Result<StepRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM wkf_steps WHERE run_id = $1 AND step_id = $2")
            .bind(run_id.as_str())
            .bind(step_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("step", step_id.as_str()))?;
        step_from_row(&row)
    }

    async fn list_steps(&self, run_id: &RunId) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM wkf_steps WHERE run_id = $1 ORDER BY step_id")
            .bind(run_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(step_from_row).collect()
    }

    async fn get_hook(&self, run_id: &RunId, hook_id: &HookId) -> Result<Hook, StoreError> {
        let row = sqlx::query("SELECT * FROM wkf_hooks WHERE run_id = $1 AND hook_id = $2")
            .bind(run_id.as_str())
            .bind(hook_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("hook", hook_id.as_str()))?;
        hook_from_row(&row)
    }

    async fn get_hook_by_token(&self, token: &str) -> Result<Hook, StoreError> {
        let row = sqlx::query("SELECT * FROM wkf_hooks WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("hook", token))?;
        hook_from_row(&row)
    }

    async fn list_hooks(&self, run_id: &RunId) -> Result<Vec<Hook>, StoreError> {
        let rows = sqlx::query("SELECT * FROM wkf_hooks WHERE run_id = $1 ORDER BY hook_id")
            .bind(run_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(hook_from_row).collect()
    }

    async fn list_waits(&self, run_id: &RunId) -> Result<Vec<Wait>, StoreError> {
        let rows = sqlx::query("SELECT * FROM wkf_waits WHERE run_id = $1 ORDER BY wait_id")
            .bind(run_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(wait_from_row).collect()
    }

    async fn list_events(
        &self,
        run_id: &RunId,
        page: EventPage,
    ) -> Result<Page<Event>, StoreError> {
        let limit = page.limit as i64;
        let rows = match page.order {
            EventOrder::Ascending => {
                sqlx::query(
                    r#"
                    SELECT * FROM wkf_events
                    WHERE run_id = $1 AND ($2::TEXT IS NULL OR event_id > $2)
                    ORDER BY event_id ASC
                    LIMIT $3
                    "#,
                )
                .bind(run_id.as_str())
                .bind(page.after.as_ref().map(|e| e.as_str().to_string()))
                .bind(limit + 1)
                .fetch_all(&self.pool)
                .await
            }
            EventOrder::Descending => {
                sqlx::query(
                    r#"
                    SELECT * FROM wkf_events
                    WHERE run_id = $1 AND ($2::TEXT IS NULL OR event_id < $2)
                    ORDER BY event_id DESC
                    LIMIT $3
                    "#,
                )
                .bind(run_id.as_str())
                .bind(page.after.as_ref().map(|e| e.as_str().to_string()))
                .bind(limit + 1)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;

        let has_more = rows.len() > page.limit;
        rows.iter()
            .take(page.limit)
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map(|items| Page { items, has_more })
    }

    async fn list_events_by_correlation(
        &self,
        run_id: &RunId,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM wkf_events
            WHERE run_id = $1 AND correlation_id = $2
            ORDER BY event_id ASC
            "#,
        )
        .bind(run_id.as_str())
        .bind(correlation_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }
}
