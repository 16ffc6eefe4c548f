//! Shared transition guards
//!
//! Both backends funnel every `create_event` through these checks so the
//! spec-version and terminal-state invariants hold identically in memory
//! and in Postgres.

use crate::event::EventData;
use crate::model::{
    RunStatus, StepStatus, WorkflowRun, CURRENT_SPEC_VERSION, MIN_SUPPORTED_SPEC_VERSION,
};
use crate::store::StoreError;

/// Reject runs persisted by engines we no longer (or don't yet) speak for
pub fn spec_version_gate(run: &WorkflowRun) -> Result<(), StoreError> {
    if run.spec_version < MIN_SUPPORTED_SPEC_VERSION {
        return Err(StoreError::UnsupportedSpecVersion {
            run_id: run.run_id.clone(),
            spec_version: run.spec_version,
        });
    }
    if run.spec_version > CURRENT_SPEC_VERSION {
        return Err(StoreError::RequiresNewerRuntime {
            run_id: run.run_id.clone(),
            spec_version: run.spec_version,
        });
    }
    Ok(())
}

/// Enforce the no-events-after-terminal invariant.
///
/// Two allowances survive a terminal run: `run_cancelled` on an
/// already-cancelled run (idempotent), and a terminal step event for a
/// step that was still running when the run terminated.
pub fn terminal_gate(
    run: &WorkflowRun,
    data: &EventData,
    step_status: Option<StepStatus>,
) -> Result<(), StoreError> {
    if !run.status.is_terminal() {
        return Ok(());
    }

    match data {
        EventData::RunCancelled {} if run.status == RunStatus::Cancelled => Ok(()),
        EventData::StepCompleted { .. } | EventData::StepFailed { .. }
            if step_status == Some(StepStatus::Running) =>
        {
            Ok(())
        }
        _ => Err(StoreError::RunTerminal(run.run_id.clone())),
    }
}
