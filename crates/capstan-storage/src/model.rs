//! Derived entity rows
//!
//! These rows are a materialized cache over the event log, updated
//! synchronously in the same transaction as each event append. The log
//! owns truth; every row is the fold of the events sharing its id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use capstan_codec::ErrorValue;

use crate::ids::{CorrelationId, HookId, RunId, StepId};

/// Current spec version written to new runs and events
pub const CURRENT_SPEC_VERSION: i32 = 2;

/// Oldest persisted spec version this engine still accepts
pub const MIN_SUPPORTED_SPEC_VERSION: i32 = 2;

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wait lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStatus {
    Waiting,
    Completed,
}

impl WaitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution instance of a workflow
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub workflow_name: String,
    pub deployment_id: Option<String>,
    pub spec_version: i32,
    pub status: RunStatus,
    /// Dehydrated workflow arguments
    pub input: Vec<u8>,
    /// Dehydrated return value, set on completion
    pub output: Option<Vec<u8>>,
    /// Structured error, set on failure
    pub error: Option<ErrorValue>,
    /// Opaque bag (trace carrier and friends)
    pub execution_context: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One step invocation within a run
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub run_id: RunId,
    pub step_id: StepId,
    /// Symbolic step identifier (`step//<module>//<function>`)
    pub step_name: String,
    pub status: StepStatus,
    /// Attempt counter, incremented by each `step_started`
    pub attempt: i32,
    pub input: Vec<u8>,
    pub output: Option<Vec<u8>>,
    pub error: Option<ErrorValue>,
    /// Set on the first `step_started` only
    pub started_at: Option<DateTime<Utc>>,
    /// Earliest time the next attempt may start
    pub retry_after: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// External-signal correlation token
#[derive(Debug, Clone, PartialEq)]
pub struct Hook {
    pub run_id: RunId,
    pub hook_id: HookId,
    /// Globally unique match token for external callers
    pub token: String,
    pub metadata: Option<Vec<u8>>,
    pub spec_version: i32,
    pub created_at: DateTime<Utc>,
}

/// A timed or externally-completable pause
#[derive(Debug, Clone, PartialEq)]
pub struct Wait {
    /// Composite key `<run_id>||<correlation_id>`
    pub wait_id: String,
    pub run_id: RunId,
    pub correlation_id: CorrelationId,
    pub status: WaitStatus,
    pub resume_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("nope"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
    }
}
