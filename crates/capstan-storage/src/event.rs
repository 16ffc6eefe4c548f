//! Event rows and typed event payloads
//!
//! Events are append-only and totally ordered per run by `event_id`.
//! Each entity row is the fold of the events sharing its correlation
//! id. Payload blobs inside `EventData` are dehydrated codec envelopes,
//! carried as base64 on the wire. Unknown extra fields on incoming
//! event data are accepted forward-compatibly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use capstan_codec::ErrorValue;

use crate::ids::{CorrelationId, EventId, RunId};

/// One persisted event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub spec_version: i32,
    #[serde(flatten)]
    pub data: EventData,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        self.data.event_type()
    }
}

/// Type-specific event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventData {
    RunCreated {
        workflow_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deployment_id: Option<String>,
        #[serde(with = "blob")]
        input: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_context: Option<serde_json::Value>,
    },
    RunStarted {},
    RunCompleted {
        #[serde(with = "blob")]
        output: Vec<u8>,
    },
    RunFailed {
        error: ErrorValue,
    },
    RunCancelled {},
    StepCreated {
        step_name: String,
        #[serde(with = "blob")]
        input: Vec<u8>,
    },
    StepStarted {},
    StepCompleted {
        #[serde(with = "blob")]
        output: Vec<u8>,
    },
    StepFailed {
        error: ErrorValue,
    },
    StepRetrying {
        error: ErrorValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after: Option<DateTime<Utc>>,
    },
    HookCreated {
        token: String,
        #[serde(default, with = "opt_blob", skip_serializing_if = "Option::is_none")]
        metadata: Option<Vec<u8>>,
    },
    HookReceived {
        #[serde(with = "blob")]
        payload: Vec<u8>,
    },
    HookConflict {
        token: String,
    },
    HookDisposed {},
    WaitCreated {
        resume_at: DateTime<Utc>,
    },
    WaitCompleted {},
}

impl EventData {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunCreated { .. } => "run_created",
            Self::RunStarted {} => "run_started",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled {} => "run_cancelled",
            Self::StepCreated { .. } => "step_created",
            Self::StepStarted {} => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepRetrying { .. } => "step_retrying",
            Self::HookCreated { .. } => "hook_created",
            Self::HookReceived { .. } => "hook_received",
            Self::HookConflict { .. } => "hook_conflict",
            Self::HookDisposed {} => "hook_disposed",
            Self::WaitCreated { .. } => "wait_created",
            Self::WaitCompleted {} => "wait_completed",
        }
    }

    /// True for the events that end a run
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled {}
        )
    }

    /// True for the events that end a step
    pub fn is_step_terminal(&self) -> bool {
        matches!(self, Self::StepCompleted { .. } | Self::StepFailed { .. })
    }
}

/// Base64 transport for payload blobs inside JSON event data
mod blob {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Base64 transport for optional payload blobs
mod opt_blob {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| BASE64.decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
