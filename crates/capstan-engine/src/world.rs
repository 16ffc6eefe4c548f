//! The `World` infrastructure seam
//!
//! A world supplies everything the engine needs from its surroundings:
//! durable queues with per-message delay and idempotency keys, the
//! event/entity store, the stream store, and the payload encryption
//! keys. Production worlds adapt cloud queues behind this trait; the
//! in-process [`LocalWorld`](crate::LocalWorld) backs tests and
//! single-node deployments.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use capstan_codec::PayloadEncryption;
use capstan_storage::{RunId, StepId, Storage, StreamStore};

use crate::error::EngineError;

/// Options for publishing one queue message
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub deployment_id: Option<String>,

    /// Duplicate keys are treated as success: the prior delivery
    /// persists the intended effect.
    pub idempotency_key: Option<String>,

    /// Delay before first delivery
    pub delay: Option<Duration>,

    pub headers: Vec<(String, String)>,
}

impl QueueOptions {
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// What a queue handler tells the backend to do with the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Done; drop the message
    Ack,
    /// Redeliver after the given pause (clamped to the backend ceiling)
    Defer { timeout: Duration },
}

/// Consumer mounted over a queue name prefix
#[async_trait]
pub trait QueueHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        queue_name: &str,
        payload: Vec<u8>,
    ) -> Result<HandlerOutcome, EngineError>;
}

/// World-level tunables
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Ceiling for a single redelivery defer; longer pauses chain
    /// delayed messages instead. Queue-backend specific.
    pub max_defer: Duration,

    /// Deployment this process serves
    pub deployment_id: String,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            // 23 hours, below common queue visibility ceilings.
            max_defer: Duration::from_secs(82_800),
            deployment_id: "local".to_string(),
        }
    }
}

impl WorldConfig {
    /// Clamp a requested defer to the backend ceiling (and ≥ 1 s so a
    /// hot message never spins).
    pub fn clamp_defer(&self, requested: Duration) -> Duration {
        requested.max(Duration::from_secs(1)).min(self.max_defer)
    }
}

/// Infrastructure adapter the engine runs against
#[async_trait]
pub trait World: Send + Sync + 'static {
    fn storage(&self) -> Arc<dyn Storage>;

    fn streams(&self) -> Arc<dyn StreamStore>;

    /// Payload encryption keys, when configured for this deployment
    fn encryption(&self) -> Option<PayloadEncryption> {
        None
    }

    fn config(&self) -> &WorldConfig;

    /// Publish a durable message
    async fn queue(
        &self,
        queue_name: &str,
        payload: Vec<u8>,
        options: QueueOptions,
    ) -> Result<(), EngineError>;

    /// Mount a consumer over every queue whose name starts with `prefix`
    fn create_queue_handler(&self, prefix: &str, handler: Arc<dyn QueueHandler>);
}

/// Distributed-trace carrier propagated through queue messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceCarrier {
    pub trace_id: String,
    pub span_id: String,
    pub trace_flags: u8,
}

/// Body of a workflow continuation message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowQueueMessage {
    pub run_id: RunId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_carrier: Option<TraceCarrier>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
}

/// Body of a step invocation message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepQueueMessage {
    pub workflow_name: String,
    pub workflow_run_id: RunId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_started_at: Option<DateTime<Utc>>,

    pub step_id: StepId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_carrier: Option<TraceCarrier>,

    pub requested_at: DateTime<Utc>,
}

/// Body of a health-check probe message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckMessage {
    pub correlation_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_defer() {
        let config = WorldConfig::default();
        assert_eq!(
            config.clamp_defer(Duration::from_millis(10)),
            Duration::from_secs(1)
        );
        assert_eq!(
            config.clamp_defer(Duration::from_secs(30)),
            Duration::from_secs(30)
        );
        assert_eq!(
            config.clamp_defer(Duration::from_secs(1_000_000)),
            config.max_defer
        );
    }

    #[test]
    fn test_message_round_trips() {
        let msg = WorkflowQueueMessage {
            run_id: RunId::generate(),
            trace_carrier: Some(TraceCarrier {
                trace_id: "t".into(),
                span_id: "s".into(),
                trace_flags: 1,
            }),
            requested_at: None,
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let parsed: WorkflowQueueMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.run_id, msg.run_id);
        assert_eq!(parsed.trace_carrier, msg.trace_carrier);
    }
}
