//! Engine error types and step failure classes

use chrono::{DateTime, Utc};

use capstan_codec::{DeserializationError, ErrorValue, SerializationError};
use capstan_storage::{StoreError, StreamError};

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialize(#[from] SerializationError),

    #[error("deserialization error: {0}")]
    Deserialize(#[from] DeserializationError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("queue error: {0}")]
    Queue(String),

    /// Event log corruption detected during replay; fails the run and is
    /// not catchable by workflow code
    #[error("workflow runtime error: {0}")]
    Runtime(String),
}

/// How a step failure propagates
#[derive(Debug, Clone, PartialEq)]
pub enum StepFailureKind {
    /// Non-retryable; fails the step immediately
    Fatal,
    /// User-controlled backoff; `retry_after` pins the next attempt
    Retryable { retry_after: Option<DateTime<Utc>> },
    /// Default retry policy (1 s delay until the budget exhausts)
    Generic,
}

/// A step's thrown error plus its retry class
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub error: ErrorValue,
    pub kind: StepFailureKind,
}

impl StepFailure {
    /// Non-retryable failure; the workflow may catch it
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            error: ErrorValue::new(message),
            kind: StepFailureKind::Fatal,
        }
    }

    /// Retryable with the default 1 s delay
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            error: ErrorValue::new(message),
            kind: StepFailureKind::Retryable { retry_after: None },
        }
    }

    /// Retryable no earlier than `retry_after`
    pub fn retry_after(message: impl Into<String>, retry_after: DateTime<Utc>) -> Self {
        Self {
            error: ErrorValue::new(message),
            kind: StepFailureKind::Retryable {
                retry_after: Some(retry_after),
            },
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error.message)
    }
}

impl std::error::Error for StepFailure {}

impl From<ErrorValue> for StepFailure {
    fn from(error: ErrorValue) -> Self {
        Self {
            error,
            kind: StepFailureKind::Generic,
        }
    }
}

impl From<anyhow::Error> for StepFailure {
    fn from(err: anyhow::Error) -> Self {
        Self {
            error: ErrorValue::new(err.to_string()),
            kind: StepFailureKind::Generic,
        }
    }
}

/// The error a step proxy rejects with inside the workflow.
///
/// By the time a failure reaches the workflow the step has exhausted its
/// own retry budget, so it is always fatal from the workflow's
/// perspective; the workflow may still catch it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error}")]
pub struct FatalError {
    pub error: ErrorValue,
}

impl FatalError {
    pub fn new(error: ErrorValue) -> Self {
        Self { error }
    }

    pub fn message(&self) -> &str {
        &self.error.message
    }
}

impl From<FatalError> for ErrorValue {
    fn from(err: FatalError) -> Self {
        err.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_constructors() {
        assert_eq!(StepFailure::fatal("boom").kind, StepFailureKind::Fatal);
        assert_eq!(
            StepFailure::retryable("flaky").kind,
            StepFailureKind::Retryable { retry_after: None }
        );
        let at = Utc::now();
        assert_eq!(
            StepFailure::retry_after("backoff", at).kind,
            StepFailureKind::Retryable {
                retry_after: Some(at)
            }
        );
    }

    #[test]
    fn test_fatal_error_propagates_with_question_mark() {
        fn workflow_body() -> Result<(), ErrorValue> {
            let failed: Result<(), FatalError> =
                Err(FatalError::new(ErrorValue::new("boom").with_code("E_STEP")));
            failed?;
            Ok(())
        }
        let err = workflow_body().unwrap_err();
        assert_eq!(err.message, "boom");
        assert_eq!(err.code.as_deref(), Some("E_STEP"));
    }
}
