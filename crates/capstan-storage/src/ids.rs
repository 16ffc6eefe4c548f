//! Prefixed ULID identifiers
//!
//! Every engine entity is identified by a `<prefix>_<26-char ULID>`
//! string. ULIDs are lexicographically ordered by creation time, so
//! event ids double as pagination keys and run/step ids sort by age.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

const ULID_LEN: usize = 26;

/// Error parsing a prefixed identifier
#[derive(Debug, thiserror::Error)]
#[error("invalid {expected} id: `{value}`")]
pub struct IdParseError {
    pub expected: &'static str,
    pub value: String,
}

macro_rules! prefixed_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Generate a fresh id from the current time
            pub fn generate() -> Self {
                Self::from_ulid(Ulid::new())
            }

            /// Build an id from an existing ULID (deterministic contexts)
            pub fn from_ulid(ulid: Ulid) -> Self {
                Self(format!(concat!($prefix, "_{}"), ulid))
            }

            /// Parse and validate a string form
            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                let rest = value
                    .strip_prefix(concat!($prefix, "_"))
                    .filter(|rest| rest.len() == ULID_LEN)
                    .ok_or_else(|| IdParseError {
                        expected: $prefix,
                        value: value.to_string(),
                    })?;
                Ulid::from_string(rest).map_err(|_| IdParseError {
                    expected: $prefix,
                    value: value.to_string(),
                })?;
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

prefixed_id!(
    /// Identifier of one workflow run (`wrun_<ULID>`)
    RunId,
    "wrun"
);

prefixed_id!(
    /// Identifier of one event row (`wevt_<ULID>`); the pagination key
    EventId,
    "wevt"
);

prefixed_id!(
    /// Identifier of one step within a run (`step_<ULID>`)
    StepId,
    "step"
);

prefixed_id!(
    /// Identifier of one hook within a run (`hook_<ULID>`)
    HookId,
    "hook"
);

/// Correlation id tying events to a step, hook, or wait.
///
/// Step correlations are the step id itself; hook correlations the hook
/// id; wait correlations carry a `wait_` prefix. Assigned
/// deterministically by the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Step correlations reuse the step id
    pub fn as_step_id(&self) -> Option<StepId> {
        StepId::parse(&self.0).ok()
    }

    pub fn as_hook_id(&self) -> Option<HookId> {
        HookId::parse(&self.0).ok()
    }

    pub fn is_wait(&self) -> bool {
        self.0.starts_with("wait_")
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<StepId> for CorrelationId {
    fn from(id: StepId) -> Self {
        Self(id.into())
    }
}

impl From<HookId> for CorrelationId {
    fn from(id: HookId) -> Self {
        Self(id.into())
    }
}

/// Composite wait key: `<run_id>||<correlation_id>`
pub fn wait_key(run_id: &RunId, correlation_id: &CorrelationId) -> String {
    format!("{run_id}||{correlation_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_parse() {
        let id = RunId::generate();
        assert!(id.as_str().starts_with("wrun_"));
        assert_eq!(RunId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_wrong_prefix() {
        let step = StepId::generate();
        assert!(RunId::parse(step.as_str()).is_err());
        assert!(RunId::parse("wrun_short").is_err());
        assert!(RunId::parse("wrun_!!!!!!!!!!!!!!!!!!!!!!!!!!").is_err());
    }

    #[test]
    fn test_event_ids_sort_by_creation() {
        let a = EventId::from_ulid(Ulid::from_parts(1_000, 7));
        let b = EventId::from_ulid(Ulid::from_parts(2_000, 0));
        assert!(a < b);
    }

    #[test]
    fn test_correlation_round_trip() {
        let step = StepId::generate();
        let corr = CorrelationId::from(step.clone());
        assert_eq!(corr.as_step_id(), Some(step));
        assert!(!corr.is_wait());
        assert!(CorrelationId::new("wait_01H00000000000000000000000").is_wait());
    }
}
