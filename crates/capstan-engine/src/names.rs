//! Symbolic identifiers and queue name conventions
//!
//! Workflows, steps, and classes are identified by strings shaped
//! `prefix//moduleSpecifier//functionName`. The module specifier is a
//! package identifier (`mypkg@1.0.0`, `@scope/pkg@2.0.0`) or a relative
//! path (`./src/jobs/order`). Function names may nest with `/`, carry
//! `.` for static methods, `#` for instance methods, and `default` for
//! default exports.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Queue carrying workflow continuations for one workflow name
pub const WORKFLOW_QUEUE_PREFIX: &str = "__wkf_workflow_";

/// Queue carrying step invocations for one step name
pub const STEP_QUEUE_PREFIX: &str = "__wkf_step_";

/// Dedicated health-probe queues
pub const WORKFLOW_HEALTH_QUEUE: &str = "__wkf_workflow_health_check";
pub const STEP_HEALTH_QUEUE: &str = "__wkf_step_health_check";

/// One-shot stream a health-check handler answers into
pub fn health_check_stream(correlation_id: &str) -> String {
    format!("__health_check__{correlation_id}")
}

pub fn workflow_queue(workflow_name: &str) -> String {
    format!("{WORKFLOW_QUEUE_PREFIX}{workflow_name}")
}

pub fn step_queue(step_name: &str) -> String {
    format!("{STEP_QUEUE_PREFIX}{step_name}")
}

/// Identifier namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamePrefix {
    Workflow,
    Step,
    Class,
}

impl NamePrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Step => "step",
            Self::Class => "class",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "workflow" => Some(Self::Workflow),
            "step" => Some(Self::Step),
            "class" => Some(Self::Class),
            _ => None,
        }
    }
}

/// Error parsing a symbolic name
#[derive(Debug, thiserror::Error)]
#[error("invalid symbolic name `{0}`")]
pub struct NameError(pub String);

/// A parsed `prefix//module//function` identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolicName {
    pub prefix: NamePrefix,
    pub module: String,
    pub function: String,
}

impl SymbolicName {
    pub fn workflow(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            prefix: NamePrefix::Workflow,
            module: module.into(),
            function: function.into(),
        }
    }

    pub fn step(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            prefix: NamePrefix::Step,
            module: module.into(),
            function: function.into(),
        }
    }

    pub fn class(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            prefix: NamePrefix::Class,
            module: module.into(),
            function: function.into(),
        }
    }

    pub fn parse(value: &str) -> Result<Self, NameError> {
        let mut parts = value.splitn(3, "//");
        let prefix = parts
            .next()
            .and_then(NamePrefix::parse)
            .ok_or_else(|| NameError(value.to_string()))?;
        let module = parts.next().ok_or_else(|| NameError(value.to_string()))?;
        let function = parts.next().ok_or_else(|| NameError(value.to_string()))?;

        if module.is_empty() || function.is_empty() {
            return Err(NameError(value.to_string()));
        }
        if !is_valid_module(module) {
            return Err(NameError(value.to_string()));
        }

        Ok(Self {
            prefix,
            module: module.to_string(),
            function: function.to_string(),
        })
    }

    /// Display name: the function, or the module's short name for
    /// default exports.
    pub fn short_name(&self) -> &str {
        if self.function == "default" {
            module_short_name(&self.module)
        } else {
            &self.function
        }
    }
}

impl fmt::Display for SymbolicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}//{}//{}", self.prefix.as_str(), self.module, self.function)
    }
}

/// Module specifiers are package ids (`name@version`, `@scope/pkg@version`)
/// or relative paths (`./…`).
fn is_valid_module(module: &str) -> bool {
    if module.starts_with("./") || module.starts_with("../") {
        return true;
    }
    // Package form: the version separator is the last `@` (scoped
    // packages start with one).
    match module.rfind('@') {
        Some(0) | None => false,
        Some(at) => !module[at + 1..].is_empty(),
    }
}

/// Last path segment of the module, without any version suffix
fn module_short_name(module: &str) -> &str {
    let without_version = match module.rfind('@') {
        Some(at) if at > 0 => &module[..at],
        _ => module,
    };
    without_version
        .rsplit('/')
        .next()
        .unwrap_or(without_version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relative_path_name() {
        let name = SymbolicName::parse("step//./src/jobs/order//charge").unwrap();
        assert_eq!(name.prefix, NamePrefix::Step);
        assert_eq!(name.module, "./src/jobs/order");
        assert_eq!(name.function, "charge");
        assert_eq!(name.to_string(), "step//./src/jobs/order//charge");
    }

    #[test]
    fn test_parse_package_names() {
        assert!(SymbolicName::parse("workflow//mypkg@1.0.0//run").is_ok());
        assert!(SymbolicName::parse("class//@scope/pkg@2.0.0//Money").is_ok());
        // Missing version.
        assert!(SymbolicName::parse("workflow//mypkg//run").is_err());
        // Bare scope marker.
        assert!(SymbolicName::parse("workflow//@//run").is_err());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(SymbolicName::parse("nope//./a//b").is_err());
        assert!(SymbolicName::parse("step//./a").is_err());
        assert!(SymbolicName::parse("step").is_err());
    }

    #[test]
    fn test_nested_function_names() {
        let name = SymbolicName::parse("step//./src/api//handlers/retry.run").unwrap();
        assert_eq!(name.function, "handlers/retry.run");
        assert_eq!(name.short_name(), "handlers/retry.run");
    }

    #[test]
    fn test_default_export_short_name() {
        let name = SymbolicName::parse("workflow//./src/jobs/order//default").unwrap();
        assert_eq!(name.short_name(), "order");

        let scoped = SymbolicName::parse("workflow//@scope/pkg@2.0.0//default").unwrap();
        assert_eq!(scoped.short_name(), "pkg");
    }

    #[test]
    fn test_queue_names() {
        assert_eq!(
            workflow_queue("workflow//./src/wf//order"),
            "__wkf_workflow_workflow//./src/wf//order"
        );
        assert!(step_queue("x").starts_with(STEP_QUEUE_PREFIX));
        assert!(WORKFLOW_HEALTH_QUEUE.starts_with(WORKFLOW_QUEUE_PREFIX));
        assert!(STEP_HEALTH_QUEUE.starts_with(STEP_QUEUE_PREFIX));
        assert_eq!(health_check_stream("abc"), "__health_check__abc");
    }
}
