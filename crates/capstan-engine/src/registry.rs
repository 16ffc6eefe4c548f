//! Workflow and step registries
//!
//! Registrations are explicit and happen at construction time: the
//! registries are built from statically declared descriptors and are
//! read-only once the runtime starts. The same symbolic names drive
//! queue naming and the codec's step-reference encoding.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use capstan_codec::{CodecValue, ErrorValue};

use crate::context::{StepCtx, WorkflowCtx};
use crate::error::StepFailure;
use crate::names::SymbolicName;

/// Default retry budget: up to four total attempts
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Type-erased workflow function
pub type WorkflowFn =
    Arc<dyn Fn(WorkflowCtx) -> BoxFuture<'static, Result<CodecValue, ErrorValue>> + Send + Sync>;

/// Type-erased step function
pub type StepFn =
    Arc<dyn Fn(StepCtx) -> BoxFuture<'static, Result<CodecValue, StepFailure>> + Send + Sync>;

/// A registered workflow
#[derive(Clone)]
pub struct WorkflowDescriptor {
    pub name: SymbolicName,
    pub func: WorkflowFn,
}

impl WorkflowDescriptor {
    pub fn new<F, Fut>(name: SymbolicName, func: F) -> Self
    where
        F: Fn(WorkflowCtx) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<CodecValue, ErrorValue>> + Send + 'static,
    {
        Self {
            name,
            func: Arc::new(move |ctx| Box::pin(func(ctx))),
        }
    }
}

/// A registered step
#[derive(Clone)]
pub struct StepDescriptor {
    pub name: SymbolicName,
    /// `0` means run once; `n` allows `n + 1` total attempts
    pub max_retries: u32,
    pub func: StepFn,
}

impl StepDescriptor {
    pub fn new<F, Fut>(name: SymbolicName, func: F) -> Self
    where
        F: Fn(StepCtx) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<CodecValue, StepFailure>> + Send + 'static,
    {
        Self {
            name,
            max_retries: DEFAULT_MAX_RETRIES,
            func: Arc::new(move |ctx| Box::pin(func(ctx))),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Registry of workflow descriptors, keyed by symbolic name
#[derive(Default, Clone)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, WorkflowDescriptor>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: WorkflowDescriptor) {
        self.workflows
            .insert(descriptor.name.to_string(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowDescriptor> {
        self.workflows.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Registry of step descriptors, keyed by symbolic name
#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<String, StepDescriptor>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: StepDescriptor) {
        self.steps.insert(descriptor.name.to_string(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&StepDescriptor> {
        self.steps.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}
