//! The step executor seam.
//!
//! A step executor is an opaque unit of work: it receives the current
//! context wrapped in a `StepRequest` and returns a replacement context or
//! an error. The orchestrator selects executors by step name from a
//! `StepRegistry`, so the five call sites share one invocation path.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use devicelab_core::{ProvisioningContext, StepError, StepName, StepRequest};

/// Boxed future returned by a step invocation.
pub type StepFuture =
    Pin<Box<dyn Future<Output = Result<ProvisioningContext, StepError>> + Send>>;

/// One named unit of work invoked by the orchestrator.
pub trait StepExecutor: Send + Sync {
    fn invoke(&self, request: StepRequest) -> StepFuture;
}

/// Adapter turning a closure into a `StepExecutor`.
struct FnStep<F>(F);

impl<F> StepExecutor for FnStep<F>
where
    F: Fn(StepRequest) -> StepFuture + Send + Sync,
{
    fn invoke(&self, request: StepRequest) -> StepFuture {
        (self.0)(request)
    }
}

/// Wrap an async closure as a shareable step executor.
pub fn step_fn<F, Fut>(f: F) -> Arc<dyn StepExecutor>
where
    F: Fn(StepRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProvisioningContext, StepError>> + Send + 'static,
{
    Arc::new(FnStep(move |request| Box::pin(f(request)) as StepFuture))
}

/// Step name → executor mapping for one workflow instance.
#[derive(Default, Clone)]
pub struct StepRegistry {
    executors: HashMap<StepName, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: StepName, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(name, executor);
    }

    pub fn get(&self, name: StepName) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&name).cloned()
    }

    /// Workflow steps that have no executor registered yet.
    pub fn missing(&self) -> Vec<StepName> {
        StepName::ALL
            .into_iter()
            .filter(|name| !self.executors.contains_key(name))
            .collect()
    }
}
