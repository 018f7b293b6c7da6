//! Orchestrator error types.

use devicelab_core::StepName;
use thiserror::Error;

/// Result type alias for orchestrator operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors surfaced by the orchestrator's control surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("execution already started: {0}")]
    AlreadyStarted(String),

    #[error("unknown execution: {0}")]
    UnknownExecution(String),

    #[error("no executor registered for step: {0}")]
    MissingExecutor(StepName),
}
