//! devicelab-workflow — the device-pool provisioning orchestrator.
//!
//! Drives a `ProvisioningContext` through a fixed graph of named steps:
//!
//! ```text
//! startProvision
//!   │
//!   ▼
//! scalingEntry ◄────────────────┐
//!   │                           │
//!   ├─ poolType == UNMANAGED ──► obtainDevices ──┐
//!   └─ otherwise ──────────────► createReservation
//!   │                           │
//!   ▼                           ▼
//! done? ── true ──► finishProvision (success)
//!   └─ false ─────► waitLoop ───┘
//! ```
//!
//! Every invoke state is wired to the same failure sink: a business fault
//! (or exhausted transient retries) routes the run to `failProvision` with
//! the pre-failure context plus an `error` document. The whole run is
//! bounded by a global timeout and can be cancelled idempotently by id.

pub mod config;
pub mod error;
pub mod executor;
pub mod machine;
pub mod run;

pub use config::{RetryPolicy, WorkflowConfig};
pub use error::{WorkflowError, WorkflowResult};
pub use executor::{StepExecutor, StepFuture, StepRegistry, step_fn};
pub use machine::WorkflowState;
pub use run::{ExecutionStatus, FailureKind, ProvisioningWorkflow};
