//! The state graph.
//!
//! A tagged-enum rendition of the workflow definition: invoke states carry
//! their step name, the two choice points are pure functions of the
//! context, and `scalingEntry` is the re-entry point of the polling loop.
//! Because the pool-type branch hangs off `scalingEntry`, it is re-run on
//! every iteration — a `poolType` that changes mid-run changes the branch
//! on the next pass.

use devicelab_core::{ProvisioningContext, StepName};

/// One node of the workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    /// Invoke the named step executor.
    Invoke(StepName),
    /// Pass-through synchronization point; no side effects.
    ScalingEntry,
    /// Timed pause before re-entering `ScalingEntry`.
    WaitLoop,
}

impl WorkflowState {
    /// Single entry point of the graph.
    pub const ENTRY: WorkflowState = WorkflowState::Invoke(StepName::StartProvision);

    /// The "Is Managed?" choice. Only an explicit `UNMANAGED` takes the
    /// obtain-devices branch; managed, absent, or anything else reserves.
    pub fn branch_on_pool(ctx: &ProvisioningContext) -> WorkflowState {
        if ctx.is_unmanaged() {
            WorkflowState::Invoke(StepName::ObtainDevices)
        } else {
            WorkflowState::Invoke(StepName::CreateReservation)
        }
    }

    /// The "Is Done?" choice. Absent `done` means "not yet satisfied".
    pub fn branch_on_done(ctx: &ProvisioningContext) -> WorkflowState {
        if ctx.done {
            WorkflowState::Invoke(StepName::FinishProvision)
        } else {
            WorkflowState::WaitLoop
        }
    }

    /// Successor of a successfully completed invoke state; `None` marks a
    /// terminal step (`finishProvision`, and the failure sink itself).
    pub fn after_success(step: StepName, ctx: &ProvisioningContext) -> Option<WorkflowState> {
        match step {
            StepName::StartProvision => Some(WorkflowState::ScalingEntry),
            StepName::CreateReservation | StepName::ObtainDevices => {
                Some(Self::branch_on_done(ctx))
            }
            StepName::FinishProvision | StepName::FailProvision => None,
        }
    }
}
