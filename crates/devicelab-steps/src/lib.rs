//! Built-in step executors for the Device Lab provisioning workflow.
//!
//! The five workflow steps operate on the record store: `startProvision`
//! claims the provision record, `createReservation` reserves devices from a
//! managed pool's inventory, `obtainDevices` calls out through the
//! integration seam for unmanaged pools, and `finishProvision` /
//! `failProvision` settle the record. `BuiltinSteps::registry` wires them
//! all into a ready-to-run `StepRegistry`.

pub mod builtin;
pub mod integration;

pub use builtin::BuiltinSteps;
pub use integration::{
    DeviceIntegration, IntegrationRouter, ObtainFuture, ObtainRequest, ObtainResponse,
    integration_fn,
};
