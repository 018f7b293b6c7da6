//! devicelab-core — shared types for the Device Lab provisioning service.
//!
//! Defines the domain vocabulary used across the workspace:
//! - Device pool descriptors (`PoolType`, `PoolEndpoint`, `LockOptions`)
//! - The step payload contract (`ProvisioningContext`, `StepRequest`)
//! - The step error taxonomy (`StepError`: business fault vs transient)
//! - `DeviceLab.toml` parsing (`LabConfig`)

pub mod config;
pub mod context;
pub mod types;

pub use config::{LabConfig, PoolInstall, WorkflowSettings};
pub use context::{ProvisioningContext, StepError, StepFault, StepName, StepRequest};
pub use types::{EndpointType, LockOptions, PoolEndpoint, PoolType};
