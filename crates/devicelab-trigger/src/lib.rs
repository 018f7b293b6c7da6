//! devicelab-trigger — record changes drive the provisioning workflow.
//!
//! The lifecycle controller subscribes to the state store's change feed and
//! translates provision-record events into orchestration runs: an inserted
//! provision starts a run, a removed provision stops it. The execution id
//! is derived deterministically from the record key, so a later removal
//! always addresses the run its insertion started.

pub mod controller;

pub use controller::{LifecycleController, execution_id_for};
