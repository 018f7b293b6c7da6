//! The step payload contract.
//!
//! Every step executor receives a `StepRequest { input, executionName }`
//! and returns a replacement `ProvisioningContext` — the raw output becomes
//! the working context for the next state, nothing is merged. A step that
//! wants a field preserved must carry it forward itself.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::PoolType;

/// The five named steps of the provisioning workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepName {
    StartProvision,
    CreateReservation,
    ObtainDevices,
    FinishProvision,
    FailProvision,
}

impl StepName {
    /// All steps, in workflow-definition order.
    pub const ALL: [StepName; 5] = [
        StepName::StartProvision,
        StepName::CreateReservation,
        StepName::ObtainDevices,
        StepName::FinishProvision,
        StepName::FailProvision,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::StartProvision => "startProvision",
            StepName::CreateReservation => "createReservation",
            StepName::ObtainDevices => "obtainDevices",
            StepName::FinishProvision => "finishProvision",
            StepName::FailProvision => "failProvision",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The evolving payload threaded through one provisioning run.
///
/// `done` is the sole loop-exit signal: absent or `false` means "not yet
/// satisfied", never an error. `execution_id` is stamped once at entry and
/// never changes for the lifetime of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_type: Option<PoolType>,
    #[serde(default)]
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// Populated only on the failure-catch path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFault>,

    // Well-known request fields, populated by the lifecycle controller and
    // carried forward by the built-in steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provision_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u32>,
    /// Device ids satisfied so far (reserved or obtained). Additive.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,

    /// Arbitrary step-specific fields, preserved across serialization.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProvisioningContext {
    /// Initial context for a provisioning request.
    pub fn for_request(account: &str, pool_name: &str, provision_id: &str, amount: u32) -> Self {
        Self {
            account: Some(account.to_string()),
            pool_name: Some(pool_name.to_string()),
            provision_id: Some(provision_id.to_string()),
            amount: Some(amount),
            ..Self::default()
        }
    }

    /// True when the unmanaged branch of the workflow applies. Anything
    /// other than an explicit `UNMANAGED` takes the managed branch.
    pub fn is_unmanaged(&self) -> bool {
        self.pool_type == Some(PoolType::Unmanaged)
    }
}

/// Error document attached to the context on the failure-catch path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFault {
    /// Short machine-readable cause.
    pub error: String,
    /// Optional human-readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl StepFault {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: None,
        }
    }

    pub fn with_cause(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: Some(cause.into()),
        }
    }
}

impl fmt::Display for StepFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.error, cause),
            None => f.write_str(&self.error),
        }
    }
}

/// How a step executor signals failure.
///
/// Business faults route the run to `failProvision`; transient failures are
/// retried by the orchestrator before the catch path is considered.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    #[error("step fault: {0}")]
    Fault(StepFault),

    #[error("transient failure: {0}")]
    Transient(String),
}

impl StepError {
    pub fn fault(error: impl Into<String>) -> Self {
        StepError::Fault(StepFault::new(error))
    }

    pub fn transient(message: impl Into<String>) -> Self {
        StepError::Transient(message.into())
    }
}

/// Request document passed to every step executor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRequest {
    pub input: ProvisioningContext,
    /// Unique id of the running orchestration instance.
    pub execution_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_names_serialize_camel_case() {
        assert_eq!(StepName::StartProvision.as_str(), "startProvision");
        assert_eq!(
            serde_json::to_string(&StepName::FailProvision).unwrap(),
            "\"failProvision\""
        );
    }

    #[test]
    fn absent_done_deserializes_to_false() {
        let ctx: ProvisioningContext =
            serde_json::from_str(r#"{"poolType":"MANAGED"}"#).unwrap();
        assert!(!ctx.done);
        assert_eq!(ctx.pool_type, Some(PoolType::Managed));
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let ctx: ProvisioningContext =
            serde_json::from_str(r#"{"done":true,"reservationId":"res-1"}"#).unwrap();
        assert_eq!(
            ctx.extra.get("reservationId"),
            Some(&Value::String("res-1".to_string()))
        );

        let round = serde_json::to_string(&ctx).unwrap();
        assert!(round.contains("reservationId"));
    }

    #[test]
    fn missing_pool_type_is_not_unmanaged() {
        let ctx = ProvisioningContext::default();
        assert!(!ctx.is_unmanaged());

        let mut ctx = ctx;
        ctx.pool_type = Some(PoolType::Unmanaged);
        assert!(ctx.is_unmanaged());
    }

    #[test]
    fn step_request_wire_shape() {
        let request = StepRequest {
            input: ProvisioningContext::for_request("acct", "pool-a", "p-1", 2),
            execution_name: "exec-1".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["executionName"], "exec-1");
        assert_eq!(json["input"]["poolName"], "pool-a");
        assert_eq!(json["input"]["amount"], 2);
    }

    #[test]
    fn fault_display_includes_cause() {
        let fault = StepFault::with_cause("NoDevices", "pool inventory empty");
        assert_eq!(fault.to_string(), "NoDevices: pool inventory empty");
        assert_eq!(StepFault::new("NoDevices").to_string(), "NoDevices");
    }
}
