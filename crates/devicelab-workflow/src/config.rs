//! Orchestrator configuration.

use std::time::Duration;

/// Retry policy for transient (infrastructure-level) step failures.
///
/// Business faults are never retried; they route straight to the failure
/// sink. Transient failures are retried with exponential backoff until the
/// attempt budget is spent.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total invocation attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub interval: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            interval: Duration::from_secs(2),
            backoff: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.interval.mul_f64(self.backoff.powi(exponent as i32))
    }
}

/// Tuning for one provisioning workflow instance.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub workflow_name: String,
    /// Ceiling for an entire run, entry to terminal state.
    pub timeout: Duration,
    /// Pause between polling iterations of the wait loop.
    pub wait_time: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            workflow_name: "DeviceLabWorkflow".to_string(),
            timeout: Duration::from_secs(3600),
            wait_time: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}
