//! ProvisioningWorkflow — execution tracking and the interpreter loop.
//!
//! Each run is one tokio task driving the state graph; the workflow keeps a
//! slot per execution (task handle, cancel signal, status watch) so runs
//! can be started, stopped, and observed by id. Steps within a run are
//! strictly sequential; runs are fully independent of each other.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use devicelab_core::{ProvisioningContext, StepError, StepFault, StepName, StepRequest};

use crate::config::{RetryPolicy, WorkflowConfig};
use crate::error::{WorkflowError, WorkflowResult};
use crate::executor::StepRegistry;
use crate::machine::WorkflowState;

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A step executor raised a business fault.
    Business,
    /// Transient retries were exhausted on some step.
    RetriesExhausted,
    /// The failure sink itself failed while cleaning up.
    Cleanup,
}

/// Observable state of one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed(FailureKind),
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Per-execution state held in memory.
struct ExecutionSlot {
    /// Cancellation signal for the run task.
    cancel_tx: watch::Sender<bool>,
    /// Status published by the run task.
    status_rx: watch::Receiver<ExecutionStatus>,
    /// Handle to the run task.
    handle: JoinHandle<()>,
}

/// One entry in the executions map. Finished runs collapse to their final
/// status so a long-lived daemon carries only the id and one enum per
/// settled run, not task handles and channels. The id itself is retained
/// forever: duplicate-id rejection depends on remembering it.
enum Slot {
    Active(ExecutionSlot),
    Settled(ExecutionStatus),
}

impl Slot {
    fn status(&self) -> ExecutionStatus {
        match self {
            Slot::Active(active) => *active.status_rx.borrow(),
            Slot::Settled(status) => *status,
        }
    }
}

/// The provisioning orchestrator.
///
/// Holds the step registry and the map of known executions. All methods
/// take `&self`; share the workflow across tasks behind an `Arc`.
pub struct ProvisioningWorkflow {
    config: WorkflowConfig,
    registry: Arc<StepRegistry>,
    /// Known executions: execution_id → slot. Active slots settle into
    /// their terminal status on the next `start`, so late status queries
    /// and stop calls stay answerable.
    executions: Arc<RwLock<HashMap<String, Slot>>>,
}

/// Collapse finished active slots, dropping their handles and channels.
fn settle_finished(executions: &mut HashMap<String, Slot>) {
    for slot in executions.values_mut() {
        if let Slot::Active(active) = slot {
            let status = *active.status_rx.borrow();
            if status.is_terminal() {
                *slot = Slot::Settled(status);
            }
        }
    }
}

impl ProvisioningWorkflow {
    /// Create a workflow instance. Fails if any of the five steps has no
    /// registered executor.
    pub fn new(config: WorkflowConfig, registry: StepRegistry) -> WorkflowResult<Self> {
        if let Some(step) = registry.missing().first() {
            return Err(WorkflowError::MissingExecutor(*step));
        }
        Ok(Self {
            config,
            registry: Arc::new(registry),
            executions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Begin a run. The id must be fresh: duplicates are rejected even
    /// after the earlier run reached a terminal state.
    pub async fn start(
        &self,
        execution_id: &str,
        input: ProvisioningContext,
    ) -> WorkflowResult<()> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(execution_id) {
            return Err(WorkflowError::AlreadyStarted(execution_id.to_string()));
        }
        settle_finished(&mut executions);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(ExecutionStatus::Running);

        let registry = self.registry.clone();
        let config = self.config.clone();
        let id = execution_id.to_string();

        let handle = tokio::spawn(async move {
            let status = drive(&registry, &config, &id, input, cancel_rx).await;
            info!(execution = %id, ?status, "run reached terminal state");
            let _ = status_tx.send(status);
        });

        executions.insert(
            execution_id.to_string(),
            Slot::Active(ExecutionSlot {
                cancel_tx,
                status_rx,
                handle,
            }),
        );
        info!(
            execution = %execution_id,
            workflow = %self.config.workflow_name,
            "run started"
        );
        Ok(())
    }

    /// Request cancellation of a run. Idempotent: stopping an unknown,
    /// already-stopped, or already-finished execution is a no-op.
    pub async fn stop(&self, execution_id: &str) -> WorkflowResult<()> {
        let executions = self.executions.read().await;
        match executions.get(execution_id) {
            Some(Slot::Active(active)) if !active.status_rx.borrow().is_terminal() => {
                let _ = active.cancel_tx.send(true);
                info!(execution = %execution_id, "cancellation requested");
            }
            Some(_) => {
                debug!(execution = %execution_id, "already terminal, stop is a no-op");
            }
            None => {
                debug!(execution = %execution_id, "unknown execution, stop is a no-op");
            }
        }
        Ok(())
    }

    /// Current status of a run, if the id is known.
    pub async fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        let executions = self.executions.read().await;
        executions.get(execution_id).map(Slot::status)
    }

    /// Await a run's terminal status.
    pub async fn wait_for_terminal(&self, execution_id: &str) -> WorkflowResult<ExecutionStatus> {
        let mut status_rx = {
            let executions = self.executions.read().await;
            let slot = executions
                .get(execution_id)
                .ok_or_else(|| WorkflowError::UnknownExecution(execution_id.to_string()))?;
            match slot {
                Slot::Active(active) => active.status_rx.clone(),
                Slot::Settled(status) => return Ok(*status),
            }
        };
        loop {
            let status = *status_rx.borrow_and_update();
            if status.is_terminal() {
                return Ok(status);
            }
            if status_rx.changed().await.is_err() {
                return Ok(*status_rx.borrow());
            }
        }
    }

    /// Cancel every non-terminal run (for graceful shutdown).
    pub async fn shutdown(&self) {
        let executions = self.executions.read().await;
        for (id, slot) in executions.iter() {
            if let Slot::Active(active) = slot {
                if !active.status_rx.borrow().is_terminal() {
                    let _ = active.cancel_tx.send(true);
                    debug!(execution = %id, "shutdown cancellation sent");
                }
            }
        }
    }

    /// Abort all run tasks outright. Test/teardown helper.
    pub async fn abort_all(&self) {
        let mut executions = self.executions.write().await;
        for (_, slot) in executions.drain() {
            if let Slot::Active(active) = slot {
                active.handle.abort();
            }
        }
    }
}

/// Drive one run to a terminal status, under the global timeout.
async fn drive(
    registry: &StepRegistry,
    config: &WorkflowConfig,
    execution_id: &str,
    mut ctx: ProvisioningContext,
    mut cancel: watch::Receiver<bool>,
) -> ExecutionStatus {
    ctx.execution_id = Some(execution_id.to_string());

    match tokio::time::timeout(
        config.timeout,
        run_states(registry, config, execution_id, ctx, &mut cancel),
    )
    .await
    {
        Ok(status) => status,
        Err(_) => {
            warn!(
                execution = %execution_id,
                timeout_secs = config.timeout.as_secs(),
                "run exceeded the workflow timeout"
            );
            ExecutionStatus::TimedOut
        }
    }
}

/// The interpreter loop over the state graph.
async fn run_states(
    registry: &StepRegistry,
    config: &WorkflowConfig,
    execution_id: &str,
    mut ctx: ProvisioningContext,
    cancel: &mut watch::Receiver<bool>,
) -> ExecutionStatus {
    let mut state = WorkflowState::ENTRY;

    loop {
        if *cancel.borrow() {
            info!(execution = %execution_id, ?state, "cancelled before next state");
            return ExecutionStatus::Cancelled;
        }
        debug!(execution = %execution_id, ?state, "entering state");

        match state {
            WorkflowState::ScalingEntry => {
                // Pure pass node: re-evaluates the pool-type branch on
                // every loop iteration.
                state = WorkflowState::branch_on_pool(&ctx);
            }

            WorkflowState::WaitLoop => {
                tokio::select! {
                    _ = tokio::time::sleep(config.wait_time) => {
                        state = WorkflowState::ScalingEntry;
                    }
                    _ = cancel.changed() => {
                        info!(execution = %execution_id, "cancelled inside wait loop");
                        return ExecutionStatus::Cancelled;
                    }
                }
            }

            WorkflowState::Invoke(step) => {
                let request = StepRequest {
                    input: ctx.clone(),
                    execution_name: execution_id.to_string(),
                };
                let invoked = tokio::select! {
                    result = invoke_with_retry(registry, &config.retry, step, request) => result,
                    _ = cancel.changed() => {
                        info!(execution = %execution_id, %step, "cancelled during step invocation");
                        return ExecutionStatus::Cancelled;
                    }
                };

                match invoked {
                    Ok(output) => {
                        debug!(execution = %execution_id, %step, done = output.done, "step completed");
                        ctx = output;
                        match WorkflowState::after_success(step, &ctx) {
                            Some(next) => state = next,
                            None => return ExecutionStatus::Succeeded,
                        }
                    }
                    Err(step_error) => {
                        // The failure catch: freeze the pre-step context,
                        // attach the error document, and run the sink.
                        let (fault, kind) = classify_failure(step_error);
                        warn!(
                            execution = %execution_id,
                            %step,
                            ?kind,
                            error = %fault,
                            "step failed, routing to failProvision"
                        );
                        ctx.error = Some(fault);
                        return fail_provision(registry, config, execution_id, ctx, kind).await;
                    }
                }
            }
        }
    }
}

/// Map a step error to the error document and failure category.
fn classify_failure(step_error: StepError) -> (StepFault, FailureKind) {
    match step_error {
        StepError::Fault(fault) => (fault, FailureKind::Business),
        StepError::Transient(message) => (
            StepFault::with_cause("RetriesExhausted", message),
            FailureKind::RetriesExhausted,
        ),
    }
}

/// Run the terminal failure sink. Invoked at most once per failing run;
/// it has no catch of its own — if it fails, the run ends as a cleanup
/// failure.
async fn fail_provision(
    registry: &StepRegistry,
    config: &WorkflowConfig,
    execution_id: &str,
    ctx: ProvisioningContext,
    kind: FailureKind,
) -> ExecutionStatus {
    let request = StepRequest {
        input: ctx,
        execution_name: execution_id.to_string(),
    };
    match invoke_with_retry(registry, &config.retry, StepName::FailProvision, request).await {
        Ok(_) => ExecutionStatus::Failed(kind),
        Err(sink_error) => {
            error!(
                execution = %execution_id,
                error = %sink_error,
                "failProvision itself failed"
            );
            ExecutionStatus::Failed(FailureKind::Cleanup)
        }
    }
}

/// Invoke one step, retrying transient failures with backoff.
async fn invoke_with_retry(
    registry: &StepRegistry,
    policy: &RetryPolicy,
    step: StepName,
    request: StepRequest,
) -> Result<ProvisioningContext, StepError> {
    // The registry is validated at construction; a miss here means the
    // workflow was assembled by hand.
    let executor = registry
        .get(step)
        .ok_or_else(|| StepError::fault(format!("no executor registered for {step}")))?;

    let mut attempt = 1u32;
    loop {
        match executor.invoke(request.clone()).await {
            Ok(output) => return Ok(output),
            Err(StepError::Transient(message)) if attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    %step,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %message,
                    "transient step failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(other) => return Err(other),
        }
    }
}
