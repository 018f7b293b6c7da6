//! The lifecycle controller run loop.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use devicelab_core::ProvisioningContext;
use devicelab_state::{ChangeKind, ProvisionRecord, RecordChange, RecordKey, StateStore};
use devicelab_workflow::{ProvisioningWorkflow, WorkflowError};

/// Execution id for the run driving the provision stored under `key`.
///
/// Deterministic, so insert and remove events for the same record always
/// resolve to the same run.
pub fn execution_id_for(provision_key: &str) -> String {
    format!("prov-{provision_key}")
}

/// Watches the record change feed and starts/stops provisioning runs.
pub struct LifecycleController {
    state: StateStore,
    workflow: Arc<ProvisioningWorkflow>,
}

impl LifecycleController {
    pub fn new(state: StateStore, workflow: Arc<ProvisioningWorkflow>) -> Self {
        Self { state, workflow }
    }

    /// Consume the change feed until shutdown is signalled or the feed
    /// closes. Lagged events are skipped with a warning; the feed is a
    /// trigger, not a ledger.
    pub async fn run(
        &self,
        mut changes: broadcast::Receiver<RecordChange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("lifecycle controller running");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                event = changes.recv() => match event {
                    Ok(change) => self.handle(change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change feed lagged, events skipped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!("lifecycle controller stopped");
    }

    async fn handle(&self, change: RecordChange) {
        match (&change.kind, &change.key) {
            (ChangeKind::Inserted, RecordKey::Provision(key)) => {
                self.start_for(key).await;
            }
            (ChangeKind::Removed, RecordKey::Provision(key)) => {
                self.stop_for(key).await;
            }
            _ => {}
        }
    }

    /// Stop the run behind a removed provision and release whatever it
    /// already held. A cancelled run never reaches `failProvision`, so the
    /// reservation cleanup happens here.
    async fn stop_for(&self, key: &str) {
        let execution_id = execution_id_for(key);
        debug!(provision = %key, execution = %execution_id, "provision removed, stopping run");
        // Idempotent; a run that already finished is left alone.
        let _ = self.workflow.stop(&execution_id).await;
        // Let the run settle before releasing; a step that was in flight
        // must not re-reserve after the cleanup.
        if self.workflow.status(&execution_id).await.is_some() {
            let _ = self.workflow.wait_for_terminal(&execution_id).await;
        }
        match self.state.delete_reservations_for_provision(key) {
            Ok(released) if released > 0 => {
                info!(provision = %key, released, "reservations released for removed provision");
            }
            Ok(_) => {}
            Err(error) => {
                warn!(provision = %key, %error, "failed to release reservations");
            }
        }
    }

    async fn start_for(&self, key: &str) {
        // The event carries only the key; the record is the payload.
        let record = match self.state.get_provision(key) {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(provision = %key, "inserted provision already gone, skipping");
                return;
            }
            Err(error) => {
                warn!(provision = %key, %error, "failed to load inserted provision");
                return;
            }
        };

        let execution_id = execution_id_for(key);
        let input = initial_context(&record);
        match self.workflow.start(&execution_id, input).await {
            Ok(()) => {
                info!(provision = %key, execution = %execution_id, "provisioning run started");
            }
            Err(WorkflowError::AlreadyStarted(_)) => {
                // Replays happen; the first start won.
                debug!(provision = %key, execution = %execution_id, "run already started");
            }
            Err(error) => {
                warn!(provision = %key, %error, "failed to start provisioning run");
            }
        }
    }
}

fn initial_context(record: &ProvisionRecord) -> ProvisioningContext {
    ProvisioningContext::for_request(
        &record.account,
        &record.pool_name,
        &record.id,
        record.amount,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use devicelab_core::StepName;
    use devicelab_state::{ProvisionStatus, StateStore};
    use devicelab_workflow::{
        ExecutionStatus, RetryPolicy, StepRegistry, WorkflowConfig, step_fn,
    };

    fn fast_config(wait_time: Duration) -> WorkflowConfig {
        WorkflowConfig {
            workflow_name: "TestWorkflow".to_string(),
            timeout: Duration::from_secs(5),
            wait_time,
            retry: RetryPolicy {
                max_attempts: 2,
                interval: Duration::from_millis(1),
                backoff: 1.0,
            },
        }
    }

    /// Registry whose reservation step reports done after `polls_needed`
    /// invocations.
    fn scripted_registry(polls_needed: u32) -> StepRegistry {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        let mut registry = StepRegistry::new();
        for name in StepName::ALL {
            registry.register(name, step_fn(|request| async move { Ok(request.input) }));
        }
        let polls = Arc::new(AtomicU32::new(0));
        registry.register(
            StepName::CreateReservation,
            step_fn(move |request| {
                let poll = polls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    let mut ctx = request.input;
                    ctx.done = poll >= polls_needed;
                    Ok(ctx)
                }
            }),
        );
        registry
    }

    fn provision(pool: &str, id: &str) -> ProvisionRecord {
        ProvisionRecord {
            account: "acct".to_string(),
            pool_name: pool.to_string(),
            id: id.to_string(),
            amount: 1,
            status: ProvisionStatus::Requested,
            message: None,
            execution_id: None,
            expires_in: None,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn controller_with(
        registry: StepRegistry,
        wait_time: Duration,
    ) -> (StateStore, Arc<ProvisioningWorkflow>, LifecycleController) {
        let store = StateStore::open_in_memory().unwrap();
        let workflow =
            Arc::new(ProvisioningWorkflow::new(fast_config(wait_time), registry).unwrap());
        let controller = LifecycleController::new(store.clone(), workflow.clone());
        (store, workflow, controller)
    }

    #[tokio::test]
    async fn insert_starts_a_run_that_completes() {
        let (store, workflow, controller) =
            controller_with(scripted_registry(1), Duration::from_millis(5));

        let changes = store.subscribe();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { controller.run(changes, shutdown_rx).await });

        store.put_provision(&provision("rack", "p-1")).unwrap();

        let execution_id = execution_id_for("acct:rack:p-1");
        // Poll until the controller has picked the event up.
        for _ in 0..100 {
            if workflow.status(&execution_id).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status = workflow.wait_for_terminal(&execution_id).await.unwrap();
        assert_eq!(status, ExecutionStatus::Succeeded);

        task.abort();
    }

    #[tokio::test]
    async fn remove_stops_the_run_it_started() {
        // A reservation step that is never done keeps the run looping.
        let (store, workflow, controller) =
            controller_with(scripted_registry(u32::MAX), Duration::from_secs(30));

        let changes = store.subscribe();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { controller.run(changes, shutdown_rx).await });

        store.put_provision(&provision("rack", "p-1")).unwrap();

        let execution_id = execution_id_for("acct:rack:p-1");
        for _ in 0..100 {
            if workflow.status(&execution_id).await == Some(ExecutionStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        store.delete_provision("acct:rack:p-1").unwrap();

        let status = workflow.wait_for_terminal(&execution_id).await.unwrap();
        assert_eq!(status, ExecutionStatus::Cancelled);

        task.abort();
    }

    #[tokio::test]
    async fn replayed_insert_is_ignored() {
        let (store, workflow, controller) =
            controller_with(scripted_registry(u32::MAX), Duration::from_secs(30));

        store.put_provision(&provision("rack", "p-1")).unwrap();
        let key = RecordKey::Provision("acct:rack:p-1".to_string());

        controller
            .handle(RecordChange {
                kind: ChangeKind::Inserted,
                key: key.clone(),
            })
            .await;
        // A second insert event for the same key must not disturb the run.
        controller
            .handle(RecordChange {
                kind: ChangeKind::Inserted,
                key,
            })
            .await;

        let execution_id = execution_id_for("acct:rack:p-1");
        assert_eq!(
            workflow.status(&execution_id).await,
            Some(ExecutionStatus::Running)
        );
        workflow.abort_all().await;
    }

    #[tokio::test]
    async fn non_provision_changes_are_ignored() {
        let (_store, workflow, controller) =
            controller_with(scripted_registry(1), Duration::from_millis(5));

        controller
            .handle(RecordChange {
                kind: ChangeKind::Inserted,
                key: RecordKey::Pool("acct:rack".to_string()),
            })
            .await;
        controller
            .handle(RecordChange {
                kind: ChangeKind::Modified,
                key: RecordKey::Provision("acct:rack:p-1".to_string()),
            })
            .await;

        assert_eq!(
            workflow.status(&execution_id_for("acct:rack:p-1")).await,
            None
        );
    }

    #[tokio::test]
    async fn insert_for_vanished_record_is_skipped() {
        let (_store, workflow, controller) =
            controller_with(scripted_registry(1), Duration::from_millis(5));

        // Event arrives after the record was already deleted again.
        controller
            .handle(RecordChange {
                kind: ChangeKind::Inserted,
                key: RecordKey::Provision("acct:rack:ghost".to_string()),
            })
            .await;

        assert_eq!(
            workflow.status(&execution_id_for("acct:rack:ghost")).await,
            None
        );
    }

    #[tokio::test]
    async fn removal_releases_reservations_held_by_the_stopped_run() {
        use devicelab_core::PoolType;
        use devicelab_state::{DevicePoolRecord, DeviceRecord};
        use devicelab_steps::{BuiltinSteps, IntegrationRouter};

        let store = StateStore::open_in_memory().unwrap();
        store
            .put_pool(&DevicePoolRecord {
                account: "acct".to_string(),
                name: "rack".to_string(),
                description: None,
                pool_type: PoolType::Managed,
                endpoint: None,
                lock_options: None,
                created_at: 1000,
                updated_at: 1000,
            })
            .unwrap();
        store
            .put_device(&DeviceRecord {
                account: "acct".to_string(),
                pool_name: "rack".to_string(),
                id: "dev-0".to_string(),
                public_address: "10.0.0.1".to_string(),
                private_address: None,
                expires_in: None,
                updated_at: 1000,
            })
            .unwrap();

        let steps = BuiltinSteps::new(store.clone(), Arc::new(IntegrationRouter::new()));
        let workflow = Arc::new(
            ProvisioningWorkflow::new(fast_config(Duration::from_secs(30)), steps.registry())
                .unwrap(),
        );
        let controller = LifecycleController::new(store.clone(), workflow.clone());
        let changes = store.subscribe();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { controller.run(changes, shutdown_rx).await });

        // Two devices wanted, one in inventory: the run reserves the one
        // device and parks in the wait loop.
        let mut record = provision("rack", "p-1");
        record.amount = 2;
        store.put_provision(&record).unwrap();
        for _ in 0..100 {
            if store
                .list_reservations_for_provision("acct:rack:p-1")
                .unwrap()
                .len()
                == 1
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            store
                .list_reservations_for_provision("acct:rack:p-1")
                .unwrap()
                .len(),
            1
        );

        // Removing the record cancels the run AND frees what it held.
        store.delete_provision("acct:rack:p-1").unwrap();
        for _ in 0..100 {
            if store
                .list_reservations_for_provision("acct:rack:p-1")
                .unwrap()
                .is_empty()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(
            store
                .list_reservations_for_provision("acct:rack:p-1")
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            workflow.status(&execution_id_for("acct:rack:p-1")).await,
            Some(ExecutionStatus::Cancelled)
        );

        // The device is allocatable again by a fresh provision.
        store.put_provision(&provision("rack", "p-2")).unwrap();
        let second = execution_id_for("acct:rack:p-2");
        for _ in 0..100 {
            if workflow.status(&second).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status = workflow.wait_for_terminal(&second).await.unwrap();
        assert_eq!(status, ExecutionStatus::Succeeded);

        task.abort();
    }

    #[tokio::test]
    async fn shutdown_ends_the_run_loop() {
        let (store, _workflow, controller) =
            controller_with(scripted_registry(1), Duration::from_millis(5));

        let changes = store.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { controller.run(changes, shutdown_rx).await });

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("controller should exit on shutdown")
            .unwrap();
    }
}
