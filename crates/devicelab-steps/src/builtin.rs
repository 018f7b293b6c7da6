//! The five built-in step executors.
//!
//! Each step takes the request context, performs its record-store work, and
//! returns the replacement context for the next state. Store I/O failures
//! surface as transient errors (the orchestrator retries them); domain
//! violations surface as business faults and route the run to the failure
//! sink.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use devicelab_core::{ProvisioningContext, StepError, StepFault, StepName, StepRequest};
use devicelab_state::{
    ProvisionStatus, ReservationRecord, ReservationStatus, StateError, StateStore, pool_key,
    provision_key,
};
use devicelab_workflow::{StepRegistry, step_fn};

use crate::integration::{IntegrationRouter, ObtainRequest};

/// How long a settled provision record lingers before reapers may collect it.
const SETTLED_TTL_SECS: u64 = 86_400;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn transient(error: StateError) -> StepError {
    StepError::transient(error.to_string())
}

fn invalid(detail: impl Into<String>) -> StepError {
    StepError::Fault(StepFault::with_cause("InvalidRequest", detail))
}

fn require<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, StepError> {
    value
        .as_deref()
        .ok_or_else(|| invalid(format!("context is missing `{field}`")))
}

/// The built-in executors, bound to a record store and the integration
/// router. Cheap to clone; one instance backs all five registrations.
#[derive(Clone)]
pub struct BuiltinSteps {
    store: StateStore,
    integrations: Arc<IntegrationRouter>,
}

impl BuiltinSteps {
    pub fn new(store: StateStore, integrations: Arc<IntegrationRouter>) -> Self {
        Self {
            store,
            integrations,
        }
    }

    /// Build a `StepRegistry` with all five steps registered.
    pub fn registry(&self) -> StepRegistry {
        let mut registry = StepRegistry::new();
        let steps = self.clone();
        registry.register(
            StepName::StartProvision,
            step_fn(move |request| {
                let steps = steps.clone();
                async move { steps.start_provision(request).await }
            }),
        );
        let steps = self.clone();
        registry.register(
            StepName::CreateReservation,
            step_fn(move |request| {
                let steps = steps.clone();
                async move { steps.create_reservation(request).await }
            }),
        );
        let steps = self.clone();
        registry.register(
            StepName::ObtainDevices,
            step_fn(move |request| {
                let steps = steps.clone();
                async move { steps.obtain_devices(request).await }
            }),
        );
        let steps = self.clone();
        registry.register(
            StepName::FinishProvision,
            step_fn(move |request| {
                let steps = steps.clone();
                async move { steps.finish_provision(request).await }
            }),
        );
        let steps = self.clone();
        registry.register(
            StepName::FailProvision,
            step_fn(move |request| {
                let steps = steps.clone();
                async move { steps.fail_provision(request).await }
            }),
        );
        registry
    }

    /// Context fields every store-backed step needs.
    fn request_keys<'a>(
        &self,
        ctx: &'a ProvisioningContext,
    ) -> Result<(&'a str, &'a str, &'a str), StepError> {
        Ok((
            require(&ctx.account, "account")?,
            require(&ctx.pool_name, "poolName")?,
            require(&ctx.provision_id, "provisionId")?,
        ))
    }

    /// Claim the provision record and resolve its pool.
    ///
    /// Marks the record `Provisioning`, stamps the execution id on it, and
    /// returns the context with `poolType` and `amount` resolved from the
    /// store — the record is the source of truth for both.
    pub async fn start_provision(
        &self,
        request: StepRequest,
    ) -> Result<ProvisioningContext, StepError> {
        let mut ctx = request.input;
        let (account, pool_name, provision_id) = self.request_keys(&ctx)?;

        let key = provision_key(account, pool_name, provision_id);
        let mut provision = self
            .store
            .get_provision(&key)
            .map_err(transient)?
            .ok_or_else(|| {
                StepError::Fault(StepFault::with_cause("ProvisionNotFound", key.clone()))
            })?;

        let pool = self
            .store
            .get_pool(&pool_key(account, pool_name))
            .map_err(transient)?
            .ok_or_else(|| {
                StepError::Fault(StepFault::with_cause(
                    "PoolNotFound",
                    pool_key(account, pool_name),
                ))
            })?;

        provision.status = ProvisionStatus::Provisioning;
        provision.execution_id = Some(request.execution_name.clone());
        provision.updated_at = now_secs();
        self.store.put_provision(&provision).map_err(transient)?;

        info!(
            provision = %key,
            pool_type = ?pool.pool_type,
            amount = provision.amount,
            "provision claimed"
        );

        ctx.pool_type = Some(pool.pool_type);
        ctx.amount = Some(provision.amount);
        Ok(ctx)
    }

    /// Reserve devices from a managed pool's own inventory.
    ///
    /// Picks unreserved devices until the requested amount is held, stamping
    /// a lock expiry when the pool locks reservations. An undersupplied
    /// inventory leaves `done` unset and the polling loop comes back.
    pub async fn create_reservation(
        &self,
        request: StepRequest,
    ) -> Result<ProvisioningContext, StepError> {
        let mut ctx = request.input;
        let (account, pool_name, provision_id) = self.request_keys(&ctx)?;
        let amount = ctx
            .amount
            .ok_or_else(|| invalid("context is missing `amount`"))?;

        let pool = self
            .store
            .get_pool(&pool_key(account, pool_name))
            .map_err(transient)?
            .ok_or_else(|| {
                StepError::Fault(StepFault::with_cause(
                    "PoolNotFound",
                    pool_key(account, pool_name),
                ))
            })?;

        let my_key = provision_key(account, pool_name, provision_id);
        let mut mine: Vec<String> = self
            .store
            .list_reservations_for_provision(&my_key)
            .map_err(transient)?
            .into_iter()
            .filter(|r| r.status == ReservationStatus::Reserved)
            .map(|r| r.device_id)
            .collect();

        if (mine.len() as u32) < amount {
            let locked_until = pool
                .lock_options
                .filter(|lock| lock.enabled)
                .map(|lock| now_secs() + lock.duration_secs);

            for device in self
                .store
                .list_devices_for_pool(account, pool_name)
                .map_err(transient)?
            {
                if (mine.len() as u32) >= amount {
                    break;
                }
                if mine.contains(&device.id) {
                    continue;
                }
                let reservation = ReservationRecord {
                    account: account.to_string(),
                    pool_name: pool_name.to_string(),
                    provision_id: provision_id.to_string(),
                    device_id: device.id.clone(),
                    status: ReservationStatus::Reserved,
                    locked_until,
                    updated_at: now_secs(),
                };
                // Conditional claim: the store checks availability and
                // inserts in one transaction, so a device contested by a
                // concurrent run goes to exactly one of them.
                if self.store.try_reserve_device(&reservation).map_err(transient)? {
                    mine.push(device.id);
                }
            }
        }

        let satisfied = (mine.len() as u32) >= amount;
        debug!(
            provision = %my_key,
            held = mine.len(),
            amount,
            satisfied,
            "reservation pass complete"
        );

        ctx.devices = mine;
        ctx.done = satisfied;
        Ok(ctx)
    }

    /// Obtain devices from an unmanaged pool through its integration
    /// endpoint, accumulating across polling iterations.
    pub async fn obtain_devices(
        &self,
        request: StepRequest,
    ) -> Result<ProvisioningContext, StepError> {
        let mut ctx = request.input;
        let (account, pool_name, provision_id) = self.request_keys(&ctx)?;
        let amount = ctx
            .amount
            .ok_or_else(|| invalid("context is missing `amount`"))?;

        let pool = self
            .store
            .get_pool(&pool_key(account, pool_name))
            .map_err(transient)?
            .ok_or_else(|| {
                StepError::Fault(StepFault::with_cause(
                    "PoolNotFound",
                    pool_key(account, pool_name),
                ))
            })?;

        let endpoint = pool.endpoint.ok_or_else(|| {
            StepError::Fault(StepFault::with_cause(
                "NoIntegrationEndpoint",
                pool_key(account, pool_name),
            ))
        })?;
        let integration = self.integrations.get(&endpoint.uri).ok_or_else(|| {
            StepError::Fault(StepFault::with_cause(
                "IntegrationNotRegistered",
                endpoint.uri.clone(),
            ))
        })?;

        let missing = amount.saturating_sub(ctx.devices.len() as u32);
        if missing > 0 {
            let response = integration
                .obtain(ObtainRequest {
                    account: account.to_string(),
                    pool_name: pool_name.to_string(),
                    provision_id: provision_id.to_string(),
                    amount: missing,
                    execution_name: request.execution_name.clone(),
                })
                .await?;
            for device in response.devices {
                if !ctx.devices.contains(&device) {
                    ctx.devices.push(device);
                }
            }
        }

        ctx.done = (ctx.devices.len() as u32) >= amount;
        debug!(
            provision = %provision_key(
                ctx.account.as_deref().unwrap_or_default(),
                ctx.pool_name.as_deref().unwrap_or_default(),
                ctx.provision_id.as_deref().unwrap_or_default()
            ),
            held = ctx.devices.len(),
            amount,
            done = ctx.done,
            "obtain pass complete"
        );
        Ok(ctx)
    }

    /// Settle the provision as succeeded.
    pub async fn finish_provision(
        &self,
        request: StepRequest,
    ) -> Result<ProvisioningContext, StepError> {
        let ctx = request.input;
        let (account, pool_name, provision_id) = self.request_keys(&ctx)?;

        let key = provision_key(account, pool_name, provision_id);
        let mut provision = self
            .store
            .get_provision(&key)
            .map_err(transient)?
            .ok_or_else(|| {
                StepError::Fault(StepFault::with_cause("ProvisionNotFound", key.clone()))
            })?;

        let now = now_secs();
        provision.status = ProvisionStatus::Succeeded;
        provision.expires_in = Some(now + SETTLED_TTL_SECS);
        provision.updated_at = now;
        self.store.put_provision(&provision).map_err(transient)?;

        info!(provision = %key, devices = ctx.devices.len(), "provision succeeded");
        Ok(ctx)
    }

    /// The terminal failure sink: settle the provision as failed and
    /// release everything it held. Tolerant of a missing record so cleanup
    /// still runs when the failure was the record disappearing.
    pub async fn fail_provision(
        &self,
        request: StepRequest,
    ) -> Result<ProvisioningContext, StepError> {
        let ctx = request.input;
        let (account, pool_name, provision_id) = self.request_keys(&ctx)?;

        let key = provision_key(account, pool_name, provision_id);
        let now = now_secs();
        match self.store.get_provision(&key).map_err(transient)? {
            Some(mut provision) => {
                provision.status = ProvisionStatus::Failed;
                provision.message = ctx.error.as_ref().map(|fault| fault.to_string());
                provision.expires_in = Some(now + SETTLED_TTL_SECS);
                provision.updated_at = now;
                self.store.put_provision(&provision).map_err(transient)?;
            }
            None => {
                warn!(provision = %key, "failing a provision with no record");
            }
        }

        let released = self
            .store
            .delete_reservations_for_provision(&key)
            .map_err(transient)?;
        info!(
            provision = %key,
            released,
            error = %ctx.error.as_ref().map(|f| f.to_string()).unwrap_or_default(),
            "provision failed"
        );
        Ok(ctx)
    }
}
