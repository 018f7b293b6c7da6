//! Record types persisted by the Device Lab store.
//!
//! These mirror the control plane's view of the world: pools, the provision
//! requests made against them, per-device reservations, and the device
//! inventory of managed pools. All types are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};

use devicelab_core::{LockOptions, PoolEndpoint, PoolType};

// ── Pools ──────────────────────────────────────────────────────────

/// A registered device pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DevicePoolRecord {
    pub account: String,
    pub name: String,
    pub description: Option<String>,
    pub pool_type: PoolType,
    /// Integration endpoint; only meaningful for unmanaged pools.
    pub endpoint: Option<PoolEndpoint>,
    /// Device lock configuration applied when reserving.
    pub lock_options: Option<LockOptions>,
    /// Unix timestamp (seconds) when this pool was registered.
    pub created_at: u64,
    /// Unix timestamp (seconds) of last update.
    pub updated_at: u64,
}

// ── Provisions ─────────────────────────────────────────────────────

/// Lifecycle status of a provision request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStatus {
    Requested,
    Provisioning,
    Succeeded,
    Failed,
    Canceled,
}

/// A request to provision `amount` devices from a pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionRecord {
    pub account: String,
    pub pool_name: String,
    pub id: String,
    /// Number of devices requested.
    pub amount: u32,
    pub status: ProvisionStatus,
    /// Failure detail, set when the status is `Failed`.
    pub message: Option<String>,
    /// Id of the orchestration run driving this provision.
    pub execution_id: Option<String>,
    /// TTL stamp (unix seconds); expired records are garbage for reapers.
    pub expires_in: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Reservations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    Released,
}

/// A single device held on behalf of a provision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReservationRecord {
    pub account: String,
    pub pool_name: String,
    pub provision_id: String,
    pub device_id: String,
    pub status: ReservationStatus,
    /// Lock expiry (unix seconds) when the pool locks reserved devices.
    pub locked_until: Option<u64>,
    pub updated_at: u64,
}

// ── Devices ────────────────────────────────────────────────────────

/// Inventory entry for a managed pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceRecord {
    pub account: String,
    pub pool_name: String,
    pub id: String,
    /// Address clients use to reach the device.
    pub public_address: String,
    pub private_address: Option<String>,
    /// TTL stamp (unix seconds) for self-expiring registrations.
    pub expires_in: Option<u64>,
    pub updated_at: u64,
}

// ── Composite keys ─────────────────────────────────────────────────

impl DevicePoolRecord {
    pub fn table_key(&self) -> String {
        pool_key(&self.account, &self.name)
    }
}

impl ProvisionRecord {
    pub fn table_key(&self) -> String {
        provision_key(&self.account, &self.pool_name, &self.id)
    }
}

impl ReservationRecord {
    pub fn table_key(&self) -> String {
        format!(
            "{}:{}",
            provision_key(&self.account, &self.pool_name, &self.provision_id),
            self.device_id
        )
    }
}

impl DeviceRecord {
    pub fn table_key(&self) -> String {
        format!("{}:{}", pool_key(&self.account, &self.pool_name), self.id)
    }
}

/// Key for the pools table.
pub fn pool_key(account: &str, name: &str) -> String {
    format!("{account}:{name}")
}

/// Key for the provisions table.
pub fn provision_key(account: &str, pool_name: &str, provision_id: &str) -> String {
    format!("{account}:{pool_name}:{provision_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_keys_nest_by_prefix() {
        let reservation = ReservationRecord {
            account: "acct".to_string(),
            pool_name: "rack-a".to_string(),
            provision_id: "p-1".to_string(),
            device_id: "dev-9".to_string(),
            status: ReservationStatus::Reserved,
            locked_until: None,
            updated_at: 1000,
        };

        let provision_prefix = provision_key("acct", "rack-a", "p-1");
        assert!(reservation.table_key().starts_with(&provision_prefix));
        assert!(provision_prefix.starts_with(&pool_key("acct", "rack-a")));
    }
}
