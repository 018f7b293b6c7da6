//! Device pool descriptors.
//!
//! A pool is either managed (devices are reserved from its own inventory)
//! or unmanaged (devices are obtained through an external integration
//! endpoint). These types are shared between the record store, the built-in
//! step executors, and `DeviceLab.toml`.

use serde::{Deserialize, Serialize};

/// How a pool satisfies provisioning requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolType {
    /// Devices are reserved from the pool's own inventory.
    #[default]
    Managed,
    /// Devices are obtained via the pool's integration endpoint.
    Unmanaged,
}

/// Transport used to reach an unmanaged pool's integration endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    Http,
    Invoke,
}

/// Integration endpoint for an unmanaged pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEndpoint {
    pub endpoint_type: EndpointType,
    /// Opaque URI the integration is registered under.
    pub uri: String,
}

/// Device lock configuration for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    pub enabled: bool,
    /// Lock duration in seconds once a device is reserved.
    pub duration_secs: u64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_secs: 3600,
        }
    }
}
