//! DeviceLab.toml configuration parser.
//!
//! Carries workflow tuning and the declarative pool installs the daemon
//! seeds into the record store at startup.

use std::path::Path;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::types::{EndpointType, LockOptions, PoolType};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LabConfig {
    pub workflow: Option<WorkflowSettings>,
    #[serde(default, rename = "pool")]
    pub pools: Vec<PoolInstall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    pub name: Option<String>,
    pub timeout_secs: Option<u64>,
    pub wait_secs: Option<u64>,
}

/// A pool to install (upsert) at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolInstall {
    pub account: Option<String>,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub pool_type: PoolType,
    pub endpoint: Option<EndpointInstall>,
    pub lock: Option<LockInstall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointInstall {
    #[serde(rename = "type")]
    pub endpoint_type: EndpointType,
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInstall {
    pub enabled: Option<bool>,
    pub duration_secs: Option<u64>,
}

impl LabConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LabConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject installs that cannot work at runtime.
    pub fn validate(&self) -> anyhow::Result<()> {
        for pool in &self.pools {
            if pool.endpoint.is_some() && pool.pool_type == PoolType::Managed {
                bail!(
                    "trying to set an endpoint on a MANAGED pool {}",
                    pool.name
                );
            }
        }
        Ok(())
    }
}

impl LockInstall {
    pub fn to_options(&self) -> LockOptions {
        let defaults = LockOptions::default();
        LockOptions {
            enabled: self.enabled.unwrap_or(defaults.enabled),
            duration_secs: self.duration_secs.unwrap_or(defaults.duration_secs),
        }
    }
}
