//! Service configuration, loaded from YAML.
//!
//! Provider credentials and connection parameters stay in this external
//! file; the store only ever sees provider keys.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{ViveroError, ViveroResult};

/// A user allowed to call authenticated RPC methods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Login name
    pub name: String,
    /// Shared token checked against the request's auth field
    pub token: String,
    /// Staff users may operate on foreign objects and settings
    #[serde(default)]
    pub staff: bool,
}

/// Default quota applied to users without an explicit quota row
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Appliances allowed in a single pool
    #[serde(default)]
    pub per_pool_quota: Option<u32>,
    /// Concurrently owned pools
    #[serde(default)]
    pub total_pool_quota: Option<u32>,
    /// Concurrently owned appliances
    #[serde(default)]
    pub total_vm_quota: Option<u32>,
}

/// A template made available by a configured provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSeed {
    /// Template name on the provider
    pub name: String,
    /// Group the template belongs to
    pub group: String,
    /// Product version, when known
    #[serde(default)]
    pub version: Option<String>,
    /// Build date
    pub date: NaiveDate,
    /// Ready for immediate UI use
    #[serde(default = "default_true")]
    pub preconfigured: bool,
}

/// A provider the service may schedule onto
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider key
    pub key: String,
    /// Concurrent clone operations allowed
    #[serde(default = "default_provisioning_slots")]
    pub num_simultaneous_provisioning: u32,
    /// Concurrent configuration phases allowed
    #[serde(default = "default_configuring_slots")]
    pub num_simultaneous_configuring: u32,
    /// Hard cap on live appliances
    #[serde(default)]
    pub appliance_limit: Option<u32>,
    /// Templates the (simulated) provider starts with
    #[serde(default)]
    pub templates: Vec<TemplateSeed>,
}

/// Control-loop cadences, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Delayed-task processing cadence
    #[serde(default = "default_fulfillment_secs")]
    pub fulfillment_secs: u64,
    /// Lease/teardown reaper cadence
    #[serde(default = "default_reaper_secs")]
    pub reaper_secs: u64,
    /// Power-state reconciliation cadence
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_secs: u64,
    /// Template scan cadence
    #[serde(default = "default_scan_secs")]
    pub scan_secs: u64,
    /// Obsolete-template deletion cadence
    #[serde(default = "default_obsolete_secs")]
    pub obsolete_secs: u64,
    /// Mismatch-notification flush cadence
    #[serde(default = "default_mailer_secs")]
    pub mailer_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fulfillment_secs: default_fulfillment_secs(),
            reaper_secs: default_reaper_secs(),
            reconcile_secs: default_reconcile_secs(),
            scan_secs: default_scan_secs(),
            obsolete_secs: default_obsolete_secs(),
            mailer_secs: default_mailer_secs(),
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViveroConfig {
    /// RPC listen address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Where to persist/restore the store snapshot
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    /// Users allowed on authenticated methods
    #[serde(default)]
    pub users: Vec<UserConfig>,
    /// Quota applied when a user has no explicit quota row
    #[serde(default)]
    pub default_quota: Option<QuotaConfig>,
    /// Providers the service schedules onto
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Control-loop cadences
    #[serde(default)]
    pub workers: WorkerConfig,
}

impl Default for ViveroConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            snapshot_path: None,
            users: Vec::new(),
            default_quota: None,
            providers: Vec::new(),
            workers: WorkerConfig::default(),
        }
    }
}

impl ViveroConfig {
    /// Parse a YAML configuration document
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::Config`] on malformed YAML.
    pub fn from_yaml(source: &str) -> ViveroResult<Self> {
        serde_yaml_ng::from_str(source).map_err(|e| ViveroError::Config {
            message: e.to_string(),
        })
    }

    /// Load a YAML configuration file
    ///
    /// # Errors
    ///
    /// Propagates I/O failures; returns [`ViveroError::Config`] on
    /// malformed YAML.
    pub fn load(path: &Path) -> ViveroResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_yaml(&source)
    }

    /// Find a configured user by name
    #[must_use]
    pub fn user(&self, name: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.name == name)
    }
}

const fn default_true() -> bool {
    true
}

const fn default_provisioning_slots() -> u32 {
    5
}

const fn default_configuring_slots() -> u32 {
    1
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_fulfillment_secs() -> u64 {
    10
}

fn default_reaper_secs() -> u64 {
    30
}

fn default_reconcile_secs() -> u64 {
    45
}

fn default_scan_secs() -> u64 {
    300
}

fn default_obsolete_secs() -> u64 {
    3600
}

fn default_mailer_secs() -> u64 {
    60
}
