//! Persisted rows of the pool service.
//!
//! Every entity carries a free-form `metadata` JSON blob for
//! forward-compatible extension.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// Appliance row id
    ApplianceId
);
id_newtype!(
    /// Appliance pool row id
    PoolId
);
id_newtype!(
    /// Template row id
    TemplateId
);
id_newtype!(
    /// Delayed provision task row id
    TaskId
);
id_newtype!(
    /// Version-mismatch mailer row id
    MailerId
);

/// Observed power state of an appliance VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    /// Powered on
    On,
    /// Powered off
    Off,
    /// Suspended to disk/memory
    Suspended,
    /// Paused by the hypervisor
    Paused,
    /// Not determinable (also: VM gone)
    Unknown,
}

impl PowerState {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Suspended => "suspended",
            Self::Paused => "paused",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provisioning lifecycle of an appliance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionState {
    /// Accepted, waiting for a provisioning slot
    Queued,
    /// Template clone in flight
    Provisioning,
    /// Booting and acquiring an address
    Configuring,
    /// Usable by the owner
    Ready,
    /// Being renamed on the provider
    Renaming,
    /// Provisioning failed; does not count toward pool readiness
    Error,
    /// Kill requested, teardown in flight
    Destroying,
    /// Gone; never reused
    Destroyed,
}

impl std::fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Queued => "Queued",
            Self::Provisioning => "Provisioning",
            Self::Configuring => "Configuring",
            Self::Ready => "Ready",
            Self::Renaming => "Renaming",
            Self::Error => "Error",
            Self::Destroying => "Destroying",
            Self::Destroyed => "Destroyed",
        };
        write!(f, "{name}")
    }
}

/// An infrastructure backend appliances live on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    /// Provider key in the service configuration
    pub id: String,
    /// Management address, informational
    pub ip_address: Option<String>,
    /// How many clone operations may run concurrently
    pub num_simultaneous_provisioning: u32,
    /// How many configuration phases may run concurrently
    pub num_simultaneous_configuring: u32,
    /// Hard cap on live appliances, `None` for unlimited
    pub appliance_limit: Option<u32>,
    /// Disabled providers never receive new work
    pub disabled: bool,
    /// Free-form extension data
    pub metadata: Value,
}

impl Provider {
    /// A provider row with defaults
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ip_address: None,
            num_simultaneous_provisioning: 5,
            num_simultaneous_configuring: 1,
            appliance_limit: None,
            disabled: false,
            metadata: json!({}),
        }
    }
}

/// A logical appliance family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    /// Group name (eg. `cfme-59`, `upstream`)
    pub id: String,
    /// Preconfigured appliances to keep warm for quick taking
    pub template_pool_size: u32,
    /// Raw (unconfigured) appliances to keep warm
    pub unconfigured_template_pool_size: u32,
    /// Templates older than this many days are obsolete
    pub template_obsolete_days: Option<u32>,
    /// Delete obsolete templates automatically
    pub template_obsolete_days_delete: bool,
    /// Automation script used for template deletion
    pub templates_delete_script: Option<String>,
    /// Last failure of the delete script, for operators
    pub last_delete_script_exception: Option<String>,
    /// Free-form extension data
    pub metadata: Value,
}

impl Group {
    /// A group row with defaults
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            template_pool_size: 0,
            unconfigured_template_pool_size: 0,
            template_obsolete_days: None,
            template_obsolete_days_delete: false,
            templates_delete_script: None,
            last_delete_script_exception: None,
            metadata: json!({}),
        }
    }
}

/// A provider-side artifact appliances are instantiated from. One logical
/// template appears once per provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Row id
    pub id: TemplateId,
    /// Provider the template resides on
    pub provider: String,
    /// Group the template belongs to
    pub template_group: String,
    /// Name as it resides on the provider
    pub name: String,
    /// Name of the source artifact before preparation
    pub original_name: String,
    /// Product version, when known
    pub version: Option<String>,
    /// Build date
    pub date: NaiveDate,
    /// Prepared and usable for cloning
    pub ready: bool,
    /// Still present on the provider
    pub exists: bool,
    /// Not withdrawn by operators
    pub usable: bool,
    /// Ready for immediate UI use (`false` means a raw deployable image)
    pub preconfigured: bool,
    /// Scan loop suggests deleting this template
    pub suggested_delete: bool,
    /// Free-form extension data
    pub metadata: Value,
}

/// A running instance of the system under test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appliance {
    /// Row id
    pub id: ApplianceId,
    /// VM name on the provider
    pub name: String,
    /// Appliance UUID, when known
    pub uuid: Option<Uuid>,
    /// Source template
    pub template: TemplateId,
    /// Owning pool; an appliance belongs to at most one
    pub appliance_pool: Option<PoolId>,
    /// Owner, denormalized from the pool lease
    pub owner: Option<String>,
    /// Address of the web UI
    pub ip_address: Option<String>,
    /// Has an address and the web UI is online
    pub ready: bool,
    /// VM still present on the provider
    pub exists: bool,
    /// Observed power state
    pub power_state: PowerState,
    /// When the power state last changed
    pub power_state_changed: DateTime<Utc>,
    /// Provisioning lifecycle state
    pub status: ProvisionState,
    /// When the lifecycle state last changed
    pub status_changed: DateTime<Utc>,
    /// When the appliance was leased
    pub datetime_leased: Option<DateTime<Utc>>,
    /// When the lease expires; expired appliances are reaped
    pub leased_until: Option<DateTime<Utc>>,
    /// Operator-visible description
    pub description: String,
    /// Direct LUN disk attached (RHEV-style providers)
    pub lun_disk_connected: bool,
    /// Teardown already requested; makes kill idempotent
    pub marked_for_deletion: bool,
    /// Free-form extension data
    pub metadata: Value,
}

impl Appliance {
    /// Whether the row still occupies provider capacity
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self.status, ProvisionState::Destroyed)
    }

    /// Whether the appliance occupies a provisioning slot. Queued rows
    /// count too: the slot is reserved when the row is written.
    #[must_use]
    pub const fn is_provisioning(&self) -> bool {
        !self.ready
            && !self.marked_for_deletion
            && matches!(
                self.status,
                ProvisionState::Queued
                    | ProvisionState::Provisioning
                    | ProvisionState::Configuring
                    | ProvisionState::Renaming
            )
    }

    /// Wire form used by `request_check` and the appliance data calls.
    /// Timestamps are RFC 3339 or null.
    #[must_use]
    pub fn serialized(&self) -> Value {
        json!({
            "id": self.id.0,
            "name": self.name,
            "ready": self.ready,
            "ip_address": self.ip_address,
            "status": self.status.to_string(),
            "power_state": self.power_state.as_str(),
            "status_changed": self.status_changed.to_rfc3339(),
            "datetime_leased": self.datetime_leased.map(|t| t.to_rfc3339()),
            "leased_until": self.leased_until.map(|t| t.to_rfc3339()),
        })
    }
}

/// A user request satisfied by one or more appliances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliancePool {
    /// Row id
    pub id: PoolId,
    /// Owning user
    pub owner: String,
    /// Group appliances are provisioned from
    pub group: String,
    /// Requested version filter
    pub version: Option<String>,
    /// Requested build-date filter
    pub date: Option<NaiveDate>,
    /// Preconfigured or raw appliances
    pub preconfigured: bool,
    /// Run a package update during provisioning
    pub yum_update: bool,
    /// How many appliances the pool should hold
    pub num_appliances: u32,
    /// Owner gave the pool up; the reaper tears it down
    pub not_needed_anymore: bool,
    /// Teardown finished
    pub finished: bool,
    /// Owner-supplied description
    pub description: String,
    /// Free-form extension data
    pub metadata: Value,
}

/// Pending provisioning work waiting for provider/template capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayedProvisionTask {
    /// Row id
    pub id: TaskId,
    /// Pool the appliance is for
    pub pool: PoolId,
    /// Lease length in minutes for the eventual appliance
    pub lease_time: Option<u32>,
    /// Provider that failed last time; biased against, not banned
    pub provider_to_avoid: Option<String>,
}

/// Per-user upper bounds, enforced at pool creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserApplianceQuota {
    /// User name
    pub user: String,
    /// Appliances allowed in a single pool
    pub per_pool_quota: Option<u32>,
    /// Concurrently owned pools
    pub total_pool_quota: Option<u32>,
    /// Concurrently owned appliances
    pub total_vm_quota: Option<u32>,
}

/// A detected template version mismatch waiting to be mailed out.
/// `sent = false` rows are the notifier's work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MismatchVersionMailer {
    /// Row id
    pub id: MailerId,
    /// Provider the template resides on
    pub provider: String,
    /// Template name as scanned
    pub template_name: String,
    /// Version encoded in the template name
    pub supposed_version: String,
    /// Version the template actually reports
    pub actual_version: String,
    /// Already notified; suppresses duplicates
    pub sent: bool,
}

/// Extract the version a template name encodes (eg. `cfme-5.9.9-abc` →
/// `5.9.9`).
#[must_use]
pub fn version_from_name(name: &str) -> Option<String> {
    // A lazy-static would be overkill for a scan-loop helper
    let re = regex::Regex::new(r"(\d+\.\d+(?:\.\d+){0,2})").ok()?;
    re.captures(name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_from_name() {
        assert_eq!(
            version_from_name("cfme-5.9.9-20180515"),
            Some("5.9.9".to_string())
        );
        assert_eq!(version_from_name("upstream-nightly"), None);
    }

    #[test]
    fn test_serialized_timestamps_nullable() {
        let appliance = Appliance {
            id: ApplianceId(1),
            name: "cfme-1".to_string(),
            uuid: None,
            template: TemplateId(1),
            appliance_pool: None,
            owner: None,
            ip_address: None,
            ready: false,
            exists: true,
            power_state: PowerState::Unknown,
            power_state_changed: Utc::now(),
            status: ProvisionState::Queued,
            status_changed: Utc::now(),
            datetime_leased: None,
            leased_until: None,
            description: String::new(),
            lun_disk_connected: false,
            marked_for_deletion: false,
            metadata: json!({}),
        };
        let wire = appliance.serialized();
        assert_eq!(wire["datetime_leased"], Value::Null);
        assert_eq!(wire["status"], json!("Queued"));
        assert_eq!(wire["power_state"], json!("unknown"));
    }

    #[test]
    fn test_provisioning_occupancy() {
        let mut appliance = Appliance {
            id: ApplianceId(1),
            name: "a".to_string(),
            uuid: None,
            template: TemplateId(1),
            appliance_pool: None,
            owner: None,
            ip_address: None,
            ready: false,
            exists: true,
            power_state: PowerState::Off,
            power_state_changed: Utc::now(),
            status: ProvisionState::Provisioning,
            status_changed: Utc::now(),
            datetime_leased: None,
            leased_until: None,
            description: String::new(),
            lun_disk_connected: false,
            marked_for_deletion: false,
            metadata: json!({}),
        };
        assert!(appliance.is_provisioning());

        appliance.ready = true;
        assert!(!appliance.is_provisioning());

        appliance.ready = false;
        appliance.status = ProvisionState::Error;
        assert!(appliance.is_active());
        assert!(!appliance.is_provisioning());

        appliance.status = ProvisionState::Destroyed;
        assert!(!appliance.is_active());
        assert!(!appliance.is_provisioning());
    }
}
