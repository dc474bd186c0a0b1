//! Pool service operations.
//!
//! Every method is a short, atomic transaction against the shared
//! [`Store`]; nothing here ever talks to a provider backend directly.
//! Work that needs a provider (cloning, power, teardown) is handed to the
//! workers as a typed [`WorkerOrder`], and a dropped order is harmless:
//! the control loops re-derive pending work from the store.

use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::QuotaConfig;
use crate::error::{QuotaKind, ViveroError, ViveroResult};
use crate::models::{
    Appliance, AppliancePool, ApplianceId, DelayedProvisionTask, PoolId, PowerState,
    ProvisionState, Provider, TaskId, Template,
};
use crate::provider::{ProviderDirectory, SimProvider};
use crate::scheduler;
use crate::store::Store;
use crate::workers::WorkerOrder;

/// Depth of the worker order queue. Orders beyond it are dropped and the
/// fulfillment loop re-derives them from queued store rows.
pub const ORDER_QUEUE_DEPTH: usize = 256;

/// An authenticated RPC caller
#[derive(Debug, Clone)]
pub struct Caller {
    /// Login name; becomes the owner of created pools
    pub name: String,
    /// Staff callers may operate on foreign objects and settings
    pub staff: bool,
}

impl Caller {
    /// A regular (non-staff) caller
    #[must_use]
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            staff: false,
        }
    }

    /// A staff caller
    #[must_use]
    pub fn staff(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            staff: true,
        }
    }
}

/// Parameters of a `request_appliances` call
#[derive(Debug, Clone)]
pub struct PoolRequest {
    /// Template group to provision from
    pub group: String,
    /// How many appliances the pool should hold
    pub count: u32,
    /// Lease length in minutes for each appliance
    pub lease_minutes: u32,
    /// Pin provisioning to one template name
    pub template: Option<String>,
    /// Pin provisioning to one provider
    pub provider: Option<String>,
    /// Version filter; latest available when unset
    pub version: Option<String>,
    /// Build-date filter; latest available when unset
    pub date: Option<NaiveDate>,
    /// Preconfigured or raw appliances
    pub preconfigured: bool,
    /// Run a package update during provisioning
    pub yum_update: bool,
}

impl PoolRequest {
    /// A request for one preconfigured appliance with a one-hour lease
    #[must_use]
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            count: 1,
            lease_minutes: 60,
            template: None,
            provider: None,
            version: None,
            date: None,
            preconfigured: true,
            yum_update: false,
        }
    }
}

/// The pool service: request handlers over the shared store
pub struct PoolService {
    store: Arc<Store>,
    providers: Arc<ProviderDirectory>,
    clock: Arc<dyn Clock>,
    default_quota: Option<QuotaConfig>,
    // Brackets eligibility check + row insert, so two concurrent requests
    // cannot reserve the same provider slot or warm appliance.
    scheduling: Mutex<()>,
    orders: mpsc::Sender<WorkerOrder>,
}

impl std::fmt::Debug for PoolService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolService")
            .field("providers", &self.providers.keys())
            .finish_non_exhaustive()
    }
}

impl PoolService {
    /// Build the service and the order queue its workers consume
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        providers: Arc<ProviderDirectory>,
        clock: Arc<dyn Clock>,
        default_quota: Option<QuotaConfig>,
    ) -> (Arc<Self>, mpsc::Receiver<WorkerOrder>) {
        let (orders, receiver) = mpsc::channel(ORDER_QUEUE_DEPTH);
        (
            Arc::new(Self {
                store,
                providers,
                clock,
                default_quota,
                scheduling: Mutex::new(()),
                orders,
            }),
            receiver,
        )
    }

    /// The shared store
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Connected provider clients
    #[must_use]
    pub fn providers(&self) -> &ProviderDirectory {
        &self.providers
    }

    /// The service clock
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) fn send_order(&self, order: WorkerOrder) {
        if let Err(err) = self.orders.try_send(order) {
            debug!(%err, "worker order not dispatched; control loop will pick it up");
        }
    }

    // ------------------------------------------------------------------
    // Pool lifecycle
    // ------------------------------------------------------------------

    /// Create an appliance pool for the caller and start filling it.
    /// Returns the pool id immediately; fulfillment is observable through
    /// [`request_check`](Self::request_check).
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::QuotaExceeded`] when a quota would be
    /// exceeded (nothing is written), [`ViveroError::NotFound`] for an
    /// unknown group or pinned template, [`ViveroError::Invalid`] for a
    /// zero count.
    pub fn request_appliances(&self, caller: &Caller, req: PoolRequest) -> ViveroResult<PoolId> {
        if req.count == 0 {
            return Err(ViveroError::Invalid {
                field: "count".to_string(),
                message: "a pool holds at least one appliance".to_string(),
            });
        }
        let _ = self.store.group(&req.group)?;
        self.enforce_quotas(&caller.name, req.count)?;

        // Resolve the version/date the pool will be pinned to
        let (version, date) = if let Some(name) = &req.template {
            let template = self
                .store
                .templates()
                .into_iter()
                .find(|t| {
                    t.name == *name
                        && req.provider.as_deref().map_or(true, |p| t.provider == p)
                })
                .ok_or_else(|| ViveroError::NotFound {
                    kind: "template",
                    id: name.clone(),
                })?;
            (template.version.clone(), Some(template.date))
        } else {
            let version = req.version.clone().or_else(|| {
                scheduler::available_versions(&self.store, Some(&req.group), req.preconfigured)
                    .into_iter()
                    .next()
            });
            let date = req.date.or_else(|| {
                scheduler::latest_date(
                    &self.store,
                    &req.group,
                    req.preconfigured,
                    version.as_deref(),
                )
            });
            (version, date)
        };

        let mut metadata = json!({});
        if let Some(provider) = &req.provider {
            metadata["provider"] = json!(provider);
        }
        if let Some(template) = &req.template {
            metadata["template"] = json!(template);
        }

        let guard = self.scheduling.lock().expect("scheduling lock poisoned");
        let pool_id = self.store.insert_pool(AppliancePool {
            id: PoolId(0),
            owner: caller.name.clone(),
            group: req.group.clone(),
            version,
            date,
            preconfigured: req.preconfigured,
            yum_update: req.yum_update,
            num_appliances: req.count,
            not_needed_anymore: false,
            finished: false,
            description: format!("{}'s pool of {} {}", caller.name, req.count, req.group),
            metadata,
        });
        let pool = self.store.pool(pool_id)?;
        for _ in 0..req.count {
            if self
                .schedule_inner(&pool, req.lease_minutes, None)
                .is_none()
            {
                let _ = self.store.insert_task(DelayedProvisionTask {
                    id: TaskId(0),
                    pool: pool_id,
                    lease_time: Some(req.lease_minutes),
                    provider_to_avoid: None,
                });
            }
        }
        drop(guard);

        info!(pool = %pool_id, owner = %caller.name, group = %req.group,
              count = req.count, "pool requested");
        Ok(pool_id)
    }

    fn enforce_quotas(&self, user: &str, count: u32) -> ViveroResult<()> {
        let quota = self.store.quota_for(user).map_or_else(
            || self.default_quota.clone().unwrap_or_default(),
            |q| QuotaConfig {
                per_pool_quota: q.per_pool_quota,
                total_pool_quota: q.total_pool_quota,
                total_vm_quota: q.total_vm_quota,
            },
        );
        if let Some(limit) = quota.per_pool_quota {
            if count > limit {
                return Err(ViveroError::QuotaExceeded {
                    quota: QuotaKind::PerPool,
                    limit,
                    requested: count,
                });
            }
        }
        if let Some(limit) = quota.total_pool_quota {
            let owned = self
                .store
                .pools()
                .iter()
                .filter(|p| p.owner == user && !p.finished)
                .count() as u32;
            if owned + 1 > limit {
                return Err(ViveroError::QuotaExceeded {
                    quota: QuotaKind::TotalPools,
                    limit,
                    requested: owned + 1,
                });
            }
        }
        if let Some(limit) = quota.total_vm_quota {
            let owned = self
                .store
                .appliances()
                .iter()
                .filter(|a| a.is_active() && a.owner.as_deref() == Some(user))
                .count() as u32;
            if owned + count > limit {
                return Err(ViveroError::QuotaExceeded {
                    quota: QuotaKind::TotalVms,
                    limit,
                    requested: owned + count,
                });
            }
        }
        Ok(())
    }

    /// Place one appliance for the pool: a warm unassigned appliance when
    /// one matches, otherwise a fresh queued row on an eligible
    /// (provider, template) pair. `None` means no capacity right now.
    pub(crate) fn schedule_one(
        &self,
        pool: &AppliancePool,
        lease_minutes: u32,
        avoid: Option<&str>,
    ) -> Option<ApplianceId> {
        let _guard = self.scheduling.lock().expect("scheduling lock poisoned");
        self.schedule_inner(pool, lease_minutes, avoid)
    }

    fn schedule_inner(
        &self,
        pool: &AppliancePool,
        lease_minutes: u32,
        avoid: Option<&str>,
    ) -> Option<ApplianceId> {
        let provider_pin = pool.metadata.get("provider").and_then(Value::as_str);
        let template_pin = pool.metadata.get("template").and_then(Value::as_str);
        let pin_ok = |t: &Template| {
            provider_pin.map_or(true, |p| t.provider == p)
                && template_pin.map_or(true, |n| t.name == n)
        };

        // Warm pool first: a ready unassigned appliance is leased in
        // without any provisioning.
        for appliance in self.store.unassigned_ready() {
            let Ok(template) = self.store.template(appliance.template) else {
                continue;
            };
            if !pin_ok(&template)
                || !scheduler::template_eligible(&self.store, self.clock(), pool, &template)
            {
                continue;
            }
            let now = self.clock.now();
            let lease = chrono::Duration::minutes(i64::from(lease_minutes));
            let assigned = self.store.update_appliance(appliance.id, |row| {
                row.appliance_pool = Some(pool.id);
                row.owner = Some(pool.owner.clone());
                row.datetime_leased = Some(now);
                row.leased_until = Some(now + lease);
            });
            if assigned.is_ok() {
                debug!(appliance = %appliance.id, pool = %pool.id, "warm appliance leased in");
                return Some(appliance.id);
            }
        }

        let template = scheduler::eligible_templates(&self.store, self.clock(), pool, avoid)
            .into_iter()
            .find(pin_ok)?;
        let now = self.clock.now();
        let id = self.store.insert_appliance(Appliance {
            id: ApplianceId(0),
            name: appliance_name(&template),
            uuid: Some(Uuid::new_v4()),
            template: template.id,
            appliance_pool: Some(pool.id),
            owner: Some(pool.owner.clone()),
            ip_address: None,
            ready: false,
            exists: false,
            power_state: PowerState::Unknown,
            power_state_changed: now,
            status: ProvisionState::Queued,
            status_changed: now,
            datetime_leased: None,
            leased_until: None,
            description: format!("Cloned from {}", template.name),
            lun_disk_connected: false,
            marked_for_deletion: false,
            metadata: json!({ "lease_minutes": lease_minutes }),
        });
        self.send_order(WorkerOrder::Provision { appliance: id });
        Some(id)
    }

    /// Queue a warm-pool appliance from the given template, owned by
    /// nobody until a pool leases it in.
    pub(crate) fn spawn_shepherd_appliance(&self, template: &Template) -> ApplianceId {
        let _guard = self.scheduling.lock().expect("scheduling lock poisoned");
        let now = self.clock.now();
        let id = self.store.insert_appliance(Appliance {
            id: ApplianceId(0),
            name: appliance_name(template),
            uuid: Some(Uuid::new_v4()),
            template: template.id,
            appliance_pool: None,
            owner: None,
            ip_address: None,
            ready: false,
            exists: false,
            power_state: PowerState::Unknown,
            power_state_changed: now,
            status: ProvisionState::Queued,
            status_changed: now,
            datetime_leased: None,
            leased_until: None,
            description: format!("Warm appliance from {}", template.name),
            lun_disk_connected: false,
            marked_for_deletion: false,
            metadata: json!({}),
        });
        self.send_order(WorkerOrder::Provision { appliance: id });
        id
    }

    /// Fulfillment status of a pool in wire form
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown pools.
    pub fn request_check(&self, pool: PoolId) -> ViveroResult<Value> {
        let row = self.store.pool(pool)?;
        let appliances: Vec<Value> = self
            .store
            .appliances_in_pool(pool)
            .iter()
            .map(Appliance::serialized)
            .collect();
        Ok(json!({
            "fulfilled": self.store.pool_fulfilled(pool)?,
            "progress": self.store.pool_percent_finished(pool)?,
            "finished": row.finished,
            "preconfigured": row.preconfigured,
            "queued_provision_tasks": self
                .store
                .tasks_for_pool(pool)
                .iter()
                .map(|t| t.id.0)
                .collect::<Vec<_>>(),
            "appliances": appliances,
        }))
    }

    /// Mark a pool as given up; the reaper cancels its pending tasks and
    /// tears its appliances down.
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown pools and
    /// [`ViveroError::NotOwner`] for foreign ones.
    pub fn destroy_pool(&self, caller: &Caller, pool: PoolId) -> ViveroResult<()> {
        let row = self.store.pool(pool)?;
        ensure_owner(caller, Some(row.owner.as_str()), "pool")?;
        let _ = self.store.update_pool(pool, |p| p.not_needed_anymore = true)?;
        info!(pool = %pool, "pool marked not needed");
        Ok(())
    }

    /// Whether the pool row exists
    #[must_use]
    pub fn pool_exists(&self, pool: PoolId) -> bool {
        self.store.pool_exists(pool)
    }

    /// Extend the lease of every appliance in the pool. Zero minutes
    /// leaves the leases untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown pools and
    /// [`ViveroError::NotOwner`] for foreign ones.
    pub fn prolong_appliance_pool_lease(
        &self,
        caller: &Caller,
        pool: PoolId,
        minutes: u32,
    ) -> ViveroResult<()> {
        let row = self.store.pool(pool)?;
        ensure_owner(caller, Some(row.owner.as_str()), "pool")?;
        if minutes == 0 {
            return Ok(());
        }
        let now = self.clock.now();
        let lease = chrono::Duration::minutes(i64::from(minutes));
        for appliance in self.store.appliances_in_pool(pool) {
            if appliance.is_active() {
                let _ = self.store.update_appliance(appliance.id, |a| {
                    a.leased_until = Some(now + lease);
                })?;
            }
        }
        Ok(())
    }

    /// Change a pool's description
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown pools and
    /// [`ViveroError::NotOwner`] for foreign ones.
    pub fn set_pool_description(
        &self,
        caller: &Caller,
        pool: PoolId,
        description: &str,
    ) -> ViveroResult<()> {
        let row = self.store.pool(pool)?;
        ensure_owner(caller, Some(row.owner.as_str()), "pool")?;
        let _ = self
            .store
            .update_pool(pool, |p| p.description = description.to_string())?;
        Ok(())
    }

    /// A pool's description
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown pools.
    pub fn get_pool_description(&self, pool: PoolId) -> ViveroResult<String> {
        Ok(self.store.pool(pool)?.description)
    }

    /// Ids of pools whose description contains the given fragment
    #[must_use]
    pub fn find_pools_by_description(&self, fragment: &str) -> Vec<u64> {
        self.store
            .pools()
            .into_iter()
            .filter(|p| p.description.contains(fragment))
            .map(|p| p.id.0)
            .collect()
    }

    // ------------------------------------------------------------------
    // Appliance operations
    // ------------------------------------------------------------------

    /// Extend an appliance lease. Zero minutes leaves `leased_until`
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown appliances and
    /// [`ViveroError::NotOwner`] for foreign ones.
    pub fn prolong_appliance_lease(
        &self,
        caller: &Caller,
        identifier: &str,
        minutes: u32,
    ) -> ViveroResult<Value> {
        let appliance = self.store.find_appliance(identifier)?;
        ensure_owner(caller, appliance.owner.as_deref(), "appliance")?;
        if minutes == 0 {
            return Ok(appliance.serialized());
        }
        let now = self.clock.now();
        let lease = chrono::Duration::minutes(i64::from(minutes));
        let updated = self.store.update_appliance(appliance.id, |a| {
            a.leased_until = Some(now + lease);
        })?;
        Ok(updated.serialized())
    }

    /// Request appliance teardown. Idempotent from any state: returns
    /// `false` when the appliance is already destroyed or marked.
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown appliances and
    /// [`ViveroError::NotOwner`] for foreign ones.
    pub fn kill_appliance(&self, caller: &Caller, identifier: &str) -> ViveroResult<bool> {
        let appliance = self.store.find_appliance(identifier)?;
        ensure_owner(caller, appliance.owner.as_deref(), "appliance")?;
        if appliance.marked_for_deletion || !appliance.is_active() {
            return Ok(false);
        }
        let now = self.clock.now();
        let _ = self.store.update_appliance(appliance.id, |a| {
            a.marked_for_deletion = true;
            a.status = ProvisionState::Destroying;
            a.status_changed = now;
        })?;
        self.send_order(WorkerOrder::Kill {
            appliance: appliance.id,
        });
        info!(appliance = %appliance.id, "kill requested");
        Ok(true)
    }

    /// Power an appliance on
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown appliances and
    /// [`ViveroError::NotOwner`] for foreign ones.
    pub fn power_on(&self, caller: &Caller, identifier: &str) -> ViveroResult<()> {
        self.power_order(caller, identifier, |id| WorkerOrder::PowerOn { appliance: id })
    }

    /// Power an appliance off
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown appliances and
    /// [`ViveroError::NotOwner`] for foreign ones.
    pub fn power_off(&self, caller: &Caller, identifier: &str) -> ViveroResult<()> {
        self.power_order(caller, identifier, |id| WorkerOrder::PowerOff { appliance: id })
    }

    /// Suspend an appliance
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown appliances and
    /// [`ViveroError::NotOwner`] for foreign ones.
    pub fn suspend(&self, caller: &Caller, identifier: &str) -> ViveroResult<()> {
        self.power_order(caller, identifier, |id| WorkerOrder::Suspend { appliance: id })
    }

    fn power_order(
        &self,
        caller: &Caller,
        identifier: &str,
        order: impl FnOnce(ApplianceId) -> WorkerOrder,
    ) -> ViveroResult<()> {
        let appliance = self.store.find_appliance(identifier)?;
        ensure_owner(caller, appliance.owner.as_deref(), "appliance")?;
        if !appliance.is_active() {
            return Err(ViveroError::Invalid {
                field: "appliance".to_string(),
                message: "already destroyed".to_string(),
            });
        }
        self.send_order(order(appliance.id));
        Ok(())
    }

    /// Last observed power state of an appliance, by id, IP, or name
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] when nothing matches.
    pub fn power_state(&self, identifier: &str) -> ViveroResult<&'static str> {
        Ok(self.store.find_appliance(identifier)?.power_state.as_str())
    }

    /// Appliances in wire form, optionally restricted to one owner
    #[must_use]
    pub fn list_appliances(&self, owner: Option<&str>) -> Vec<Value> {
        self.store
            .appliances()
            .iter()
            .filter(|a| owner.is_none() || a.owner.as_deref() == owner)
            .map(Appliance::serialized)
            .collect()
    }

    /// Ready unassigned appliances, optionally restricted to one group
    #[must_use]
    pub fn num_shepherd_appliances(&self, group: Option<&str>) -> u32 {
        self.store
            .unassigned_ready()
            .iter()
            .filter(|a| {
                group.is_none()
                    || self
                        .store
                        .template(a.template)
                        .map(|t| Some(t.template_group.as_str()) == group)
                        .unwrap_or(false)
            })
            .count() as u32
    }

    // ------------------------------------------------------------------
    // Settings and catalogs
    // ------------------------------------------------------------------

    /// Target size of a group's preconfigured warm pool
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown groups.
    pub fn get_number_free_appliances(&self, group: &str) -> ViveroResult<u32> {
        Ok(self.store.group(group)?.template_pool_size)
    }

    /// Set the target size of a group's preconfigured warm pool. Staff
    /// only.
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::Forbidden`] for non-staff callers and
    /// [`ViveroError::NotFound`] for unknown groups.
    pub fn set_number_free_appliances(
        &self,
        caller: &Caller,
        group: &str,
        n: u32,
    ) -> ViveroResult<()> {
        ensure_staff(caller)?;
        let _ = self.store.update_group(group, |g| g.template_pool_size = n)?;
        Ok(())
    }

    /// Product versions available for a group, newest first
    #[must_use]
    pub fn available_cfme_versions(
        &self,
        group: Option<&str>,
        preconfigured: bool,
    ) -> Vec<String> {
        scheduler::available_versions(&self.store, group, preconfigured)
    }

    /// Known template groups
    #[must_use]
    pub fn available_groups(&self) -> Vec<String> {
        self.store.groups().into_iter().map(|g| g.id).collect()
    }

    /// Known providers
    #[must_use]
    pub fn available_providers(&self) -> Vec<String> {
        self.store.providers().into_iter().map(|p| p.id).collect()
    }

    /// Register a provider by key. Staff only. Returns `false` when the
    /// provider row already existed. A provider without a connected
    /// client gets a simulated one.
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::Forbidden`] for non-staff callers.
    pub fn add_provider(&self, caller: &Caller, key: &str) -> ViveroResult<bool> {
        ensure_staff(caller)?;
        let added = self.store.add_provider(Provider::new(key));
        if self.providers.get(key).is_err() {
            self.providers
                .register(key, Arc::new(SimProvider::new(key)));
        }
        if added {
            info!(provider = key, "provider added");
        }
        Ok(added)
    }
}

fn appliance_name(template: &Template) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", template.template_group, &suffix[..8])
}

fn ensure_owner(caller: &Caller, owner: Option<&str>, kind: &'static str) -> ViveroResult<()> {
    if caller.staff || owner == Some(caller.name.as_str()) {
        Ok(())
    } else {
        Err(ViveroError::NotOwner { kind })
    }
}

fn ensure_staff(caller: &Caller) -> ViveroResult<()> {
    if caller.staff {
        Ok(())
    } else {
        Err(ViveroError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::Group;
    use chrono::{TimeZone, Utc};

    fn template_row(provider: &str, group: &str, name: &str, version: &str) -> Template {
        Template {
            id: crate::models::TemplateId(0),
            provider: provider.to_string(),
            template_group: group.to_string(),
            name: name.to_string(),
            original_name: name.to_string(),
            version: Some(version.to_string()),
            date: chrono::NaiveDate::from_ymd_opt(2018, 5, 1).expect("valid date"),
            ready: true,
            exists: true,
            usable: true,
            preconfigured: true,
            suggested_delete: false,
            metadata: json!({}),
        }
    }

    struct Fixture {
        service: Arc<PoolService>,
        clock: Arc<ManualClock>,
    }

    fn fixture(with_template: bool) -> Fixture {
        let store = Arc::new(Store::new());
        assert!(store.add_provider(Provider::new("vsphere-1")));
        store.upsert_group(Group::new("cfme-59"));
        if with_template {
            let _ = store.insert_template(template_row(
                "vsphere-1",
                "cfme-59",
                "cfme-59-tpl",
                "5.9.0",
            ));
        }
        let providers = Arc::new(ProviderDirectory::new());
        providers.register("vsphere-1", Arc::new(SimProvider::new("vsphere-1")));
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2018, 5, 10, 12, 0, 0).unwrap(),
        ));
        let (service, _orders) = PoolService::new(store, providers, clock.clone(), None);
        Fixture { service, clock }
    }

    #[test]
    fn test_quota_rejection_writes_nothing() {
        let fx = fixture(true);
        fx.service.store().set_quota(crate::models::UserApplianceQuota {
            user: "tester".to_string(),
            per_pool_quota: Some(3),
            total_pool_quota: None,
            total_vm_quota: None,
        });

        let mut req = PoolRequest::new("cfme-59");
        req.count = 4;
        let err = fx
            .service
            .request_appliances(&Caller::user("tester"), req)
            .unwrap_err();
        assert!(matches!(
            err,
            ViveroError::QuotaExceeded {
                quota: QuotaKind::PerPool,
                limit: 3,
                requested: 4,
            }
        ));
        assert!(fx.service.store().pools().is_empty());
        assert!(fx.service.store().appliances().is_empty());
    }

    #[test]
    fn test_total_vm_quota_counts_existing_appliances() {
        let fx = fixture(true);
        fx.service.store().set_quota(crate::models::UserApplianceQuota {
            user: "tester".to_string(),
            per_pool_quota: None,
            total_pool_quota: None,
            total_vm_quota: Some(2),
        });
        let caller = Caller::user("tester");
        let _ = fx
            .service
            .request_appliances(&caller, PoolRequest::new("cfme-59"))
            .unwrap();

        let mut req = PoolRequest::new("cfme-59");
        req.count = 2;
        let err = fx.service.request_appliances(&caller, req).unwrap_err();
        assert!(matches!(
            err,
            ViveroError::QuotaExceeded {
                quota: QuotaKind::TotalVms,
                ..
            }
        ));
    }

    #[test]
    fn test_request_without_capacity_queues_delayed_tasks() {
        let fx = fixture(false);
        let mut req = PoolRequest::new("cfme-59");
        req.count = 2;
        let pool = fx
            .service
            .request_appliances(&Caller::user("tester"), req)
            .unwrap();

        assert_eq!(fx.service.store().tasks_for_pool(pool).len(), 2);
        let check = fx.service.request_check(pool).unwrap();
        assert_eq!(check["fulfilled"], json!(false));
        assert_eq!(check["appliances"], json!([]));
    }

    #[test]
    fn test_request_with_capacity_queues_appliances() {
        let fx = fixture(true);
        let pool = fx
            .service
            .request_appliances(&Caller::user("tester"), PoolRequest::new("cfme-59"))
            .unwrap();

        assert!(fx.service.store().tasks_for_pool(pool).is_empty());
        let rows = fx.service.store().appliances_in_pool(pool);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ProvisionState::Queued);
        assert_eq!(rows[0].owner.as_deref(), Some("tester"));
        // Pool pinned to the latest available version
        assert_eq!(
            fx.service.store().pool(pool).unwrap().version.as_deref(),
            Some("5.9.0")
        );
    }

    #[test]
    fn test_warm_appliance_leased_in_before_provisioning() {
        let fx = fixture(true);
        let store = fx.service.store();
        let template = store.templates()[0].id;
        let now = fx.clock.now();
        let warm = store.insert_appliance(Appliance {
            id: ApplianceId(0),
            name: "warm-1".to_string(),
            uuid: None,
            template,
            appliance_pool: None,
            owner: None,
            ip_address: Some("10.0.0.3".to_string()),
            ready: true,
            exists: true,
            power_state: PowerState::On,
            power_state_changed: now,
            status: ProvisionState::Ready,
            status_changed: now,
            datetime_leased: None,
            leased_until: None,
            description: String::new(),
            lun_disk_connected: false,
            marked_for_deletion: false,
            metadata: json!({}),
        });

        let pool = fx
            .service
            .request_appliances(&Caller::user("tester"), PoolRequest::new("cfme-59"))
            .unwrap();

        let row = fx.service.store().appliance(warm).unwrap();
        assert_eq!(row.appliance_pool, Some(pool));
        assert_eq!(row.owner.as_deref(), Some("tester"));
        assert!(row.leased_until.is_some());
        assert!(fx.service.store().pool_fulfilled(pool).unwrap());
    }

    #[test]
    fn test_prolong_zero_is_noop() {
        let fx = fixture(true);
        let caller = Caller::user("tester");
        let pool = fx
            .service
            .request_appliances(&caller, PoolRequest::new("cfme-59"))
            .unwrap();
        let id = fx.service.store().appliances_in_pool(pool)[0].id;
        let before = fx
            .service
            .store()
            .update_appliance(id, |a| {
                a.leased_until = Some(fx.clock.now());
            })
            .unwrap()
            .leased_until;

        fx.clock.advance(chrono::Duration::minutes(5));
        let _ = fx
            .service
            .prolong_appliance_lease(&caller, &id.0.to_string(), 0)
            .unwrap();
        assert_eq!(fx.service.store().appliance(id).unwrap().leased_until, before);

        let _ = fx
            .service
            .prolong_appliance_lease(&caller, &id.0.to_string(), 60)
            .unwrap();
        let prolonged = fx.service.store().appliance(id).unwrap().leased_until;
        assert_eq!(
            prolonged,
            Some(fx.clock.now() + chrono::Duration::minutes(60))
        );
    }

    #[test]
    fn test_double_kill_is_noop() {
        let fx = fixture(true);
        let caller = Caller::user("tester");
        let pool = fx
            .service
            .request_appliances(&caller, PoolRequest::new("cfme-59"))
            .unwrap();
        let id = fx.service.store().appliances_in_pool(pool)[0].id;

        assert!(fx.service.kill_appliance(&caller, &id.0.to_string()).unwrap());
        assert!(!fx.service.kill_appliance(&caller, &id.0.to_string()).unwrap());
        let row = fx.service.store().appliance(id).unwrap();
        assert_eq!(row.status, ProvisionState::Destroying);
    }

    #[test]
    fn test_foreign_objects_need_staff() {
        let fx = fixture(true);
        let pool = fx
            .service
            .request_appliances(&Caller::user("tester"), PoolRequest::new("cfme-59"))
            .unwrap();

        let err = fx
            .service
            .destroy_pool(&Caller::user("intruder"), pool)
            .unwrap_err();
        assert!(matches!(err, ViveroError::NotOwner { kind: "pool" }));

        fx.service.destroy_pool(&Caller::staff("admin"), pool).unwrap();
        assert!(fx.service.store().pool(pool).unwrap().not_needed_anymore);
    }

    #[test]
    fn test_free_appliance_count_round_trip() {
        let fx = fixture(true);
        let err = fx
            .service
            .set_number_free_appliances(&Caller::user("tester"), "cfme-59", 2)
            .unwrap_err();
        assert!(matches!(err, ViveroError::Forbidden));

        fx.service
            .set_number_free_appliances(&Caller::staff("admin"), "cfme-59", 2)
            .unwrap();
        assert_eq!(fx.service.get_number_free_appliances("cfme-59").unwrap(), 2);
        fx.service
            .set_number_free_appliances(&Caller::staff("admin"), "cfme-59", 0)
            .unwrap();
        assert_eq!(fx.service.get_number_free_appliances("cfme-59").unwrap(), 0);
    }

    #[test]
    fn test_catalogs() {
        let fx = fixture(true);
        assert_eq!(fx.service.available_groups(), vec!["cfme-59".to_string()]);
        assert_eq!(
            fx.service.available_providers(),
            vec!["vsphere-1".to_string()]
        );
        assert_eq!(
            fx.service.available_cfme_versions(Some("cfme-59"), true),
            vec!["5.9.0".to_string()]
        );

        assert!(fx
            .service
            .add_provider(&Caller::staff("admin"), "rhev-1")
            .unwrap());
        assert!(!fx
            .service
            .add_provider(&Caller::staff("admin"), "rhev-1")
            .unwrap());
        assert!(fx.service.providers().get("rhev-1").is_ok());
    }

    #[test]
    fn test_power_state_by_identifier() {
        let fx = fixture(true);
        let pool = fx
            .service
            .request_appliances(&Caller::user("tester"), PoolRequest::new("cfme-59"))
            .unwrap();
        let rows = fx.service.store().appliances_in_pool(pool);
        let row = &rows[0];

        assert_eq!(fx.service.power_state(&row.id.0.to_string()).unwrap(), "unknown");
        assert_eq!(fx.service.power_state(&row.name).unwrap(), "unknown");
        assert!(fx.service.power_state("10.255.0.1").is_err());
    }

    #[test]
    fn test_pool_description_search() {
        let fx = fixture(true);
        let caller = Caller::user("tester");
        let pool = fx
            .service
            .request_appliances(&caller, PoolRequest::new("cfme-59"))
            .unwrap();

        fx.service
            .set_pool_description(&caller, pool, "smoke run")
            .unwrap();
        assert_eq!(fx.service.get_pool_description(pool).unwrap(), "smoke run");
        assert_eq!(fx.service.find_pools_by_description("smoke"), vec![pool.0]);
        assert!(fx.service.find_pools_by_description("nightly").is_empty());
    }
}
