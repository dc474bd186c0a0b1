//! Background workers: the order consumer and the periodic control loops.
//!
//! Every handler is idempotent under at-least-once delivery. The order
//! queue is a fast path only; each control loop re-derives pending work
//! from the store, so a dropped or duplicated order never loses or
//! doubles an appliance. All tick bodies are plain async methods callable
//! directly from tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::ViveroResult;
use crate::models::{
    version_from_name, Appliance, ApplianceId, DelayedProvisionTask, MismatchVersionMailer,
    PowerState, ProvisionState, TaskId, Template,
};
use crate::scheduler;
use crate::service::PoolService;

/// Lease length applied when a delayed task carries none
pub const DEFAULT_LEASE_MINUTES: u32 = 60;

/// Work handed from request handlers to the workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOrder {
    /// Drive a queued appliance through provisioning
    Provision {
        /// The queued appliance row
        appliance: ApplianceId,
    },
    /// Power the appliance on
    PowerOn {
        /// The appliance row
        appliance: ApplianceId,
    },
    /// Power the appliance off
    PowerOff {
        /// The appliance row
        appliance: ApplianceId,
    },
    /// Suspend the appliance
    Suspend {
        /// The appliance row
        appliance: ApplianceId,
    },
    /// Tear a marked appliance down
    Kill {
        /// The appliance row
        appliance: ApplianceId,
    },
}

enum PowerOp {
    On,
    Off,
    Suspend,
}

/// Delivery seam for version-mismatch notifications
pub trait Notifier: Send + Sync {
    /// Deliver one mismatch notification. An error leaves the row unsent
    /// for the next flush.
    ///
    /// # Errors
    ///
    /// Implementations surface delivery failures.
    fn deliver(&self, mailer: &MismatchVersionMailer) -> ViveroResult<()>;
}

/// Notifier that writes mismatches to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn deliver(&self, mailer: &MismatchVersionMailer) -> ViveroResult<()> {
        warn!(
            provider = %mailer.provider,
            template = %mailer.template_name,
            supposed = %mailer.supposed_version,
            actual = %mailer.actual_version,
            "template version mismatch"
        );
        Ok(())
    }
}

/// The background worker set
pub struct Workers {
    service: Arc<PoolService>,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workers").finish_non_exhaustive()
    }
}

impl Workers {
    /// Workers over the given service
    #[must_use]
    pub fn new(service: Arc<PoolService>, notifier: Arc<dyn Notifier>) -> Arc<Self> {
        Arc::new(Self { service, notifier })
    }

    // ------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------

    /// Drive one queued appliance through clone, power-on, and address
    /// acquisition. A row that is no longer `Queued` is left alone, which
    /// makes redelivered orders harmless. Provisioning failures mark the
    /// row `Error` and requeue a delayed task biased away from the failed
    /// provider.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ViveroError::NotFound`] for unknown rows.
    pub async fn provision_appliance(&self, id: ApplianceId) -> ViveroResult<()> {
        let store = self.service.store();
        let now = self.service.clock().now();
        let mut claimed = false;
        let appliance = store.update_appliance(id, |a| {
            if a.status == ProvisionState::Queued && !a.marked_for_deletion {
                a.status = ProvisionState::Provisioning;
                a.status_changed = now;
                claimed = true;
            }
        })?;
        if !claimed {
            return Ok(());
        }

        let template = match store.template(appliance.template) {
            Ok(template) => template,
            Err(err) => {
                warn!(appliance = %id, %err, "queued appliance has no template");
                self.fail_provision(&appliance, None);
                return Ok(());
            }
        };
        let client = match self.service.providers().get(&template.provider) {
            Ok(client) => client,
            Err(err) => {
                warn!(appliance = %id, provider = %template.provider, %err,
                      "provider not connected");
                self.fail_provision(&appliance, Some(&template.provider));
                return Ok(());
            }
        };

        if let Err(err) = client.clone_template(&template.name, &appliance.name).await {
            warn!(appliance = %id, template = %template.name, %err, "clone failed");
            self.fail_provision(&appliance, Some(&template.provider));
            return Ok(());
        }
        let now = self.service.clock().now();
        let _ = store.update_appliance(id, |a| {
            a.exists = true;
            a.status = ProvisionState::Configuring;
            a.status_changed = now;
        })?;

        if let Err(err) = client.power_on(&appliance.name).await {
            warn!(appliance = %id, %err, "power-on failed");
            self.fail_provision(&appliance, Some(&template.provider));
            return Ok(());
        }
        let ip = client.vm_ip(&appliance.name).await.unwrap_or(None);
        let power = client
            .power_state(&appliance.name)
            .await
            .unwrap_or(PowerState::Unknown);

        let lease_minutes = appliance
            .metadata
            .get("lease_minutes")
            .and_then(Value::as_u64);
        let now = self.service.clock().now();
        let _ = store.update_appliance(id, |a| {
            a.ip_address = ip.clone();
            a.power_state = power;
            a.power_state_changed = now;
            a.ready = true;
            a.status = ProvisionState::Ready;
            a.status_changed = now;
            if a.appliance_pool.is_some() {
                if let Some(minutes) = lease_minutes {
                    a.datetime_leased = Some(now);
                    a.leased_until =
                        Some(now + chrono::Duration::minutes(minutes as i64));
                }
            }
        })?;
        info!(appliance = %id, ip = ?ip, "appliance ready");
        Ok(())
    }

    fn fail_provision(&self, appliance: &Appliance, provider: Option<&str>) {
        let store = self.service.store();
        let now = self.service.clock().now();
        let _ = store.update_appliance(appliance.id, |a| {
            a.status = ProvisionState::Error;
            a.status_changed = now;
        });
        if let Some(pool) = appliance.appliance_pool {
            let lease = appliance
                .metadata
                .get("lease_minutes")
                .and_then(Value::as_u64)
                .map(|m| m as u32);
            let _ = store.insert_task(DelayedProvisionTask {
                id: TaskId(0),
                pool,
                lease_time: lease,
                provider_to_avoid: provider.map(ToString::to_string),
            });
        }
    }

    // ------------------------------------------------------------------
    // Control loops
    // ------------------------------------------------------------------

    /// Process delayed tasks in id order, top warm pools up, and drive
    /// any still-queued appliance rows.
    pub async fn fulfillment_tick(&self) {
        let store = self.service.store();

        for task in store.delayed_tasks() {
            let Ok(pool) = store.pool(task.pool) else {
                let _ = store.remove_task(task.id);
                continue;
            };
            if pool.not_needed_anymore {
                let _ = store.remove_task(task.id);
                continue;
            }
            let healthy = store
                .appliances_in_pool(pool.id)
                .iter()
                .filter(|a| {
                    a.is_active()
                        && a.status != ProvisionState::Error
                        && !a.marked_for_deletion
                })
                .count() as u32;
            if healthy >= pool.num_appliances {
                let _ = store.remove_task(task.id);
                continue;
            }
            let lease = task.lease_time.unwrap_or(DEFAULT_LEASE_MINUTES);
            if self
                .service
                .schedule_one(&pool, lease, task.provider_to_avoid.as_deref())
                .is_some()
            {
                let _ = store.remove_task(task.id);
            }
        }

        for group in store.groups() {
            for (preconfigured, target) in [
                (true, group.template_pool_size),
                (false, group.unconfigured_template_pool_size),
            ] {
                if target == 0 {
                    continue;
                }
                let current = store
                    .appliances()
                    .iter()
                    .filter(|a| {
                        a.appliance_pool.is_none()
                            && a.is_active()
                            && a.status != ProvisionState::Error
                            && !a.marked_for_deletion
                            && store
                                .template(a.template)
                                .map(|t| {
                                    t.template_group == group.id
                                        && t.preconfigured == preconfigured
                                })
                                .unwrap_or(false)
                    })
                    .count() as u32;
                for _ in current..target {
                    let candidates = scheduler::shepherd_templates(
                        store,
                        self.service.clock(),
                        &group.id,
                        preconfigured,
                    );
                    let Some(template) = candidates.first() else {
                        break;
                    };
                    let _ = self.service.spawn_shepherd_appliance(template);
                }
            }
        }

        for appliance in store.appliances() {
            if appliance.status == ProvisionState::Queued && !appliance.marked_for_deletion {
                if let Err(err) = self.provision_appliance(appliance.id).await {
                    warn!(appliance = %appliance.id, %err, "provisioning failed");
                }
            }
        }
    }

    /// Mark expired leases and given-up pools for teardown, destroy
    /// marked appliances, and drop pools that are fully torn down.
    pub async fn reaper_tick(&self) {
        let store = self.service.store();
        let now = self.service.clock().now();

        for appliance in store.appliances() {
            let expired = appliance
                .leased_until
                .map_or(false, |until| until < now);
            if appliance.is_active() && !appliance.marked_for_deletion && expired {
                info!(appliance = %appliance.id, "lease expired");
                let _ = store.update_appliance(appliance.id, |a| {
                    a.marked_for_deletion = true;
                    a.status = ProvisionState::Destroying;
                    a.status_changed = now;
                });
            }
        }

        for pool in store.pools() {
            if !pool.not_needed_anymore {
                continue;
            }
            // Pending work is cancelled before any appliance dies
            for task in store.tasks_for_pool(pool.id) {
                let _ = store.remove_task(task.id);
            }
            for appliance in store.appliances_in_pool(pool.id) {
                if appliance.is_active() && !appliance.marked_for_deletion {
                    let _ = store.update_appliance(appliance.id, |a| {
                        a.marked_for_deletion = true;
                        a.status = ProvisionState::Destroying;
                        a.status_changed = now;
                    });
                }
            }
        }

        for appliance in store.appliances() {
            if appliance.marked_for_deletion && appliance.is_active() {
                self.teardown(&appliance).await;
            }
        }

        for pool in store.pools() {
            if pool.not_needed_anymore
                && store.pool_current_count(pool.id) == 0
                && store.tasks_for_pool(pool.id).is_empty()
            {
                let _ = store.update_pool(pool.id, |p| p.finished = true);
                store.remove_pool(pool.id);
                info!(pool = %pool.id, "pool torn down");
            }
        }
    }

    async fn teardown(&self, appliance: &Appliance) {
        let store = self.service.store();
        let client = store
            .template(appliance.template)
            .ok()
            .and_then(|t| self.service.providers().get(&t.provider).ok());
        if let Some(client) = client {
            // An already-gone VM reports false here, which is fine
            if let Err(err) = client.destroy_vm(&appliance.name).await {
                warn!(appliance = %appliance.id, %err, "destroy failed; will retry");
                return;
            }
        }
        let now = self.service.clock().now();
        let _ = store.update_appliance(appliance.id, |a| {
            a.status = ProvisionState::Destroyed;
            a.status_changed = now;
            a.exists = false;
            a.ready = false;
            a.power_state = PowerState::Unknown;
            a.power_state_changed = now;
        });
    }

    /// Reconcile recorded power state and existence against observation
    pub async fn reconcile_tick(&self) {
        let store = self.service.store();
        for appliance in store.appliances() {
            // Rows the provisioner has not reached yet have no VM to ask
            if !appliance.is_active()
                || matches!(
                    appliance.status,
                    ProvisionState::Queued | ProvisionState::Provisioning
                )
            {
                continue;
            }
            let Ok(template) = store.template(appliance.template) else {
                continue;
            };
            let Ok(client) = self.service.providers().get(&template.provider) else {
                continue;
            };
            let exists = client.vm_exists(&appliance.name).await.unwrap_or(false);
            let observed = if exists {
                client
                    .power_state(&appliance.name)
                    .await
                    .unwrap_or(PowerState::Unknown)
            } else {
                PowerState::Unknown
            };
            if observed != appliance.power_state || exists != appliance.exists {
                let now = self.service.clock().now();
                let _ = store.update_appliance(appliance.id, |a| {
                    if a.power_state != observed {
                        a.power_state = observed;
                        a.power_state_changed = now;
                    }
                    a.exists = exists;
                });
            }
        }
    }

    /// Refresh template versions and existence from the providers; a
    /// name-encoded vs actual version divergence becomes a deduplicated
    /// mismatch row.
    pub async fn scan_tick(&self) {
        let store = self.service.store();
        for key in self.service.providers().keys() {
            let Ok(client) = self.service.providers().get(&key) else {
                continue;
            };
            let Ok(names) = client.list_templates().await else {
                continue;
            };
            for template in store.templates().into_iter().filter(|t| t.provider == key) {
                let present = names.iter().any(|n| *n == template.name);
                if present != template.exists {
                    let _ = store.update_template(template.id, |t| t.exists = present);
                }
                if !present {
                    continue;
                }
                let Ok(Some(actual)) = client.template_version(&template.name).await else {
                    continue;
                };
                if template.version.as_deref() != Some(actual.as_str()) {
                    let _ = store
                        .update_template(template.id, |t| t.version = Some(actual.clone()));
                }
                if let Some(supposed) = version_from_name(&template.name) {
                    if supposed != actual
                        && store
                            .record_mismatch(&key, &template.name, &supposed, &actual)
                            .is_some()
                    {
                        debug!(template = %template.name, "mismatch recorded");
                    }
                }
            }
        }
    }

    /// Flag obsolete templates and, where the group opts in, delete them
    /// via the configured automation script.
    pub async fn obsolete_tick(&self) {
        let store = self.service.store();
        let today = self.service.clock().now().date_naive();
        for group in store.groups() {
            let Some(days) = group.template_obsolete_days else {
                continue;
            };
            let cutoff = today - chrono::Duration::days(i64::from(days));
            let obsolete: Vec<Template> = store
                .templates()
                .into_iter()
                .filter(|t| t.template_group == group.id && t.exists && t.date <= cutoff)
                .collect();
            for template in &obsolete {
                if !template.suggested_delete {
                    let _ = store.update_template(template.id, |t| t.suggested_delete = true);
                }
            }
            if !group.template_obsolete_days_delete {
                continue;
            }
            for template in &obsolete {
                if let Some(script) = &group.templates_delete_script {
                    if let Err(message) = run_delete_script(script, template).await {
                        warn!(template = %template.name, %message, "delete script failed");
                        let _ = store.update_group(&group.id, |g| {
                            g.last_delete_script_exception = Some(message.clone());
                        });
                        continue;
                    }
                }
                if let Ok(client) = self.service.providers().get(&template.provider) {
                    if let Err(err) = client.delete_template(&template.name).await {
                        warn!(template = %template.name, %err, "provider delete failed");
                        continue;
                    }
                }
                let _ = store.update_template(template.id, |t| {
                    t.exists = false;
                    t.usable = false;
                });
                info!(template = %template.name, "obsolete template deleted");
            }
        }
    }

    /// Deliver unsent mismatch rows and mark them sent
    pub async fn mailer_tick(&self) {
        let store = self.service.store();
        for mailer in store.unsent_mailers() {
            match self.notifier.deliver(&mailer) {
                Ok(()) => store.mark_mailer_sent(mailer.id),
                Err(err) => warn!(mailer = %mailer.id, %err, "notification failed"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Order handling and task plumbing
    // ------------------------------------------------------------------

    /// Execute one order from the queue
    pub async fn handle_order(&self, order: WorkerOrder) {
        match order {
            WorkerOrder::Provision { appliance } => {
                if let Err(err) = self.provision_appliance(appliance).await {
                    warn!(%appliance, %err, "provisioning failed");
                }
            }
            WorkerOrder::PowerOn { appliance } => self.apply_power(appliance, PowerOp::On).await,
            WorkerOrder::PowerOff { appliance } => self.apply_power(appliance, PowerOp::Off).await,
            WorkerOrder::Suspend { appliance } => {
                self.apply_power(appliance, PowerOp::Suspend).await;
            }
            WorkerOrder::Kill { appliance } => {
                if let Ok(row) = self.service.store().appliance(appliance) {
                    if row.marked_for_deletion && row.is_active() {
                        self.teardown(&row).await;
                    }
                }
            }
        }
    }

    async fn apply_power(&self, id: ApplianceId, op: PowerOp) {
        let store = self.service.store();
        let Ok(appliance) = store.appliance(id) else {
            return;
        };
        let Ok(template) = store.template(appliance.template) else {
            return;
        };
        let Ok(client) = self.service.providers().get(&template.provider) else {
            return;
        };
        let result = match op {
            PowerOp::On => client.power_on(&appliance.name).await,
            PowerOp::Off => client.power_off(&appliance.name).await,
            PowerOp::Suspend => client.suspend(&appliance.name).await,
        };
        if let Err(err) = result {
            warn!(appliance = %id, %err, "power operation failed");
            return;
        }
        let observed = client
            .power_state(&appliance.name)
            .await
            .unwrap_or(PowerState::Unknown);
        if observed != appliance.power_state {
            let now = self.service.clock().now();
            let _ = store.update_appliance(id, |a| {
                a.power_state = observed;
                a.power_state_changed = now;
            });
        }
    }

    /// Spawn the order consumer and every periodic loop. Flip the watch
    /// channel to stop them.
    #[must_use]
    pub fn spawn(
        self: &Arc<Self>,
        mut orders: mpsc::Receiver<WorkerOrder>,
        cadences: &WorkerConfig,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let worker = Arc::clone(self);
        let mut order_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = order_shutdown.changed() => break,
                    order = orders.recv() => match order {
                        Some(order) => worker.handle_order(order).await,
                        None => break,
                    },
                }
            }
            debug!(worker = "orders", "stopping");
        }));

        handles.push(self.spawn_loop(
            "fulfillment",
            cadences.fulfillment_secs,
            shutdown.clone(),
            |w| async move { w.fulfillment_tick().await },
        ));
        handles.push(self.spawn_loop("reaper", cadences.reaper_secs, shutdown.clone(), |w| {
            async move { w.reaper_tick().await }
        }));
        handles.push(self.spawn_loop(
            "reconcile",
            cadences.reconcile_secs,
            shutdown.clone(),
            |w| async move { w.reconcile_tick().await },
        ));
        handles.push(self.spawn_loop("scan", cadences.scan_secs, shutdown.clone(), |w| {
            async move { w.scan_tick().await }
        }));
        handles.push(self.spawn_loop(
            "obsolete",
            cadences.obsolete_secs,
            shutdown.clone(),
            |w| async move { w.obsolete_tick().await },
        ));
        handles.push(self.spawn_loop("mailer", cadences.mailer_secs, shutdown.clone(), |w| {
            async move { w.mailer_tick().await }
        }));
        handles
    }

    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period_secs: u64,
        mut shutdown: watch::Receiver<bool>,
        tick: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(period_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => tick(Arc::clone(&worker)).await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!(worker = name, "stopping");
        })
    }
}

async fn run_delete_script(script: &str, template: &Template) -> Result<(), String> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .env("VIVERO_TEMPLATE", &template.name)
        .env("VIVERO_PROVIDER", &template.provider)
        .output()
        .await
        .map_err(|e| e.to_string())?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(if stderr.is_empty() {
            format!("delete script exited with {}", output.status)
        } else {
            stderr
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{Group, Provider, TemplateId};
    use crate::provider::{ProviderClient, ProviderDirectory, SimProvider};
    use crate::service::{Caller, PoolRequest};
    use crate::store::Store;
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<String>>);

    impl Notifier for Recording {
        fn deliver(&self, mailer: &MismatchVersionMailer) -> ViveroResult<()> {
            self.0
                .lock()
                .unwrap()
                .push(format!("{}:{}", mailer.template_name, mailer.actual_version));
            Ok(())
        }
    }

    struct Fixture {
        service: Arc<PoolService>,
        workers: Arc<Workers>,
        sim: Arc<SimProvider>,
        clock: Arc<ManualClock>,
        delivered: Arc<Recording>,
    }

    fn template_row(name: &str, version: &str, date: (i32, u32, u32)) -> Template {
        Template {
            id: TemplateId(0),
            provider: "vsphere-1".to_string(),
            template_group: "cfme-59".to_string(),
            name: name.to_string(),
            original_name: name.to_string(),
            version: Some(version.to_string()),
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).expect("valid date"),
            ready: true,
            exists: true,
            usable: true,
            preconfigured: true,
            suggested_delete: false,
            metadata: json!({}),
        }
    }

    fn fixture(with_template: bool) -> Fixture {
        let store = Arc::new(Store::new());
        assert!(store.add_provider(Provider::new("vsphere-1")));
        store.upsert_group(Group::new("cfme-59"));

        let sim = Arc::new(SimProvider::new("vsphere-1"));
        let providers = Arc::new(ProviderDirectory::new());
        providers.register("vsphere-1", sim.clone());
        if with_template {
            sim.add_template("cfme-5.9.0-tpl", Some("5.9.0"));
            let _ = store.insert_template(template_row("cfme-5.9.0-tpl", "5.9.0", (2018, 5, 1)));
        }

        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2018, 5, 10, 12, 0, 0).unwrap(),
        ));
        let (service, _orders) = PoolService::new(store, providers, clock.clone(), None);
        let delivered = Arc::new(Recording(Mutex::new(Vec::new())));
        let workers = Workers::new(service.clone(), delivered.clone());
        Fixture {
            service,
            workers,
            sim,
            clock,
            delivered,
        }
    }

    #[tokio::test]
    async fn test_fulfillment_drives_pool_to_ready() {
        let fx = fixture(true);
        let mut req = PoolRequest::new("cfme-59");
        req.count = 2;
        let pool = fx
            .service
            .request_appliances(&Caller::user("tester"), req)
            .unwrap();

        fx.workers.fulfillment_tick().await;

        let check = fx.service.request_check(pool).unwrap();
        assert_eq!(check["fulfilled"], json!(true));
        let appliances = check["appliances"].as_array().unwrap();
        assert_eq!(appliances.len(), 2);
        for appliance in appliances {
            assert!(appliance["ip_address"].as_str().is_some());
            assert_eq!(appliance["status"], json!("Ready"));
            assert_eq!(appliance["power_state"], json!("on"));
            assert!(appliance["leased_until"].as_str().is_some());
        }
    }

    #[tokio::test]
    async fn test_delayed_tasks_fulfilled_once_template_appears() {
        let fx = fixture(false);
        let mut req = PoolRequest::new("cfme-59");
        req.count = 2;
        let pool = fx
            .service
            .request_appliances(&Caller::user("tester"), req)
            .unwrap();
        assert_eq!(fx.service.store().tasks_for_pool(pool).len(), 2);

        // No capacity yet; the tick changes nothing
        fx.workers.fulfillment_tick().await;
        assert_eq!(fx.service.request_check(pool).unwrap()["fulfilled"], json!(false));

        fx.sim.add_template("cfme-5.9.0-tpl", Some("5.9.0"));
        let _ = fx
            .service
            .store()
            .insert_template(template_row("cfme-5.9.0-tpl", "5.9.0", (2018, 5, 1)));
        fx.workers.fulfillment_tick().await;

        let check = fx.service.request_check(pool).unwrap();
        assert_eq!(check["fulfilled"], json!(true));
        assert!(fx.service.store().tasks_for_pool(pool).is_empty());
        for appliance in check["appliances"].as_array().unwrap() {
            assert!(appliance["ip_address"].as_str().is_some());
        }
    }

    #[tokio::test]
    async fn test_clone_failure_requeues_biased_away() {
        let fx = fixture(true);
        fx.sim.fail_next_clones(1);
        let pool = fx
            .service
            .request_appliances(&Caller::user("tester"), PoolRequest::new("cfme-59"))
            .unwrap();

        fx.workers.fulfillment_tick().await;

        let errored: Vec<_> = fx
            .service
            .store()
            .appliances_in_pool(pool)
            .into_iter()
            .filter(|a| a.status == ProvisionState::Error)
            .collect();
        assert_eq!(errored.len(), 1);
        let tasks = fx.service.store().tasks_for_pool(pool);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].provider_to_avoid.as_deref(), Some("vsphere-1"));

        // Single provider, so the soft preference falls back to it
        fx.workers.fulfillment_tick().await;
        assert!(fx.service.store().pool_fulfilled(pool).unwrap());
    }

    #[tokio::test]
    async fn test_reaper_kills_expired_leases() {
        let fx = fixture(true);
        let pool = fx
            .service
            .request_appliances(&Caller::user("tester"), PoolRequest::new("cfme-59"))
            .unwrap();
        fx.workers.fulfillment_tick().await;
        let id = fx.service.store().appliances_in_pool(pool)[0].id;
        let name = fx.service.store().appliance(id).unwrap().name;

        fx.clock.advance(chrono::Duration::minutes(90));
        fx.workers.reaper_tick().await;

        let row = fx.service.store().appliance(id).unwrap();
        assert_eq!(row.status, ProvisionState::Destroyed);
        assert!(!row.exists);
        assert!(!fx.sim.vm_names().contains(&name));
    }

    #[tokio::test]
    async fn test_destroyed_pool_is_reaped_and_removed() {
        let fx = fixture(true);
        let caller = Caller::user("tester");
        let mut req = PoolRequest::new("cfme-59");
        req.count = 2;
        let pool = fx.service.request_appliances(&caller, req).unwrap();
        fx.workers.fulfillment_tick().await;
        assert!(fx.service.pool_exists(pool));

        fx.service.destroy_pool(&caller, pool).unwrap();
        fx.workers.reaper_tick().await;
        fx.workers.reaper_tick().await;

        assert!(!fx.service.pool_exists(pool));
        assert!(fx.sim.vm_names().is_empty());
        assert!(fx.service.store().delayed_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_pool_cancels_pending_tasks_first() {
        let fx = fixture(false);
        let caller = Caller::user("tester");
        let mut req = PoolRequest::new("cfme-59");
        req.count = 2;
        let pool = fx.service.request_appliances(&caller, req).unwrap();
        assert_eq!(fx.service.store().tasks_for_pool(pool).len(), 2);

        fx.service.destroy_pool(&caller, pool).unwrap();
        fx.workers.reaper_tick().await;

        assert!(fx.service.store().delayed_tasks().is_empty());
        assert!(!fx.service.pool_exists(pool));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent_when_vm_already_gone() {
        let fx = fixture(true);
        let caller = Caller::user("tester");
        let pool = fx
            .service
            .request_appliances(&caller, PoolRequest::new("cfme-59"))
            .unwrap();
        fx.workers.fulfillment_tick().await;
        let row = fx.service.store().appliances_in_pool(pool)[0].clone();

        // The VM vanishes behind the service's back
        assert!(fx.sim.destroy_vm(&row.name).await.unwrap());

        assert!(fx
            .service
            .kill_appliance(&caller, &row.id.0.to_string())
            .unwrap());
        fx.workers.reaper_tick().await;
        assert_eq!(
            fx.service.store().appliance(row.id).unwrap().status,
            ProvisionState::Destroyed
        );
        // Second kill is a quiet no-op
        assert!(!fx
            .service
            .kill_appliance(&caller, &row.id.0.to_string())
            .unwrap());
    }

    #[tokio::test]
    async fn test_power_reconciliation_updates_divergence() {
        let fx = fixture(true);
        let pool = fx
            .service
            .request_appliances(&Caller::user("tester"), PoolRequest::new("cfme-59"))
            .unwrap();
        fx.workers.fulfillment_tick().await;
        let row = fx.service.store().appliances_in_pool(pool)[0].clone();
        assert_eq!(row.power_state, PowerState::On);

        fx.sim.power_off(&row.name).await.unwrap();
        fx.clock.advance(chrono::Duration::minutes(1));
        fx.workers.reconcile_tick().await;

        let after = fx.service.store().appliance(row.id).unwrap();
        assert_eq!(after.power_state, PowerState::Off);
        assert!(after.power_state_changed > row.power_state_changed);
    }

    #[tokio::test]
    async fn test_scan_records_mismatch_once() {
        let fx = fixture(false);
        fx.sim.add_template("cfme-5.9.9-nightly", Some("5.10.1"));
        let _ = fx
            .service
            .store()
            .insert_template(template_row("cfme-5.9.9-nightly", "5.9.9", (2018, 5, 1)));

        fx.workers.scan_tick().await;
        fx.workers.scan_tick().await;

        let unsent = fx.service.store().unsent_mailers();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].supposed_version, "5.9.9");
        assert_eq!(unsent[0].actual_version, "5.10.1");
        // The row itself now carries the observed version
        let templates = fx.service.store().templates();
        assert_eq!(templates[0].version.as_deref(), Some("5.10.1"));
    }

    #[tokio::test]
    async fn test_scan_marks_vanished_templates() {
        let fx = fixture(false);
        let _ = fx
            .service
            .store()
            .insert_template(template_row("cfme-5.9.0-tpl", "5.9.0", (2018, 5, 1)));

        fx.workers.scan_tick().await;
        assert!(!fx.service.store().templates()[0].exists);
    }

    #[tokio::test]
    async fn test_mailer_flush_marks_sent() {
        let fx = fixture(false);
        let _ = fx
            .service
            .store()
            .record_mismatch("vsphere-1", "cfme-5.9.9-x", "5.9.9", "5.10.1");

        fx.workers.mailer_tick().await;
        fx.workers.mailer_tick().await;

        assert!(fx.service.store().unsent_mailers().is_empty());
        assert_eq!(fx.delivered.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_obsolete_template_deleted_via_script() {
        let fx = fixture(false);
        fx.sim.add_template("cfme-5.8.0-old", Some("5.8.0"));
        let _ = fx
            .service
            .store()
            .insert_template(template_row("cfme-5.8.0-old", "5.8.0", (2018, 1, 1)));
        let _ = fx
            .service
            .store()
            .update_group("cfme-59", |g| {
                g.template_obsolete_days = Some(30);
                g.template_obsolete_days_delete = true;
                g.templates_delete_script = Some("true".to_string());
            })
            .unwrap();

        fx.workers.obsolete_tick().await;

        let templates = fx.service.store().templates();
        assert!(templates[0].suggested_delete);
        assert!(!templates[0].exists);
        assert!(!templates[0].usable);
        assert!(fx
            .sim
            .list_templates()
            .await
            .unwrap()
            .iter()
            .all(|n| n != "cfme-5.8.0-old"));
    }

    #[tokio::test]
    async fn test_delete_script_failure_recorded_without_deleting() {
        let fx = fixture(false);
        let _ = fx
            .service
            .store()
            .insert_template(template_row("cfme-5.8.0-old", "5.8.0", (2018, 1, 1)));
        let _ = fx
            .service
            .store()
            .update_group("cfme-59", |g| {
                g.template_obsolete_days = Some(30);
                g.template_obsolete_days_delete = true;
                g.templates_delete_script =
                    Some("echo boom >&2; exit 1".to_string());
            })
            .unwrap();

        fx.workers.obsolete_tick().await;

        let group = fx.service.store().group("cfme-59").unwrap();
        assert_eq!(group.last_delete_script_exception.as_deref(), Some("boom"));
        assert!(fx.service.store().templates()[0].exists);
    }

    #[tokio::test]
    async fn test_shepherd_top_up_to_target() {
        let fx = fixture(true);
        let _ = fx
            .service
            .store()
            .update_group("cfme-59", |g| g.template_pool_size = 2)
            .unwrap();

        fx.workers.fulfillment_tick().await;

        assert_eq!(fx.service.num_shepherd_appliances(Some("cfme-59")), 2);
        // The target is already met; another tick adds nothing
        fx.workers.fulfillment_tick().await;
        assert_eq!(fx.service.num_shepherd_appliances(Some("cfme-59")), 2);
    }
}
