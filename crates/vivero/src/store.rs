//! In-memory table store shared by request handlers and control loops.
//!
//! One `RwLock` brackets every operation, so each method is a short atomic
//! transaction against the shared state; capacity checks and the
//! reserve+assign step run under a single write lock. A JSON snapshot
//! covers service restarts.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{ViveroError, ViveroResult};
use crate::models::{
    Appliance, AppliancePool, ApplianceId, DelayedProvisionTask, Group, MailerId,
    MismatchVersionMailer, PoolId, Provider, TaskId, Template, TemplateId, UserApplianceQuota,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Counters {
    appliance: u64,
    pool: u64,
    template: u64,
    task: u64,
    mailer: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    providers: BTreeMap<String, Provider>,
    groups: BTreeMap<String, Group>,
    templates: BTreeMap<u64, Template>,
    appliances: BTreeMap<u64, Appliance>,
    pools: BTreeMap<u64, AppliancePool>,
    delayed_tasks: BTreeMap<u64, DelayedProvisionTask>,
    quotas: BTreeMap<String, UserApplianceQuota>,
    mailers: BTreeMap<u64, MismatchVersionMailer>,
    counters: Counters,
}

impl Tables {
    fn template_provider(&self, template: TemplateId) -> Option<&str> {
        self.templates
            .get(&template.0)
            .map(|t| t.provider.as_str())
    }
}

/// The service's shared state
#[derive(Debug, Default)]
pub struct Store {
    inner: RwLock<Tables>,
}

impl Store {
    /// An empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.inner.read().expect("store poisoned"))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        f(&mut self.inner.write().expect("store poisoned"))
    }

    // ------------------------------------------------------------------
    // Providers
    // ------------------------------------------------------------------

    /// Add a provider row; `false` when it already exists
    pub fn add_provider(&self, provider: Provider) -> bool {
        self.write(|tables| {
            if tables.providers.contains_key(&provider.id) {
                return false;
            }
            let _ = tables.providers.insert(provider.id.clone(), provider);
            true
        })
    }

    /// Look up a provider
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown ids.
    pub fn provider(&self, id: &str) -> ViveroResult<Provider> {
        self.read(|tables| tables.providers.get(id).cloned())
            .ok_or_else(|| ViveroError::NotFound {
                kind: "provider",
                id: id.to_string(),
            })
    }

    /// All provider rows
    #[must_use]
    pub fn providers(&self) -> Vec<Provider> {
        self.read(|tables| tables.providers.values().cloned().collect())
    }

    /// Mutate a provider row in place
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown ids.
    pub fn update_provider(
        &self,
        id: &str,
        f: impl FnOnce(&mut Provider),
    ) -> ViveroResult<Provider> {
        self.write(|tables| {
            let provider = tables
                .providers
                .get_mut(id)
                .ok_or_else(|| ViveroError::NotFound {
                    kind: "provider",
                    id: id.to_string(),
                })?;
            f(provider);
            Ok(provider.clone())
        })
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Insert or replace a group row
    pub fn upsert_group(&self, group: Group) {
        self.write(|tables| {
            let _ = tables.groups.insert(group.id.clone(), group);
        });
    }

    /// Look up a group
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown ids.
    pub fn group(&self, id: &str) -> ViveroResult<Group> {
        self.read(|tables| tables.groups.get(id).cloned())
            .ok_or_else(|| ViveroError::NotFound {
                kind: "group",
                id: id.to_string(),
            })
    }

    /// All group rows
    #[must_use]
    pub fn groups(&self) -> Vec<Group> {
        self.read(|tables| tables.groups.values().cloned().collect())
    }

    /// Mutate a group row in place
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown ids.
    pub fn update_group(&self, id: &str, f: impl FnOnce(&mut Group)) -> ViveroResult<Group> {
        self.write(|tables| {
            let group = tables
                .groups
                .get_mut(id)
                .ok_or_else(|| ViveroError::NotFound {
                    kind: "group",
                    id: id.to_string(),
                })?;
            f(group);
            Ok(group.clone())
        })
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    /// Insert a template row, assigning its id
    pub fn insert_template(&self, mut template: Template) -> TemplateId {
        self.write(|tables| {
            tables.counters.template += 1;
            let id = TemplateId(tables.counters.template);
            template.id = id;
            let _ = tables.templates.insert(id.0, template);
            id
        })
    }

    /// Look up a template
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown ids.
    pub fn template(&self, id: TemplateId) -> ViveroResult<Template> {
        self.read(|tables| tables.templates.get(&id.0).cloned())
            .ok_or_else(|| ViveroError::NotFound {
                kind: "template",
                id: id.to_string(),
            })
    }

    /// All template rows
    #[must_use]
    pub fn templates(&self) -> Vec<Template> {
        self.read(|tables| tables.templates.values().cloned().collect())
    }

    /// Mutate a template row in place
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown ids.
    pub fn update_template(
        &self,
        id: TemplateId,
        f: impl FnOnce(&mut Template),
    ) -> ViveroResult<Template> {
        self.write(|tables| {
            let template = tables
                .templates
                .get_mut(&id.0)
                .ok_or_else(|| ViveroError::NotFound {
                    kind: "template",
                    id: id.to_string(),
                })?;
            f(template);
            Ok(template.clone())
        })
    }

    // ------------------------------------------------------------------
    // Appliances
    // ------------------------------------------------------------------

    /// Insert an appliance row, assigning its id
    pub fn insert_appliance(&self, mut appliance: Appliance) -> ApplianceId {
        self.write(|tables| {
            tables.counters.appliance += 1;
            let id = ApplianceId(tables.counters.appliance);
            appliance.id = id;
            let _ = tables.appliances.insert(id.0, appliance);
            id
        })
    }

    /// Look up an appliance
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown ids.
    pub fn appliance(&self, id: ApplianceId) -> ViveroResult<Appliance> {
        self.read(|tables| tables.appliances.get(&id.0).cloned())
            .ok_or_else(|| ViveroError::NotFound {
                kind: "appliance",
                id: id.to_string(),
            })
    }

    /// All appliance rows
    #[must_use]
    pub fn appliances(&self) -> Vec<Appliance> {
        self.read(|tables| tables.appliances.values().cloned().collect())
    }

    /// Mutate an appliance row in place
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown ids.
    pub fn update_appliance(
        &self,
        id: ApplianceId,
        f: impl FnOnce(&mut Appliance),
    ) -> ViveroResult<Appliance> {
        self.write(|tables| {
            let appliance =
                tables
                    .appliances
                    .get_mut(&id.0)
                    .ok_or_else(|| ViveroError::NotFound {
                        kind: "appliance",
                        id: id.to_string(),
                    })?;
            f(appliance);
            Ok(appliance.clone())
        })
    }

    /// Appliances belonging to a pool, id order
    #[must_use]
    pub fn appliances_in_pool(&self, pool: PoolId) -> Vec<Appliance> {
        self.read(|tables| {
            tables
                .appliances
                .values()
                .filter(|a| a.appliance_pool == Some(pool))
                .cloned()
                .collect()
        })
    }

    /// Warm-pool appliances: ready, active, unassigned
    #[must_use]
    pub fn unassigned_ready(&self) -> Vec<Appliance> {
        self.read(|tables| {
            tables
                .appliances
                .values()
                .filter(|a| {
                    a.appliance_pool.is_none()
                        && a.ready
                        && a.is_active()
                        && !a.marked_for_deletion
                })
                .cloned()
                .collect()
        })
    }

    /// Resolve an appliance by id, IP address, or name
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] when nothing matches.
    pub fn find_appliance(&self, identifier: &str) -> ViveroResult<Appliance> {
        if let Ok(id) = identifier.parse::<u64>() {
            return self.appliance(ApplianceId(id));
        }
        let ip_form = regex::Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+$")
            .expect("static regex must parse");
        let by = |tables: &Tables| {
            tables
                .appliances
                .values()
                .find(|a| {
                    if ip_form.is_match(identifier) {
                        a.ip_address.as_deref() == Some(identifier)
                    } else {
                        a.name == identifier
                    }
                })
                .cloned()
        };
        self.read(by).ok_or_else(|| ViveroError::NotFound {
            kind: "appliance",
            id: identifier.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Pools
    // ------------------------------------------------------------------

    /// Insert a pool row, assigning its id
    pub fn insert_pool(&self, mut pool: AppliancePool) -> PoolId {
        self.write(|tables| {
            tables.counters.pool += 1;
            let id = PoolId(tables.counters.pool);
            pool.id = id;
            let _ = tables.pools.insert(id.0, pool);
            id
        })
    }

    /// Look up a pool
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown ids.
    pub fn pool(&self, id: PoolId) -> ViveroResult<AppliancePool> {
        self.read(|tables| tables.pools.get(&id.0).cloned())
            .ok_or_else(|| ViveroError::NotFound {
                kind: "pool",
                id: id.to_string(),
            })
    }

    /// All pool rows
    #[must_use]
    pub fn pools(&self) -> Vec<AppliancePool> {
        self.read(|tables| tables.pools.values().cloned().collect())
    }

    /// Whether the pool row exists
    #[must_use]
    pub fn pool_exists(&self, id: PoolId) -> bool {
        self.read(|tables| tables.pools.contains_key(&id.0))
    }

    /// Mutate a pool row in place
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown ids.
    pub fn update_pool(
        &self,
        id: PoolId,
        f: impl FnOnce(&mut AppliancePool),
    ) -> ViveroResult<AppliancePool> {
        self.write(|tables| {
            let pool = tables
                .pools
                .get_mut(&id.0)
                .ok_or_else(|| ViveroError::NotFound {
                    kind: "pool",
                    id: id.to_string(),
                })?;
            f(pool);
            Ok(pool.clone())
        })
    }

    /// Remove a pool row, detaching any remaining appliances
    pub fn remove_pool(&self, id: PoolId) {
        self.write(|tables| {
            let _ = tables.pools.remove(&id.0);
            for appliance in tables.appliances.values_mut() {
                if appliance.appliance_pool == Some(id) {
                    appliance.appliance_pool = None;
                    appliance.owner = None;
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Delayed provisioning tasks
    // ------------------------------------------------------------------

    /// Queue a delayed provisioning task, assigning its id
    pub fn insert_task(&self, mut task: DelayedProvisionTask) -> TaskId {
        self.write(|tables| {
            tables.counters.task += 1;
            let id = TaskId(tables.counters.task);
            task.id = id;
            let _ = tables.delayed_tasks.insert(id.0, task);
            id
        })
    }

    /// All delayed tasks in id order
    #[must_use]
    pub fn delayed_tasks(&self) -> Vec<DelayedProvisionTask> {
        self.read(|tables| tables.delayed_tasks.values().cloned().collect())
    }

    /// Delayed tasks queued for a pool
    #[must_use]
    pub fn tasks_for_pool(&self, pool: PoolId) -> Vec<DelayedProvisionTask> {
        self.read(|tables| {
            tables
                .delayed_tasks
                .values()
                .filter(|t| t.pool == pool)
                .cloned()
                .collect()
        })
    }

    /// Remove a delayed task; `false` when already gone
    pub fn remove_task(&self, id: TaskId) -> bool {
        self.write(|tables| tables.delayed_tasks.remove(&id.0).is_some())
    }

    // ------------------------------------------------------------------
    // Quotas
    // ------------------------------------------------------------------

    /// Install a per-user quota row
    pub fn set_quota(&self, quota: UserApplianceQuota) {
        self.write(|tables| {
            let _ = tables.quotas.insert(quota.user.clone(), quota);
        });
    }

    /// The user's quota row, when one exists
    #[must_use]
    pub fn quota_for(&self, user: &str) -> Option<UserApplianceQuota> {
        self.read(|tables| tables.quotas.get(user).cloned())
    }

    // ------------------------------------------------------------------
    // Version-mismatch mailers
    // ------------------------------------------------------------------

    /// Record a template version mismatch. Deduplicates on
    /// (provider, template name, actual version); returns `None` when an
    /// equivalent row already exists.
    pub fn record_mismatch(
        &self,
        provider: &str,
        template_name: &str,
        supposed_version: &str,
        actual_version: &str,
    ) -> Option<MailerId> {
        self.write(|tables| {
            let duplicate = tables.mailers.values().any(|m| {
                m.provider == provider
                    && m.template_name == template_name
                    && m.actual_version == actual_version
            });
            if duplicate {
                return None;
            }
            tables.counters.mailer += 1;
            let id = MailerId(tables.counters.mailer);
            let _ = tables.mailers.insert(
                id.0,
                MismatchVersionMailer {
                    id,
                    provider: provider.to_string(),
                    template_name: template_name.to_string(),
                    supposed_version: supposed_version.to_string(),
                    actual_version: actual_version.to_string(),
                    sent: false,
                },
            );
            Some(id)
        })
    }

    /// The notifier's work queue: unsent mismatch rows
    #[must_use]
    pub fn unsent_mailers(&self) -> Vec<MismatchVersionMailer> {
        self.read(|tables| {
            tables
                .mailers
                .values()
                .filter(|m| !m.sent)
                .cloned()
                .collect()
        })
    }

    /// All mismatch rows
    #[must_use]
    pub fn mailers(&self) -> Vec<MismatchVersionMailer> {
        self.read(|tables| tables.mailers.values().cloned().collect())
    }

    /// Mark a mismatch row delivered
    pub fn mark_mailer_sent(&self, id: MailerId) {
        self.write(|tables| {
            if let Some(mailer) = tables.mailers.get_mut(&id.0) {
                mailer.sent = true;
            }
        });
    }

    // ------------------------------------------------------------------
    // Derived provider capacity
    // ------------------------------------------------------------------

    /// Live appliances on the provider (anything not destroyed)
    #[must_use]
    pub fn provider_appliance_count(&self, provider: &str) -> u32 {
        self.read(|tables| {
            tables
                .appliances
                .values()
                .filter(|a| a.is_active() && tables.template_provider(a.template) == Some(provider))
                .count() as u32
        })
    }

    /// Appliances occupying a provisioning slot on the provider
    #[must_use]
    pub fn provider_provisioning_count(&self, provider: &str) -> u32 {
        self.read(|tables| {
            tables
                .appliances
                .values()
                .filter(|a| {
                    a.is_provisioning() && tables.template_provider(a.template) == Some(provider)
                })
                .count() as u32
        })
    }

    /// Free provisioning slots; never negative
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown providers.
    pub fn remaining_provisioning_slots(&self, provider: &str) -> ViveroResult<u32> {
        let row = self.provider(provider)?;
        let used = self.provider_provisioning_count(provider);
        Ok(row.num_simultaneous_provisioning.saturating_sub(used))
    }

    /// Fraction of provisioning slots in use
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown providers.
    pub fn provisioning_load(&self, provider: &str) -> ViveroResult<f64> {
        let row = self.provider(provider)?;
        if row.num_simultaneous_provisioning == 0 {
            return Ok(1.0);
        }
        Ok(f64::from(self.provider_provisioning_count(provider))
            / f64::from(row.num_simultaneous_provisioning))
    }

    /// Fraction of the appliance limit in use, `None` without a limit
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown providers.
    pub fn appliance_load(&self, provider: &str) -> ViveroResult<Option<f64>> {
        let row = self.provider(provider)?;
        Ok(row.appliance_limit.map(|limit| {
            if limit == 0 {
                1.0
            } else {
                f64::from(self.provider_appliance_count(provider)) / f64::from(limit)
            }
        }))
    }

    // ------------------------------------------------------------------
    // Derived pool state
    // ------------------------------------------------------------------

    /// Ready appliances in the pool
    #[must_use]
    pub fn pool_ready_count(&self, pool: PoolId) -> u32 {
        self.appliances_in_pool(pool)
            .iter()
            .filter(|a| a.ready && a.is_active())
            .count() as u32
    }

    /// Live appliances in the pool
    #[must_use]
    pub fn pool_current_count(&self, pool: PoolId) -> u32 {
        self.appliances_in_pool(pool)
            .iter()
            .filter(|a| a.is_active())
            .count() as u32
    }

    /// A pool is fulfilled exactly when its ready count reached the
    /// requested size.
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown pools.
    pub fn pool_fulfilled(&self, pool: PoolId) -> ViveroResult<bool> {
        let row = self.pool(pool)?;
        Ok(self.pool_ready_count(pool) == row.num_appliances)
    }

    /// Fulfillment progress in `0.0..=1.0`
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unknown pools.
    pub fn pool_percent_finished(&self, pool: PoolId) -> ViveroResult<f64> {
        let row = self.pool(pool)?;
        if row.num_appliances == 0 {
            return Ok(1.0);
        }
        Ok(f64::from(self.pool_ready_count(pool)) / f64::from(row.num_appliances))
    }

    /// Addresses of the pool's appliances
    #[must_use]
    pub fn pool_appliance_ips(&self, pool: PoolId) -> Vec<String> {
        self.appliances_in_pool(pool)
            .into_iter()
            .filter_map(|a| a.ip_address)
            .collect()
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Persist the full state as pretty JSON
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialization failures.
    pub fn save_snapshot(&self, path: &Path) -> ViveroResult<()> {
        let file = std::fs::File::create(path)?;
        self.read(|tables| serde_json::to_writer_pretty(file, tables))?;
        Ok(())
    }

    /// Restore a store from a snapshot file
    ///
    /// # Errors
    ///
    /// Propagates I/O and deserialization failures.
    pub fn load_snapshot(path: &Path) -> ViveroResult<Self> {
        let file = std::fs::File::open(path)?;
        let tables: Tables = serde_json::from_reader(file)?;
        Ok(Self {
            inner: RwLock::new(tables),
        })
    }
}
