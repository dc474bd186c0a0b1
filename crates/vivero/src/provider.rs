//! Provider management clients.
//!
//! The service treats a client as non-transactional: every mutation is
//! fire-and-observe, and the control loops reconcile the store against
//! what the provider actually reports. The simulated client backs tests
//! and local runs; real virtualization backends are wired in the same way.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use crate::error::{ViveroError, ViveroResult};
use crate::models::PowerState;

/// Management operations the pool service needs from a provider
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Template names present on the provider
    async fn list_templates(&self) -> ViveroResult<Vec<String>>;

    /// Product version a template actually reports, when determinable
    async fn template_version(&self, template: &str) -> ViveroResult<Option<String>>;

    /// Clone a template into a new VM
    async fn clone_template(&self, template: &str, vm_name: &str) -> ViveroResult<()>;

    /// Whether the VM exists
    async fn vm_exists(&self, name: &str) -> ViveroResult<bool>;

    /// Power the VM on
    async fn power_on(&self, name: &str) -> ViveroResult<()>;

    /// Power the VM off
    async fn power_off(&self, name: &str) -> ViveroResult<()>;

    /// Suspend the VM
    async fn suspend(&self, name: &str) -> ViveroResult<()>;

    /// Observed power state
    async fn power_state(&self, name: &str) -> ViveroResult<PowerState>;

    /// Address of the VM, once it has one
    async fn vm_ip(&self, name: &str) -> ViveroResult<Option<String>>;

    /// Rename the VM; not every backend supports this
    async fn rename_vm(&self, name: &str, new_name: &str) -> ViveroResult<()>;

    /// Destroy the VM; `false` when it was already gone
    async fn destroy_vm(&self, name: &str) -> ViveroResult<bool>;

    /// Delete a template artifact
    async fn delete_template(&self, template: &str) -> ViveroResult<()>;
}

#[derive(Debug, Clone)]
struct SimVm {
    power: PowerState,
    ip: Option<String>,
}

#[derive(Debug, Default)]
struct SimState {
    templates: BTreeMap<String, Option<String>>,
    vms: BTreeMap<String, SimVm>,
    next_ip: u8,
    fail_next_clones: u32,
}

/// In-memory provider used by tests and local runs.
///
/// Deterministic: cloned VMs start powered off without an address and get
/// `10.0.<n>` style addresses when powered on. Clone failures can be
/// injected to exercise the error path.
#[derive(Debug)]
pub struct SimProvider {
    key: String,
    state: Mutex<SimState>,
}

impl SimProvider {
    /// A provider simulation with no templates
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Provider key
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Make a template available, optionally with a reported version
    pub fn add_template(&self, name: impl Into<String>, version: Option<&str>) {
        let mut state = self.state.lock().expect("sim state poisoned");
        let _ = state
            .templates
            .insert(name.into(), version.map(ToString::to_string));
    }

    /// Change the version a template reports
    pub fn set_template_version(&self, name: &str, version: &str) {
        let mut state = self.state.lock().expect("sim state poisoned");
        if let Some(slot) = state.templates.get_mut(name) {
            *slot = Some(version.to_string());
        }
    }

    /// Make the next `n` clone calls fail
    pub fn fail_next_clones(&self, n: u32) {
        self.state.lock().expect("sim state poisoned").fail_next_clones = n;
    }

    /// Names of currently existing VMs
    #[must_use]
    pub fn vm_names(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("sim state poisoned")
            .vms
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProviderClient for SimProvider {
    async fn list_templates(&self) -> ViveroResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .expect("sim state poisoned")
            .templates
            .keys()
            .cloned()
            .collect())
    }

    async fn template_version(&self, template: &str) -> ViveroResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .expect("sim state poisoned")
            .templates
            .get(template)
            .cloned()
            .flatten())
    }

    async fn clone_template(&self, template: &str, vm_name: &str) -> ViveroResult<()> {
        let mut state = self.state.lock().expect("sim state poisoned");
        if state.fail_next_clones > 0 {
            state.fail_next_clones -= 1;
            return Err(ViveroError::Provider {
                message: format!("{}: injected clone failure", self.key),
            });
        }
        if !state.templates.contains_key(template) {
            return Err(ViveroError::NotFound {
                kind: "template",
                id: template.to_string(),
            });
        }
        let _ = state.vms.insert(
            vm_name.to_string(),
            SimVm {
                power: PowerState::Off,
                ip: None,
            },
        );
        Ok(())
    }

    async fn vm_exists(&self, name: &str) -> ViveroResult<bool> {
        Ok(self
            .state
            .lock()
            .expect("sim state poisoned")
            .vms
            .contains_key(name))
    }

    async fn power_on(&self, name: &str) -> ViveroResult<()> {
        let mut state = self.state.lock().expect("sim state poisoned");
        state.next_ip = state.next_ip.wrapping_add(1);
        let ip = format!("10.0.0.{}", state.next_ip);
        let vm = state.vms.get_mut(name).ok_or_else(|| ViveroError::NotFound {
            kind: "vm",
            id: name.to_string(),
        })?;
        vm.power = PowerState::On;
        if vm.ip.is_none() {
            vm.ip = Some(ip);
        }
        Ok(())
    }

    async fn power_off(&self, name: &str) -> ViveroResult<()> {
        let mut state = self.state.lock().expect("sim state poisoned");
        let vm = state.vms.get_mut(name).ok_or_else(|| ViveroError::NotFound {
            kind: "vm",
            id: name.to_string(),
        })?;
        vm.power = PowerState::Off;
        Ok(())
    }

    async fn suspend(&self, name: &str) -> ViveroResult<()> {
        let mut state = self.state.lock().expect("sim state poisoned");
        let vm = state.vms.get_mut(name).ok_or_else(|| ViveroError::NotFound {
            kind: "vm",
            id: name.to_string(),
        })?;
        vm.power = PowerState::Suspended;
        Ok(())
    }

    async fn power_state(&self, name: &str) -> ViveroResult<PowerState> {
        Ok(self
            .state
            .lock()
            .expect("sim state poisoned")
            .vms
            .get(name)
            .map_or(PowerState::Unknown, |vm| vm.power))
    }

    async fn vm_ip(&self, name: &str) -> ViveroResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .expect("sim state poisoned")
            .vms
            .get(name)
            .and_then(|vm| vm.ip.clone()))
    }

    async fn rename_vm(&self, name: &str, new_name: &str) -> ViveroResult<()> {
        let mut state = self.state.lock().expect("sim state poisoned");
        let vm = state.vms.remove(name).ok_or_else(|| ViveroError::NotFound {
            kind: "vm",
            id: name.to_string(),
        })?;
        let _ = state.vms.insert(new_name.to_string(), vm);
        Ok(())
    }

    async fn destroy_vm(&self, name: &str) -> ViveroResult<bool> {
        Ok(self
            .state
            .lock()
            .expect("sim state poisoned")
            .vms
            .remove(name)
            .is_some())
    }

    async fn delete_template(&self, template: &str) -> ViveroResult<()> {
        let mut state = self.state.lock().expect("sim state poisoned");
        let _ = state.templates.remove(template);
        Ok(())
    }
}

/// Registry of connected provider clients, keyed by provider id
#[derive(Default)]
pub struct ProviderDirectory {
    clients: RwLock<HashMap<String, std::sync::Arc<dyn ProviderClient>>>,
}

impl std::fmt::Debug for ProviderDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDirectory")
            .field("providers", &self.keys())
            .finish()
    }
}

impl ProviderDirectory {
    /// An empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a client under a provider id
    pub fn register(&self, key: impl Into<String>, client: std::sync::Arc<dyn ProviderClient>) {
        let _ = self
            .clients
            .write()
            .expect("directory poisoned")
            .insert(key.into(), client);
    }

    /// The client for a provider
    ///
    /// # Errors
    ///
    /// Returns [`ViveroError::NotFound`] for unconnected providers.
    pub fn get(&self, key: &str) -> ViveroResult<std::sync::Arc<dyn ProviderClient>> {
        self.clients
            .read()
            .expect("directory poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| ViveroError::NotFound {
                kind: "provider",
                id: key.to_string(),
            })
    }

    /// Connected provider ids
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .clients
            .read()
            .expect("directory poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clone_and_power_cycle() {
        let sim = SimProvider::new("vsphere-1");
        sim.add_template("cfme-59-tpl", Some("5.9.0"));

        sim.clone_template("cfme-59-tpl", "appliance-1").await.unwrap();
        assert!(sim.vm_exists("appliance-1").await.unwrap());
        assert_eq!(
            sim.power_state("appliance-1").await.unwrap(),
            PowerState::Off
        );
        assert_eq!(sim.vm_ip("appliance-1").await.unwrap(), None);

        sim.power_on("appliance-1").await.unwrap();
        assert_eq!(
            sim.power_state("appliance-1").await.unwrap(),
            PowerState::On
        );
        assert!(sim.vm_ip("appliance-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_template_clone_fails() {
        let sim = SimProvider::new("vsphere-1");
        assert!(sim.clone_template("nope", "vm").await.is_err());
    }

    #[tokio::test]
    async fn test_injected_clone_failures() {
        let sim = SimProvider::new("vsphere-1");
        sim.add_template("tpl", None);
        sim.fail_next_clones(1);

        assert!(sim.clone_template("tpl", "vm-1").await.is_err());
        sim.clone_template("tpl", "vm-2").await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_is_observable() {
        let sim = SimProvider::new("vsphere-1");
        sim.add_template("tpl", None);
        sim.clone_template("tpl", "vm").await.unwrap();

        assert!(sim.destroy_vm("vm").await.unwrap());
        assert!(!sim.destroy_vm("vm").await.unwrap());
        assert_eq!(sim.power_state("vm").await.unwrap(), PowerState::Unknown);
    }

    #[test]
    fn test_directory_lookup() {
        let directory = ProviderDirectory::new();
        directory.register("a", std::sync::Arc::new(SimProvider::new("a")));

        assert!(directory.get("a").is_ok());
        assert!(directory.get("b").is_err());
        assert_eq!(directory.keys(), vec!["a".to_string()]);
    }
}
