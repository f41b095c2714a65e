use async_trait::async_trait;
use nimbus_shared::hypervisor::{
    ClusterTask, CreateVmParams, FirewallOptions, FirewallRule, HyperError, HypervisorApi,
    PowerAction, QemuResource, StorageContent, VmCurrentStatus, VmRef,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// VM simulée côté hyperviseur
#[derive(Debug, Clone)]
pub struct FakeVm {
    pub name: String,
    pub node: String,
    pub status: String,
    pub net_in: u64,
    pub net_out: u64,
    pub config: HashMap<String, String>,
}

#[derive(Default)]
struct FakeState {
    vms: HashMap<u32, FakeVm>,
    /// (upid, statut) ; "running" passe à "OK" après avoir été observé
    tasks: Vec<(String, String)>,
    storage: Vec<StorageContent>,
    journal: Vec<String>,
    fail_on: HashSet<String>,
    agent_online: bool,
    ipsets: HashMap<String, Vec<String>>,
    passwords: Vec<(String, String)>,
    exec_inputs: Vec<String>,
    next_task: u32,
}

/// Hyperviseur scripté pour les tests.
///
/// Chaque appel mutant est consigné dans un journal consultable ; les
/// tâches créées sont listées "running" une fois puis terminent "OK", ce
/// qui reproduit la fenêtre d'observation du poller. `fail_on` force une
/// méthode donnée à échouer, pour tester l'abandon du pipeline.
#[derive(Clone)]
pub struct FakeHypervisor {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeState {
                agent_online: true,
                ..FakeState::default()
            })),
        }
    }

    /// Fait échouer les prochains appels à `method` (nom du journal)
    pub fn fail_on(&self, method: &str) {
        self.inner.lock().unwrap().fail_on.insert(method.to_string());
    }

    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().fail_on.clear();
    }

    pub fn set_agent_online(&self, online: bool) {
        self.inner.lock().unwrap().agent_online = online;
    }

    /// Pré-remplit une VM existante (scénarios de suppression)
    pub fn add_vm(&self, vmid: u32, name: &str, node: &str, status: &str) {
        self.inner.lock().unwrap().vms.insert(
            vmid,
            FakeVm {
                name: name.to_string(),
                node: node.to_string(),
                status: status.to_string(),
                net_in: 0,
                net_out: 0,
                config: HashMap::new(),
            },
        );
    }

    /// Pré-remplit le stockage (scénario "image déjà en cache")
    pub fn seed_storage(&self, file_name: &str) {
        self.inner.lock().unwrap().storage.push(StorageContent {
            volid: format!("local:iso/{file_name}"),
            size: 1,
            content: "iso".into(),
        });
    }

    /// Incrémente les compteurs réseau bruts d'une VM (tests du poller)
    pub fn set_net_counters(&self, vmid: u32, net_in: u64, net_out: u64) {
        let mut state = self.inner.lock().unwrap();
        if let Some(vm) = state.vms.get_mut(&vmid) {
            vm.net_in = net_in;
            vm.net_out = net_out;
        }
    }

    pub fn journal(&self) -> Vec<String> {
        self.inner.lock().unwrap().journal.clone()
    }

    pub fn find_vm(&self, vm_db_id: &str) -> Option<(u32, FakeVm)> {
        let suffix = format!("-{vm_db_id}");
        let state = self.inner.lock().unwrap();
        state
            .vms
            .iter()
            .find(|(_, vm)| vm.name.ends_with(&suffix))
            .map(|(vmid, vm)| (*vmid, vm.clone()))
    }

    pub fn vm_config_of(&self, vmid: u32) -> HashMap<String, String> {
        self.inner
            .lock()
            .unwrap()
            .vms
            .get(&vmid)
            .map(|vm| vm.config.clone())
            .unwrap_or_default()
    }

    pub fn ipset_entries(&self, name: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .ipsets
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn passwords_set(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().passwords.clone()
    }

    pub fn exec_inputs(&self) -> Vec<String> {
        self.inner.lock().unwrap().exec_inputs.clone()
    }

    fn begin(&self, call: &str, method: &str) -> Result<(), HyperError> {
        let mut state = self.inner.lock().unwrap();
        state.journal.push(call.to_string());
        if state.fail_on.contains(method) {
            return Err(HyperError::Api {
                context: method.to_string(),
                message: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn new_task(state: &mut FakeState) -> String {
        state.next_task += 1;
        let upid = format!("UPID:fake:{:08x}", state.next_task);
        state.tasks.push((upid.clone(), "running".to_string()));
        upid
    }
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorApi for FakeHypervisor {
    async fn cluster_resources(&self) -> Result<Vec<QemuResource>, HyperError> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .vms
            .iter()
            .map(|(vmid, vm)| QemuResource {
                vmid: *vmid,
                name: vm.name.clone(),
                status: vm.status.clone(),
                node: vm.node.clone(),
                cpu: 0.05,
                mem: 256 * 1024 * 1024,
                maxmem: 1024 * 1024 * 1024,
                uptime: if vm.status == "running" { 60 } else { 0 },
                netin: vm.net_in,
                netout: vm.net_out,
            })
            .collect())
    }

    async fn cluster_tasks(&self) -> Result<Vec<ClusterTask>, HyperError> {
        let mut state = self.inner.lock().unwrap();
        let snapshot = state
            .tasks
            .iter()
            .map(|(upid, status)| ClusterTask {
                upid: Some(upid.clone()),
                status: Some(status.clone()),
                node: Some("fake".into()),
                task_type: None,
            })
            .collect();
        // une tâche listée "running" termine avant le prochain listing
        for task in state.tasks.iter_mut() {
            if task.1 == "running" {
                task.1 = "OK".to_string();
            }
        }
        Ok(snapshot)
    }

    async fn current_status(&self, vm: &VmRef) -> Result<VmCurrentStatus, HyperError> {
        let state = self.inner.lock().unwrap();
        let fake = state.vms.get(&vm.vmid).ok_or_else(|| HyperError::Api {
            context: "status/current".into(),
            message: format!("vm {} not found", vm.vmid),
        })?;
        Ok(VmCurrentStatus {
            status: fake.status.clone(),
            cpu: 0.10,
            mem: 300 * 1024 * 1024,
        })
    }

    async fn create_vm(&self, vm: &VmRef, params: &CreateVmParams) -> Result<String, HyperError> {
        self.begin("create_vm", "create_vm")?;
        let mut state = self.inner.lock().unwrap();
        let mut config = HashMap::new();
        config.insert("net0".to_string(), params.net0.clone());
        state.vms.insert(
            vm.vmid,
            FakeVm {
                name: params.name.clone(),
                node: vm.node.clone(),
                status: "stopped".to_string(),
                net_in: 0,
                net_out: 0,
                config,
            },
        );
        Ok(Self::new_task(&mut state))
    }

    async fn delete_vm(&self, vm: &VmRef) -> Result<String, HyperError> {
        self.begin("delete_vm", "delete_vm")?;
        let mut state = self.inner.lock().unwrap();
        state.vms.remove(&vm.vmid);
        Ok(Self::new_task(&mut state))
    }

    async fn resize_disk(&self, _vm: &VmRef, _disk: &str, _size: &str) -> Result<(), HyperError> {
        self.begin("resize_disk", "resize_disk")
    }

    async fn power_action(&self, vm: &VmRef, action: PowerAction) -> Result<String, HyperError> {
        self.begin(&format!("power_action:{}", action.as_str()), "power_action")?;
        let mut state = self.inner.lock().unwrap();
        let status = match action {
            PowerAction::Start | PowerAction::Reboot | PowerAction::Reset => "running",
            PowerAction::Stop | PowerAction::Shutdown | PowerAction::Suspend => "stopped",
        };
        if let Some(fake) = state.vms.get_mut(&vm.vmid) {
            fake.status = status.to_string();
        }
        Ok(Self::new_task(&mut state))
    }

    async fn vm_config(&self, vm: &VmRef) -> Result<HashMap<String, serde_json::Value>, HyperError> {
        let state = self.inner.lock().unwrap();
        let fake = state.vms.get(&vm.vmid).ok_or_else(|| HyperError::Api {
            context: "config".into(),
            message: format!("vm {} not found", vm.vmid),
        })?;
        Ok(fake
            .config
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect())
    }

    async fn set_vm_config(&self, vm: &VmRef, values: &HashMap<String, String>) -> Result<(), HyperError> {
        self.begin("set_vm_config", "set_vm_config")?;
        let mut state = self.inner.lock().unwrap();
        if let Some(fake) = state.vms.get_mut(&vm.vmid) {
            for (key, value) in values {
                fake.config.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn delete_vm_config_keys(&self, vm: &VmRef, keys: &[String]) -> Result<(), HyperError> {
        self.begin("delete_vm_config_keys", "delete_vm_config_keys")?;
        let mut state = self.inner.lock().unwrap();
        if let Some(fake) = state.vms.get_mut(&vm.vmid) {
            for key in keys {
                fake.config.remove(key);
            }
        }
        Ok(())
    }

    async fn firewall_create_ipset(&self, _vm: &VmRef, name: &str) -> Result<(), HyperError> {
        self.begin("firewall_create_ipset", "firewall_create_ipset")?;
        let mut state = self.inner.lock().unwrap();
        state.ipsets.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn firewall_add_to_ipset(&self, _vm: &VmRef, ipset: &str, cidr: &str) -> Result<(), HyperError> {
        self.begin("firewall_add_to_ipset", "firewall_add_to_ipset")?;
        let mut state = self.inner.lock().unwrap();
        state
            .ipsets
            .entry(ipset.to_string())
            .or_default()
            .push(cidr.to_string());
        Ok(())
    }

    async fn firewall_set_options(&self, _vm: &VmRef, _options: &FirewallOptions) -> Result<(), HyperError> {
        self.begin("firewall_set_options", "firewall_set_options")
    }

    async fn firewall_add_rule(&self, _vm: &VmRef, rule: &FirewallRule) -> Result<(), HyperError> {
        self.begin(&format!("firewall_add_rule:{}", rule.direction), "firewall_add_rule")
    }

    async fn storage_content(&self, _node: &str, _storage: &str) -> Result<Vec<StorageContent>, HyperError> {
        Ok(self.inner.lock().unwrap().storage.clone())
    }

    async fn storage_download_url(
        &self,
        _node: &str,
        storage: &str,
        _url: &str,
        file_name: &str,
    ) -> Result<String, HyperError> {
        self.begin("storage_download_url", "storage_download_url")?;
        let mut state = self.inner.lock().unwrap();
        state.storage.push(StorageContent {
            volid: format!("{storage}:iso/{file_name}"),
            size: 1,
            content: "iso".into(),
        });
        Ok(Self::new_task(&mut state))
    }

    async fn agent_ping(&self, vm: &VmRef) -> bool {
        let state = self.inner.lock().unwrap();
        state.agent_online
            && state
                .vms
                .get(&vm.vmid)
                .map(|fake| fake.status == "running")
                .unwrap_or(false)
    }

    async fn agent_exec(&self, _vm: &VmRef, _command: &str, input: &str) -> Result<(), HyperError> {
        self.begin("agent_exec", "agent_exec")?;
        self.inner.lock().unwrap().exec_inputs.push(input.to_string());
        Ok(())
    }

    async fn agent_set_password(&self, _vm: &VmRef, username: &str, password: &str) -> Result<(), HyperError> {
        self.begin("agent_set_password", "agent_set_password")?;
        self.inner
            .lock()
            .unwrap()
            .passwords
            .push((username.to_string(), password.to_string()));
        Ok(())
    }
}
