/**
 * POLLER D'ÉTAT - Miroir hyperviseur -> cache + publication des changements
 *
 * FONCTIONNEMENT :
 * - tick roster (lent) : recharge depuis le store la liste des VMs payées ;
 *   les VMs hors roster sont ignorées par les ticks rapides (pas de polling
 *   des VMs orphelines ou impayées)
 * - tick états (rapide) : liste les ressources qemu du cluster, écrit un
 *   document d'état TTL court par VM du roster, publie immédiatement tout
 *   changement de statut d'alimentation (jamais groupé en fin de boucle)
 * - tick tâches (rapide) : publie tout changement de statut de tâche
 *
 * Toutes les maps sont possédées exclusivement par le Poller : un seul
 * écrivain, aucun verrou. Les trois ticks partagent la même boucle select,
 * un échec de tick est loggé puis oublié.
 */

use anyhow::Result;
use nimbus_shared::cache::StateCache;
use nimbus_shared::hypervisor::{HypervisorApi, VmRef};
use nimbus_shared::models::{
    parse_hypervisor_name, vm_state_key, PowerState, TaskChange, VMPowerStateChange, VMState,
    VmRecord, CHANNEL_POWER_CHANGE, CHANNEL_TASK_CHANGE,
};
use nimbus_shared::store::VmStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub roster_interval: Duration,
    pub state_interval: Duration,
    pub task_interval: Duration,
    /// TTL des documents d'état ; doit dépasser l'intervalle de tick avec
    /// de la marge pour tolérer un tick lent
    pub state_ttl: Duration,
    /// Fenêtre "récemment consultée" donnant droit au fetch haute fidélité
    pub live_window: time::Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            roster_interval: Duration::from_secs(15),
            state_interval: Duration::from_secs(1),
            task_interval: Duration::from_secs(1),
            state_ttl: Duration::from_secs(10),
            live_window: time::Duration::minutes(2),
        }
    }
}

/// Cumul réseau par VM. Les compteurs hyperviseur sont monotones mais
/// remis à zéro au redémarrage de la VM : un delta négatif est écarté au
/// lieu d'être soustrait, le cumul ne décroît jamais.
#[derive(Debug, Clone)]
pub struct NetAccumulator {
    pub total_in: u64,
    pub total_out: u64,
    last_in: u64,
    last_out: u64,
}

impl NetAccumulator {
    pub fn new(raw_in: u64, raw_out: u64) -> Self {
        Self { total_in: 0, total_out: 0, last_in: raw_in, last_out: raw_out }
    }

    pub fn record(&mut self, raw_in: u64, raw_out: u64) {
        if raw_in >= self.last_in && raw_out >= self.last_out {
            self.total_in += raw_in - self.last_in;
            self.total_out += raw_out - self.last_out;
        }
        self.last_in = raw_in;
        self.last_out = raw_out;
    }
}

pub struct Poller {
    hypervisor: Arc<dyn HypervisorApi>,
    cache: Arc<dyn StateCache>,
    store: Arc<dyn VmStore>,
    settings: PollerSettings,

    roster: HashMap<String, VmRecord>,
    live_update: HashSet<String>,
    old_states: HashMap<String, VMState>,
    old_tasks: HashMap<String, String>,
    net_usage: HashMap<String, NetAccumulator>,
}

impl Poller {
    pub fn new(
        hypervisor: Arc<dyn HypervisorApi>,
        cache: Arc<dyn StateCache>,
        store: Arc<dyn VmStore>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            hypervisor,
            cache,
            store,
            settings,
            roster: HashMap::new(),
            live_update: HashSet::new(),
            old_states: HashMap::new(),
            old_tasks: HashMap::new(),
            net_usage: HashMap::new(),
        }
    }

    /// Recharge le roster des VMs actives et le sous-ensemble "récemment
    /// consulté" ; purge les cumuls réseau des VMs sorties du roster
    pub async fn refresh_roster(&mut self) -> Result<()> {
        let vms = self.store.active_vms().await?;
        let now = OffsetDateTime::now_utc();

        self.roster.clear();
        self.live_update.clear();
        for vm in vms {
            if let Some(accessed) = vm.last_accessed_at {
                if now - accessed < self.settings.live_window {
                    self.live_update.insert(vm.id.clone());
                }
            }
            self.roster.insert(vm.id.clone(), vm);
        }

        let roster = &self.roster;
        self.net_usage.retain(|vm_id, _| roster.contains_key(vm_id));
        Ok(())
    }

    /// Tick d'état : un document par VM du roster, TTL court, publication
    /// immédiate des transitions d'alimentation
    pub async fn poll_vm_states(&mut self) -> Result<()> {
        let resources = self.hypervisor.cluster_resources().await?;
        for resource in resources {
            // le nom encode le propriétaire et l'id VM ; noms étrangers ignorés
            let Some(vm_id) = parse_hypervisor_name(&resource.name) else { continue };
            let Some(record) = self.roster.get(vm_id) else { continue };
            let bandwidth_max = record.network_bandwidth_bytes;
            let vm_id = vm_id.to_string();

            let usage = self.net_usage.get(&vm_id);
            let mut state = VMState {
                status: if resource.status == "running" {
                    PowerState::Running
                } else {
                    PowerState::Stopped
                },
                cpu_usage_percent: resource.cpu * 100.0,
                memory_usage_bytes: resource.mem,
                memory_max_bytes: resource.maxmem,
                uptime_seconds: resource.uptime,
                bandwidth_in_bytes: usage.map(|u| u.total_in).unwrap_or(0),
                bandwidth_out_bytes: usage.map(|u| u.total_out).unwrap_or(0),
                bandwidth_max_bytes: bandwidth_max,
                node: resource.node.clone(),
                vmid: resource.vmid,
            };

            // lecture resserrée pour les VMs consultées récemment
            if self.live_update.contains(&vm_id) {
                let vm_ref = VmRef { node: resource.node.clone(), vmid: resource.vmid };
                let fast = self.hypervisor.current_status(&vm_ref).await?;
                state.cpu_usage_percent = fast.cpu * 100.0;
                state.memory_usage_bytes = fast.mem;
            }

            let payload = serde_json::to_string(&state)?;
            self.cache
                .set_with_ttl(&vm_state_key(&vm_id), &payload, self.settings.state_ttl)
                .await?;

            let old_status = self
                .old_states
                .get(&vm_id)
                .map(|old| old.status)
                .unwrap_or(PowerState::Unknown);
            if old_status != state.status {
                info!(vm = %vm_id, old = %old_status, new = %state.status, "vm power state change");
                let change = VMPowerStateChange {
                    vm_id: vm_id.clone(),
                    old_power_state: old_status,
                    new_power_state: state.status,
                };
                // publication par VM, avant de passer à la suivante : les
                // waiters doivent voir la transition sans délai
                self.cache
                    .publish(CHANNEL_POWER_CHANGE, &serde_json::to_string(&change)?)
                    .await?;
            }

            let accumulator = self
                .net_usage
                .entry(vm_id.clone())
                .or_insert_with(|| NetAccumulator::new(resource.netin, resource.netout));
            accumulator.record(resource.netin, resource.netout);

            self.old_states.insert(vm_id, state);
        }
        Ok(())
    }

    /// Tick tâches : publie tout statut différent du dernier vu
    pub async fn poll_tasks(&mut self) -> Result<()> {
        let tasks = self.hypervisor.cluster_tasks().await?;
        for task in tasks {
            let Some(task_id) = task.upid else { continue };
            let Some(status) = task.status else { continue };

            let old_status = self.old_tasks.get(&task_id).cloned();
            if old_status.as_deref() != Some(status.as_str()) {
                let change = TaskChange {
                    task_id: task_id.clone(),
                    old_status,
                    new_status: status.clone(),
                };
                self.cache
                    .publish(CHANNEL_TASK_CHANGE, &serde_json::to_string(&change)?)
                    .await?;
            }
            self.old_tasks.insert(task_id, status);
        }
        Ok(())
    }

    /// Boucle principale : trois ticks planifiés indépendamment, un échec
    /// est loggé et n'empêche jamais les ticks suivants
    pub async fn run(mut self) {
        if let Err(e) = self.refresh_roster().await {
            error!("initial roster load failed: {e:#}");
        }

        let mut roster_tick = tokio::time::interval(self.settings.roster_interval);
        let mut state_tick = tokio::time::interval(self.settings.state_interval);
        let mut task_tick = tokio::time::interval(self.settings.task_interval);
        roster_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        state_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        task_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = roster_tick.tick() => {
                    if let Err(e) = self.refresh_roster().await {
                        warn!("roster refresh failed: {e:#}");
                    }
                }
                _ = state_tick.tick() => {
                    if let Err(e) = self.poll_vm_states().await {
                        warn!("vm state tick failed: {e:#}");
                    }
                }
                _ = task_tick.tick() => {
                    if let Err(e) = self.poll_tasks().await {
                        warn!("task tick failed: {e:#}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_devkit::{fixtures, FakeHypervisor};
    use nimbus_shared::cache::MemoryCache;
    use nimbus_shared::models::{CHANNEL_PATTERN, InstallStatus};
    use nimbus_shared::store::JsonFileStore;

    fn settings() -> PollerSettings {
        PollerSettings {
            roster_interval: Duration::from_millis(500),
            state_interval: Duration::from_millis(20),
            task_interval: Duration::from_millis(20),
            state_ttl: Duration::from_millis(500),
            live_window: time::Duration::minutes(2),
        }
    }

    #[test]
    fn test_net_accumulator_ignores_counter_reset() {
        let mut acc = NetAccumulator::new(100, 10);
        acc.record(150, 30);
        assert_eq!((acc.total_in, acc.total_out), (50, 20));

        // reset du compteur (redémarrage VM) : l'échantillon compte zéro
        acc.record(20, 5);
        assert_eq!((acc.total_in, acc.total_out), (50, 20));

        acc.record(70, 25);
        assert_eq!((acc.total_in, acc.total_out), (100, 40));
    }

    #[test]
    fn test_net_accumulator_first_sample_contributes_zero() {
        let mut acc = NetAccumulator::new(1000, 2000);
        acc.record(1000, 2000);
        assert_eq!((acc.total_in, acc.total_out), (0, 0));
    }

    async fn seeded(
        record: nimbus_shared::models::VmRecord,
    ) -> (FakeHypervisor, MemoryCache, Poller) {
        let fake = FakeHypervisor::new();
        let cache = MemoryCache::new();
        let store = JsonFileStore::in_memory();
        let name = record.hypervisor_name();
        store.insert_vm(record).await.unwrap();
        fake.add_vm(100, &name, "n1", "running");

        let poller = Poller::new(
            Arc::new(fake.clone()),
            Arc::new(cache.clone()),
            Arc::new(store),
            settings(),
        );
        (fake, cache, poller)
    }

    #[tokio::test]
    async fn test_state_tick_populates_cache_and_publishes_transition() {
        let (_fake, cache, mut poller) = seeded(fixtures::vm_record("vmx")).await;
        let mut rx = cache.subscribe_pattern(CHANNEL_PATTERN).await.unwrap();

        poller.refresh_roster().await.unwrap();
        poller.poll_vm_states().await.unwrap();

        let raw = cache.get(&vm_state_key("vmx")).await.unwrap().unwrap();
        let state: VMState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state.status, PowerState::Running);
        assert_eq!(state.vmid, 100);
        // VM récemment consultée : lecture haute fidélité appliquée
        assert!((state.cpu_usage_percent - 10.0).abs() < f64::EPSILON);

        // premier tick : transition unknown -> running publiée
        let msg = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.channel, CHANNEL_POWER_CHANGE);
        let change: VMPowerStateChange = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(change.old_power_state, PowerState::Unknown);
        assert_eq!(change.new_power_state, PowerState::Running);

        // second tick sans changement : rien de publié
        poller.poll_vm_states().await.unwrap();
        let none = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(none.is_err());
    }

    #[tokio::test]
    async fn test_vms_outside_roster_are_ignored() {
        let (fake, cache, mut poller) = seeded(fixtures::vm_record("vmy")).await;
        // VM au nom bien formé mais inconnue du roster + nom malformé
        fake.add_vm(200, "Eve-99-ghost", "n1", "running");
        fake.add_vm(201, "template", "n1", "stopped");

        poller.refresh_roster().await.unwrap();
        poller.poll_vm_states().await.unwrap();

        assert!(cache.get(&vm_state_key("vmy")).await.unwrap().is_some());
        assert!(cache.get(&vm_state_key("ghost")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_vm_not_polled() {
        let mut record = fixtures::vm_record("vmz");
        record.expires_at = Some(OffsetDateTime::now_utc() - time::Duration::hours(1));
        record.install_status = InstallStatus::Ok;
        let (_fake, cache, mut poller) = seeded(record).await;

        poller.refresh_roster().await.unwrap();
        poller.poll_vm_states().await.unwrap();

        assert!(cache.get(&vm_state_key("vmz")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_task_tick_publishes_status_changes_once() {
        let fake = FakeHypervisor::new();
        let cache = MemoryCache::new();
        let store = JsonFileStore::in_memory();
        let mut poller = Poller::new(
            Arc::new(fake.clone()),
            Arc::new(cache.clone()),
            Arc::new(store),
            settings(),
        );
        let mut rx = cache.subscribe_pattern(CHANNEL_PATTERN).await.unwrap();

        // une tâche apparaît (création de VM factice)
        fake.add_vm(100, "a-1-t", "n1", "stopped");
        let vm = VmRef { node: "n1".into(), vmid: 100 };
        let task_id = fake.power_action(&vm, nimbus_shared::hypervisor::PowerAction::Start).await.unwrap();

        // premier tick : statut initial "running" publié
        poller.poll_tasks().await.unwrap();
        let msg = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let change: TaskChange = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(change.task_id, task_id);
        assert_eq!(change.new_status, "running");
        assert_eq!(change.old_status, None);

        // second tick : la tâche a terminé, transition running -> OK
        poller.poll_tasks().await.unwrap();
        let msg = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let change: TaskChange = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(change.new_status, "OK");
        assert_eq!(change.old_status.as_deref(), Some("running"));

        // troisième tick : statut stable, aucune publication
        poller.poll_tasks().await.unwrap();
        let none = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(none.is_err());
    }
}
