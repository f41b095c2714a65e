use nimbus_devkit::FakeHypervisor;
use nimbus_kernel::bridge::EventBridge;
use nimbus_kernel::install::placement::StaticNodeSelector;
use nimbus_kernel::install::{Pipeline, PipelineConfig};
use nimbus_kernel::livelog::{LiveLogs, OperationLog, OperationStatus};
use nimbus_kernel::locks::VmLocks;
use nimbus_kernel::snippets::MemorySnippetStore;
use nimbus_poller::poller::{Poller, PollerSettings};
use nimbus_shared::cache::{MemoryCache, StateCache};
use nimbus_shared::store::{JsonFileStore, VmStore};
use std::sync::Arc;
use std::time::Duration;

/// Banc de test complet : pipeline réel + poller réel sur un faux
/// hyperviseur et un cache mémoire, tout en intervalles courts
pub struct Harness {
    pub fake: FakeHypervisor,
    pub cache: MemoryCache,
    pub store: Arc<JsonFileStore>,
    pub snippets: MemorySnippetStore,
    pub pipeline: Pipeline,
    pub logs: LiveLogs,
    poller_handle: tokio::task::JoinHandle<()>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.poller_handle.abort();
    }
}

pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        storage: "local".into(),
        snippet_storage: "cloudinit".into(),
        net_bridge: "vmbr0".into(),
        task_timeout: Duration::from_secs(2),
        image_download_timeout: Duration::from_secs(2),
        power_change_timeout: Duration::from_secs(2),
        agent_timeout: Duration::from_millis(500),
        agent_poll: Duration::from_millis(20),
        state_retry_delay: Duration::from_millis(30),
        state_max_retries: 40,
        state_removed_max_retries: 40,
    }
}

pub async fn harness() -> Harness {
    let fake = FakeHypervisor::new();
    let cache = MemoryCache::new();
    let store = Arc::new(JsonFileStore::in_memory());
    let snippets = MemorySnippetStore::new();

    let bridge = EventBridge::connect(&cache).await.unwrap();
    let logs = LiveLogs::new();

    let store_dyn: Arc<dyn VmStore> = store.clone();
    let cache_dyn: Arc<dyn StateCache> = Arc::new(cache.clone());
    let pipeline = Pipeline {
        store: store_dyn,
        cache: cache_dyn,
        hypervisor: Arc::new(fake.clone()),
        snippets: Arc::new(snippets.clone()),
        bridge,
        selector: Arc::new(StaticNodeSelector { node: "n1".into() }),
        locks: VmLocks::new(),
        logs: logs.clone(),
        cfg: pipeline_config(),
    };

    let poller = Poller::new(
        Arc::new(fake.clone()),
        Arc::new(cache.clone()),
        store.clone(),
        PollerSettings {
            roster_interval: Duration::from_millis(100),
            state_interval: Duration::from_millis(20),
            task_interval: Duration::from_millis(20),
            state_ttl: Duration::from_millis(400),
            live_window: time::Duration::minutes(2),
        },
    );
    let poller_handle = tokio::spawn(poller.run());

    Harness { fake, cache, store, snippets, pipeline, logs, poller_handle }
}

/// Relit le journal en polling jusqu'à l'état terminal, comme un appelant
pub async fn wait_terminal(logs: &LiveLogs, operation_id: &str) -> OperationLog {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let log = logs.get(operation_id).expect("operation log should exist");
        if log.status != OperationStatus::Working {
            return log;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "operation {operation_id} did not reach a terminal state"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Attend que le poller ait matérialisé l'état d'une VM dans le cache
pub async fn wait_state_present(cache: &MemoryCache, vm_id: &str) {
    let key = nimbus_shared::models::vm_state_key(vm_id);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while cache.get(&key).await.unwrap().is_none() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "state of {vm_id} never appeared in the cache"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
