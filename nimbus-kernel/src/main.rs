use nimbus_kernel::bridge::EventBridge;
use nimbus_kernel::config;
use nimbus_kernel::http::{self, AppState};
use nimbus_kernel::install::placement::StaticNodeSelector;
use nimbus_kernel::install::{Pipeline, PipelineConfig};
use nimbus_kernel::livelog::LiveLogs;
use nimbus_kernel::locks::VmLocks;
use nimbus_kernel::snippets::DirSnippetStore;
use nimbus_shared::cache::{RedisCache, StateCache};
use nimbus_shared::hypervisor::{HypervisorApi, PveClient};
use nimbus_shared::store::{JsonFileStore, VmStore};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let cfg = config::load_config().await;

    let cache: Arc<dyn StateCache> = match RedisCache::connect(&cfg.cache.url).await {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            eprintln!("[kernel] failed to connect to state cache: {e}");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn VmStore> = match JsonFileStore::open(&cfg.store.path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("[kernel] failed to open vm store {}: {e}", cfg.store.path);
            std::process::exit(1);
        }
    };

    let hypervisor: Arc<dyn HypervisorApi> = match PveClient::new(
        &cfg.hypervisor.url,
        &cfg.hypervisor.token,
        cfg.hypervisor.verify_tls,
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("[kernel] failed to build hypervisor client: {e}");
            std::process::exit(1);
        }
    };

    // Bridge d'événements : un seul abonnement pattern pour tout le processus
    let bridge = match EventBridge::connect(cache.as_ref()).await {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("[kernel] failed to subscribe to state cache events: {e}");
            std::process::exit(1);
        }
    };

    // Journaux de progression + éviction périodique des opérations finies
    let logs = LiveLogs::new();
    logs.spawn_sweeper(
        Duration::from_secs(cfg.livelog.retention_secs),
        Duration::from_secs(cfg.livelog.sweep_secs),
    );

    let pipeline_cfg: PipelineConfig = cfg.pipeline_config();
    let pipeline = Pipeline {
        store: store.clone(),
        cache: cache.clone(),
        hypervisor,
        snippets: Arc::new(DirSnippetStore::new(&cfg.snippets.dir)),
        bridge,
        selector: Arc::new(StaticNodeSelector { node: cfg.hypervisor.default_node.clone() }),
        locks: VmLocks::new(),
        logs: logs.clone(),
        cfg: pipeline_cfg,
    };

    let app = http::build_router(AppState { pipeline, cache, store });

    let addr: SocketAddr = cfg.api.bind.parse().unwrap_or_else(|_| {
        eprintln!("[kernel] invalid bind address {}, falling back", cfg.api.bind);
        SocketAddr::from(([0, 0, 0, 0], 8080))
    });
    println!("[kernel] listening on http://{addr}");
    let listener = TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
