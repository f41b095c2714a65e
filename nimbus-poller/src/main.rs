use nimbus_poller::config;
use nimbus_poller::poller::Poller;
use nimbus_shared::cache::RedisCache;
use nimbus_shared::hypervisor::PveClient;
use nimbus_shared::store::JsonFileStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let cfg = config::load_config().await;

    let cache = Arc::new(RedisCache::connect(&cfg.cache.url).await?);
    let store = Arc::new(JsonFileStore::open(&cfg.store.path).await?);
    let hypervisor = Arc::new(PveClient::new(
        &cfg.hypervisor.url,
        &cfg.hypervisor.token,
        cfg.hypervisor.verify_tls,
    )?);

    tracing::info!("poller started, mirroring hypervisor state into the cache");
    let poller = Poller::new(hypervisor, cache, store, cfg.settings());
    poller.run().await;
    Ok(())
}
