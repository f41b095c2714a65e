use crate::poller::PollerSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PollerConfig {
    #[serde(default)]
    pub cache: CacheConf,
    #[serde(default)]
    pub hypervisor: HypervisorConf,
    #[serde(default)]
    pub store: StoreConf,
    #[serde(default)]
    pub ticks: TicksConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheConf {
    pub url: String,
}

impl Default for CacheConf {
    fn default() -> Self {
        Self { url: "redis://127.0.0.1:6379".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HypervisorConf {
    pub url: String,
    pub token: String,
    pub verify_tls: bool,
}

impl Default for HypervisorConf {
    fn default() -> Self {
        Self {
            url: "https://127.0.0.1:8006".into(),
            token: String::new(),
            verify_tls: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConf {
    pub path: String,
}

impl Default for StoreConf {
    fn default() -> Self {
        Self { path: "./data/store.json".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TicksConf {
    pub roster_ms: u64,
    pub state_ms: u64,
    pub task_ms: u64,
    pub state_ttl_ms: u64,
    pub live_window_secs: i64,
}

impl Default for TicksConf {
    fn default() -> Self {
        Self {
            roster_ms: 15_000,
            state_ms: 1_000,
            task_ms: 1_000,
            state_ttl_ms: 10_000,
            live_window_secs: 120,
        }
    }
}

impl PollerConfig {
    pub fn settings(&self) -> PollerSettings {
        PollerSettings {
            roster_interval: Duration::from_millis(self.ticks.roster_ms),
            state_interval: Duration::from_millis(self.ticks.state_ms),
            task_interval: Duration::from_millis(self.ticks.task_ms),
            state_ttl: Duration::from_millis(self.ticks.state_ttl_ms),
            live_window: time::Duration::seconds(self.ticks.live_window_secs),
        }
    }
}

pub async fn load_config() -> PollerConfig {
    let path = std::env::var("NIMBUS_POLLER_CONFIG").unwrap_or_else(|_| "poller.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return PollerConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            tracing::error!("invalid poller config: {e}");
            PollerConfig::default()
        })
    } else {
        tracing::warn!("no poller.yaml found, using default config");
        PollerConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ttl_exceeds_state_tick() {
        let cfg = PollerConfig::default();
        // le TTL doit couvrir plusieurs ticks pour tolérer un tick lent
        assert!(cfg.ticks.state_ttl_ms >= 3 * cfg.ticks.state_ms);
    }
}
