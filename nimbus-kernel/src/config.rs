use crate::install::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct KernelConfig {
    #[serde(default)]
    pub api: ApiConf,
    #[serde(default)]
    pub cache: CacheConf,
    #[serde(default)]
    pub hypervisor: HypervisorConf,
    #[serde(default)]
    pub store: StoreConf,
    #[serde(default)]
    pub snippets: SnippetsConf,
    #[serde(default)]
    pub timeouts: TimeoutsConf,
    #[serde(default)]
    pub livelog: LiveLogConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiConf {
    pub bind: String,
}

impl Default for ApiConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
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
    /// Token API, format `user@realm!name=uuid`
    pub token: String,
    pub verify_tls: bool,
    pub default_node: String,
    /// Stockage des disques et images sur chaque noeud
    pub storage: String,
    /// Stockage portant les snippets cloud-init
    pub snippet_storage: String,
    /// Bridge réseau standard des NICs virtuelles
    pub net_bridge: String,
}

impl Default for HypervisorConf {
    fn default() -> Self {
        Self {
            url: "https://127.0.0.1:8006".into(),
            token: String::new(),
            verify_tls: false,
            default_node: "node1".into(),
            storage: "local".into(),
            snippet_storage: "cloudinit".into(),
            net_bridge: "vmbr0".into(),
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
pub struct SnippetsConf {
    pub dir: String,
}

impl Default for SnippetsConf {
    fn default() -> Self {
        Self { dir: "./data/snippets".into() }
    }
}

/// Bornes des attentes sur systèmes externes ; chaque primitive bloquante
/// du pipeline en consomme une, aucune attente n'est illimitée.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TimeoutsConf {
    pub task_ms: u64,
    pub image_download_ms: u64,
    pub power_change_ms: u64,
    pub agent_online_ms: u64,
    pub agent_poll_ms: u64,
    pub state_retry_delay_ms: u64,
    pub state_max_retries: u32,
    pub state_removed_max_retries: u32,
}

impl Default for TimeoutsConf {
    fn default() -> Self {
        Self {
            task_ms: 300_000,
            image_download_ms: 600_000,
            power_change_ms: 120_000,
            agent_online_ms: 60_000,
            agent_poll_ms: 1_000,
            state_retry_delay_ms: 6_000,
            state_max_retries: 10,
            state_removed_max_retries: 50,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LiveLogConf {
    /// Durée de rétention des opérations terminées (secondes)
    pub retention_secs: u64,
    pub sweep_secs: u64,
}

impl Default for LiveLogConf {
    fn default() -> Self {
        Self { retention_secs: 3_600, sweep_secs: 300 }
    }
}

impl KernelConfig {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            storage: self.hypervisor.storage.clone(),
            snippet_storage: self.hypervisor.snippet_storage.clone(),
            net_bridge: self.hypervisor.net_bridge.clone(),
            task_timeout: Duration::from_millis(self.timeouts.task_ms),
            image_download_timeout: Duration::from_millis(self.timeouts.image_download_ms),
            power_change_timeout: Duration::from_millis(self.timeouts.power_change_ms),
            agent_timeout: Duration::from_millis(self.timeouts.agent_online_ms),
            agent_poll: Duration::from_millis(self.timeouts.agent_poll_ms),
            state_retry_delay: Duration::from_millis(self.timeouts.state_retry_delay_ms),
            state_max_retries: self.timeouts.state_max_retries,
            state_removed_max_retries: self.timeouts.state_removed_max_retries,
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("NIMBUS_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return KernelConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            eprintln!("[kernel] config invalide: {e}");
            KernelConfig::default()
        })
    } else {
        eprintln!("[kernel] pas de kernel.yaml, usage config par défaut");
        KernelConfig::default()
    }
}
