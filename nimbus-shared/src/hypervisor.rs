/**
 * CLIENT HYPERVISEUR - Capacité opaque vers le plan de contrôle du cluster
 *
 * RÔLE : Tout ce que le moteur demande à l'hyperviseur passe par le trait
 * `HypervisorApi` : inventaire cluster, cycle de vie qemu, firewall,
 * stockage, guest agent. `PveClient` est l'implémentation HTTP réelle.
 *
 * Les opérations longues (create, delete, download) retournent un id de
 * tâche opaque ; leur complétion s'observe via le poller + pub/sub.
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum HyperError {
    #[error("hypervisor request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("hypervisor rejected {context}: {message}")]
    Api { context: String, message: String },
    #[error("unexpected hypervisor response: {0}")]
    Decode(String),
}

/// Adresse d'une VM côté hyperviseur (noeud + id numérique)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRef {
    pub node: String,
    pub vmid: u32,
}

/// Ressource qemu telle que listée au niveau cluster
#[derive(Debug, Clone, Deserialize)]
pub struct QemuResource {
    pub vmid: u32,
    pub name: String,
    pub status: String,
    pub node: String,
    /// Part CPU entre 0.0 et 1.0
    pub cpu: f64,
    pub mem: u64,
    pub maxmem: u64,
    pub uptime: u64,
    pub netin: u64,
    pub netout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterTask {
    pub upid: Option<String>,
    pub status: Option<String>,
    pub node: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmCurrentStatus {
    pub status: String,
    pub cpu: f64,
    pub mem: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageContent {
    pub volid: String,
    pub size: u64,
    pub content: String,
}

impl StorageContent {
    /// Nom de fichier sans le préfixe de volume (`local:iso/x.img` -> `x.img`)
    pub fn file_name(&self) -> &str {
        self.volid.rsplit('/').next().unwrap_or(&self.volid)
    }
}

/// Paramètres de création qemu ; les clés suivent le formulaire de l'API.
#[derive(Debug, Clone, Serialize)]
pub struct CreateVmParams {
    pub name: String,
    pub description: String,
    pub ostype: String,
    pub bios: String,
    pub bootdisk: String,
    pub cores: u32,
    pub sockets: u32,
    /// Mémoire en MiB
    pub memory: u64,
    pub net0: String,
    pub ide2: String,
    pub cicustom: String,
    pub agent: String,
    pub scsihw: String,
    pub virtio0: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub efidisk0: Option<String>,
    pub onboot: bool,
    pub cpu: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
    Shutdown,
    Reboot,
    Reset,
    Suspend,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Shutdown => "shutdown",
            PowerAction::Reboot => "reboot",
            PowerAction::Reset => "reset",
            PowerAction::Suspend => "suspend",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FirewallRule {
    pub action: String,
    /// "in" ou "out"
    pub direction: String,
    pub source: String,
    pub dest: String,
    pub enable: bool,
}

#[derive(Debug, Clone)]
pub struct FirewallOptions {
    pub enable: bool,
    pub policy_in: String,
    pub policy_out: String,
}

#[async_trait]
pub trait HypervisorApi: Send + Sync {
    async fn cluster_resources(&self) -> Result<Vec<QemuResource>, HyperError>;
    async fn cluster_tasks(&self) -> Result<Vec<ClusterTask>, HyperError>;
    async fn current_status(&self, vm: &VmRef) -> Result<VmCurrentStatus, HyperError>;

    /// Retourne l'id de la tâche de création
    async fn create_vm(&self, vm: &VmRef, params: &CreateVmParams) -> Result<String, HyperError>;
    /// Retourne l'id de la tâche de suppression
    async fn delete_vm(&self, vm: &VmRef) -> Result<String, HyperError>;
    async fn resize_disk(&self, vm: &VmRef, disk: &str, size: &str) -> Result<(), HyperError>;
    /// Retourne l'id de la tâche d'alimentation
    async fn power_action(&self, vm: &VmRef, action: PowerAction) -> Result<String, HyperError>;

    async fn vm_config(&self, vm: &VmRef) -> Result<HashMap<String, serde_json::Value>, HyperError>;
    async fn set_vm_config(&self, vm: &VmRef, values: &HashMap<String, String>) -> Result<(), HyperError>;
    async fn delete_vm_config_keys(&self, vm: &VmRef, keys: &[String]) -> Result<(), HyperError>;

    async fn firewall_create_ipset(&self, vm: &VmRef, name: &str) -> Result<(), HyperError>;
    async fn firewall_add_to_ipset(&self, vm: &VmRef, ipset: &str, cidr: &str) -> Result<(), HyperError>;
    async fn firewall_set_options(&self, vm: &VmRef, options: &FirewallOptions) -> Result<(), HyperError>;
    async fn firewall_add_rule(&self, vm: &VmRef, rule: &FirewallRule) -> Result<(), HyperError>;

    async fn storage_content(&self, node: &str, storage: &str) -> Result<Vec<StorageContent>, HyperError>;
    /// Déclenche un téléchargement asynchrone vers le stockage du noeud ;
    /// retourne l'id de la tâche de téléchargement.
    async fn storage_download_url(
        &self,
        node: &str,
        storage: &str,
        url: &str,
        file_name: &str,
    ) -> Result<String, HyperError>;

    /// Sonde de vivacité du guest agent ; `false` couvre aussi les erreurs
    /// de transport (agent pas encore démarré).
    async fn agent_ping(&self, vm: &VmRef) -> bool;
    async fn agent_exec(&self, vm: &VmRef, command: &str, input: &str) -> Result<(), HyperError>;
    async fn agent_set_password(&self, vm: &VmRef, username: &str, password: &str) -> Result<(), HyperError>;
}

/// Enveloppe standard des réponses de l'API
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    data: T,
}

/// Client HTTP du plan de contrôle (API compatible PVE, token statique).
pub struct PveClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl PveClient {
    pub fn new(base_url: &str, token: &str, verify_tls: bool) -> Result<Self, HyperError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api2/json/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, HyperError> {
        let resp = self
            .http
            .get(self.url(path))
            .header("Authorization", format!("PVEAPIToken={}", self.token))
            .send()
            .await?;
        Self::decode(path, resp).await
    }

    async fn send_json<T: serde::de::DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<T, HyperError> {
        let resp = self
            .http
            .request(method, self.url(path))
            .header("Authorization", format!("PVEAPIToken={}", self.token))
            .json(body)
            .send()
            .await?;
        Self::decode(path, resp).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        path: &str,
        resp: reqwest::Response,
    ) -> Result<T, HyperError> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(HyperError::Api {
                context: path.to_string(),
                message: format!("{status}: {message}"),
            });
        }
        let envelope: ApiEnvelope<T> = resp
            .json()
            .await
            .map_err(|e| HyperError::Decode(format!("{path}: {e}")))?;
        Ok(envelope.data)
    }

    fn qemu_path(vm: &VmRef, suffix: &str) -> String {
        format!("nodes/{}/qemu/{}/{}", vm.node, vm.vmid, suffix)
    }
}

#[async_trait]
impl HypervisorApi for PveClient {
    async fn cluster_resources(&self) -> Result<Vec<QemuResource>, HyperError> {
        // la liste cluster mélange noeuds/stockages/VMs ; on ne garde que qemu
        let raw: Vec<serde_json::Value> = self.get_json("cluster/resources").await?;
        let mut out = Vec::new();
        for item in raw {
            if item.get("type").and_then(|t| t.as_str()) == Some("qemu") {
                match serde_json::from_value::<QemuResource>(item) {
                    Ok(resource) => out.push(resource),
                    Err(e) => return Err(HyperError::Decode(format!("cluster/resources: {e}"))),
                }
            }
        }
        Ok(out)
    }

    async fn cluster_tasks(&self) -> Result<Vec<ClusterTask>, HyperError> {
        self.get_json("cluster/tasks").await
    }

    async fn current_status(&self, vm: &VmRef) -> Result<VmCurrentStatus, HyperError> {
        self.get_json(&Self::qemu_path(vm, "status/current")).await
    }

    async fn create_vm(&self, vm: &VmRef, params: &CreateVmParams) -> Result<String, HyperError> {
        #[derive(Serialize)]
        struct Body<'a> {
            vmid: u32,
            #[serde(flatten)]
            params: &'a CreateVmParams,
        }
        self.send_json(
            reqwest::Method::POST,
            &format!("nodes/{}/qemu", vm.node),
            &Body { vmid: vm.vmid, params },
        )
        .await
    }

    async fn delete_vm(&self, vm: &VmRef) -> Result<String, HyperError> {
        self.send_json(
            reqwest::Method::DELETE,
            &format!("nodes/{}/qemu/{}", vm.node, vm.vmid),
            &serde_json::json!({}),
        )
        .await
    }

    async fn resize_disk(&self, vm: &VmRef, disk: &str, size: &str) -> Result<(), HyperError> {
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::PUT,
                &Self::qemu_path(vm, "resize"),
                &serde_json::json!({ "disk": disk, "size": size }),
            )
            .await?;
        Ok(())
    }

    async fn power_action(&self, vm: &VmRef, action: PowerAction) -> Result<String, HyperError> {
        self.send_json(
            reqwest::Method::POST,
            &Self::qemu_path(vm, &format!("status/{}", action.as_str())),
            &serde_json::json!({}),
        )
        .await
    }

    async fn vm_config(&self, vm: &VmRef) -> Result<HashMap<String, serde_json::Value>, HyperError> {
        self.get_json(&Self::qemu_path(vm, "config")).await
    }

    async fn set_vm_config(&self, vm: &VmRef, values: &HashMap<String, String>) -> Result<(), HyperError> {
        let _: serde_json::Value = self
            .send_json(reqwest::Method::PUT, &Self::qemu_path(vm, "config"), values)
            .await?;
        Ok(())
    }

    async fn delete_vm_config_keys(&self, vm: &VmRef, keys: &[String]) -> Result<(), HyperError> {
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::PUT,
                &Self::qemu_path(vm, "config"),
                &serde_json::json!({ "delete": keys.join(",") }),
            )
            .await?;
        Ok(())
    }

    async fn firewall_create_ipset(&self, vm: &VmRef, name: &str) -> Result<(), HyperError> {
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::POST,
                &Self::qemu_path(vm, "firewall/ipset"),
                &serde_json::json!({ "name": name }),
            )
            .await?;
        Ok(())
    }

    async fn firewall_add_to_ipset(&self, vm: &VmRef, ipset: &str, cidr: &str) -> Result<(), HyperError> {
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::POST,
                &Self::qemu_path(vm, &format!("firewall/ipset/{ipset}")),
                &serde_json::json!({ "cidr": cidr, "nomatch": false }),
            )
            .await?;
        Ok(())
    }

    async fn firewall_set_options(&self, vm: &VmRef, options: &FirewallOptions) -> Result<(), HyperError> {
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::PUT,
                &Self::qemu_path(vm, "firewall/options"),
                &serde_json::json!({
                    "enable": options.enable,
                    "policy_in": options.policy_in,
                    "policy_out": options.policy_out,
                }),
            )
            .await?;
        Ok(())
    }

    async fn firewall_add_rule(&self, vm: &VmRef, rule: &FirewallRule) -> Result<(), HyperError> {
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::POST,
                &Self::qemu_path(vm, "firewall/rules"),
                &serde_json::json!({
                    "action": rule.action,
                    "type": rule.direction,
                    "source": rule.source,
                    "dest": rule.dest,
                    "enable": rule.enable,
                }),
            )
            .await?;
        Ok(())
    }

    async fn storage_content(&self, node: &str, storage: &str) -> Result<Vec<StorageContent>, HyperError> {
        self.get_json(&format!("nodes/{node}/storage/{storage}/content")).await
    }

    async fn storage_download_url(
        &self,
        node: &str,
        storage: &str,
        url: &str,
        file_name: &str,
    ) -> Result<String, HyperError> {
        self.send_json(
            reqwest::Method::POST,
            &format!("nodes/{node}/storage/{storage}/download-url"),
            &serde_json::json!({
                "filename": file_name,
                "content": "iso",
                "url": url,
                "verify-certificates": 0,
            }),
        )
        .await
    }

    async fn agent_ping(&self, vm: &VmRef) -> bool {
        let result: Result<serde_json::Value, HyperError> = self
            .send_json(
                reqwest::Method::POST,
                &Self::qemu_path(vm, "agent/ping"),
                &serde_json::json!({}),
            )
            .await;
        result.is_ok()
    }

    async fn agent_exec(&self, vm: &VmRef, command: &str, input: &str) -> Result<(), HyperError> {
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::POST,
                &Self::qemu_path(vm, "agent/exec"),
                &serde_json::json!({ "command": command, "input-data": input }),
            )
            .await?;
        Ok(())
    }

    async fn agent_set_password(&self, vm: &VmRef, username: &str, password: &str) -> Result<(), HyperError> {
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::POST,
                &Self::qemu_path(vm, "agent/set-user-password"),
                &serde_json::json!({ "username": username, "password": password }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_content_file_name() {
        let item = StorageContent {
            volid: "local:iso/abc123.img".into(),
            size: 42,
            content: "iso".into(),
        };
        assert_eq!(item.file_name(), "abc123.img");
    }

    #[test]
    fn test_create_params_skip_efidisk() {
        let params = CreateVmParams {
            name: "n".into(),
            description: String::new(),
            ostype: "l26".into(),
            bios: "seabios".into(),
            bootdisk: "scsi0".into(),
            cores: 1,
            sockets: 1,
            memory: 1024,
            net0: "virtio,bridge=vmbr0".into(),
            ide2: "local:cloudinit,media=cdrom".into(),
            cicustom: String::new(),
            agent: "enabled=1".into(),
            scsihw: "virtio-scsi-single".into(),
            virtio0: "local:0".into(),
            efidisk0: None,
            onboot: true,
            cpu: "host".into(),
        };
        let json = serde_json::to_value(&params).unwrap();
        assert!(json.get("efidisk0").is_none());
        assert_eq!(json["bios"], "seabios");
    }
}
