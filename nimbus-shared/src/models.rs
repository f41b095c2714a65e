use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Canal pub/sub des transitions d'alimentation VM
pub const CHANNEL_POWER_CHANGE: &str = "hypervisor:vm-power-change";
/// Canal pub/sub des changements de statut de tâche
pub const CHANNEL_TASK_CHANGE: &str = "hypervisor:task-change";
/// Pattern d'abonnement couvrant tous les événements hyperviseur
pub const CHANNEL_PATTERN: &str = "hypervisor:*";

pub fn vm_state_key(vm_id: &str) -> String {
    format!("vm:{vm_id}:state")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
    Unknown,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::Running => write!(f, "running"),
            PowerState::Stopped => write!(f, "stopped"),
            PowerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Document d'état d'une VM, une entrée par VM dans le cache partagé.
/// L'absence de la clé signifie "inconnue du système" : les lecteurs doivent
/// distinguer "pas encore vue" de "confirmée absente" par retry borné.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VMState {
    pub status: PowerState,
    pub cpu_usage_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_max_bytes: u64,
    pub uptime_seconds: u64,
    pub bandwidth_in_bytes: u64,
    pub bandwidth_out_bytes: u64,
    pub bandwidth_max_bytes: u64,
    pub node: String,
    pub vmid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VMPowerStateChange {
    pub vm_id: String,
    pub old_power_state: PowerState,
    pub new_power_state: PowerState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskChange {
    pub task_id: String,
    pub old_status: Option<String>,
    pub new_status: String,
}

pub const TASK_STATUS_OK: &str = "OK";
pub const TASK_STATUS_FAILED: &str = "FAILED";

pub fn task_status_is_terminal(status: &str) -> bool {
    status == TASK_STATUS_OK || status == TASK_STATUS_FAILED
}

/// Statut d'installation persisté dans le store ; c'est l'état de cycle de
/// vie qui fait foi, le cache n'en est qu'un miroir dérivé.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallStatus {
    AwaitingConfig,
    Installing,
    Ok,
}

impl std::fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallStatus::AwaitingConfig => write!(f, "AWAITING_CONFIG"),
            InstallStatus::Installing => write!(f, "INSTALLING"),
            InstallStatus::Ok => write!(f, "OK"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OsType {
    Linux,
    Windows,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallTemplate {
    pub id: String,
    pub name: String,
    pub os_type: OsType,
    /// URL de l'image disque de base (qcow2)
    pub image_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKey {
    pub id: String,
    pub user_id: u32,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAddress {
    pub address: String,
    /// Masque en notation pointée, ex. "255.255.255.0"
    pub subnet: String,
    pub gateway: String,
    pub mac_address: Option<String>,
}

/// Enregistrement VM côté store (facturation + cycle de vie).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    pub user_id: u32,
    pub user_full_name: String,
    pub cpu_cores: u32,
    pub ram_bytes: u64,
    pub disk_bytes: u64,
    pub network_bandwidth_bytes: u64,
    pub install_status: InstallStatus,
    pub vm_username: Option<String>,
    pub vm_password: Option<String>,
    pub primary_ipv4: Option<String>,
    pub primary_ipv6: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_accessed_at: Option<OffsetDateTime>,
    pub assigned_ips: Vec<IpAddress>,
}

impl VmRecord {
    /// Nom de la VM côté hyperviseur : `<proprietaire>-<userid>-<vmid>`.
    /// L'id du record ne doit donc pas contenir de tiret.
    pub fn hypervisor_name(&self) -> String {
        let sanitized: String = self
            .user_full_name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        format!("{}-{}-{}", sanitized, self.user_id, self.id)
    }

    /// Bloc de description injecté dans la config hyperviseur de la VM
    pub fn description(&self) -> String {
        const PREFIX: &str = "NIMBUS_";
        format!(
            "---\n* {p}VMID={}\n* {p}VM_NAME={}\n* {p}VM_DISK={}\n* {p}VM_IPV4={}\n* {p}VM_IPV6={}\n* {p}VM_RAM={}\n* {p}VM_CPU={}\n---",
            self.id,
            self.name,
            self.disk_bytes,
            self.primary_ipv4.as_deref().unwrap_or("NULL"),
            self.primary_ipv6.as_deref().unwrap_or("NULL"),
            self.ram_bytes,
            self.cpu_cores,
            p = PREFIX,
        )
    }

    pub fn expired_at(&self, now: OffsetDateTime) -> bool {
        match self.expires_at {
            Some(at) => at < now,
            None => true,
        }
    }
}

/// Retrouve l'id VM encodé dans un nom hyperviseur.
/// Les noms malformés (pas exactement trois segments) sont ignorés.
pub fn parse_hypervisor_name(name: &str) -> Option<&str> {
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() != 3 {
        return None;
    }
    Some(parts[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hypervisor_name_roundtrip() {
        let rec = VmRecord {
            id: "vm7".into(),
            name: "web".into(),
            user_id: 12,
            user_full_name: "Jane O'Doe".into(),
            cpu_cores: 2,
            ram_bytes: 0,
            disk_bytes: 0,
            network_bandwidth_bytes: 0,
            install_status: InstallStatus::AwaitingConfig,
            vm_username: None,
            vm_password: None,
            primary_ipv4: None,
            primary_ipv6: None,
            expires_at: None,
            last_accessed_at: None,
            assigned_ips: vec![],
        };
        assert_eq!(rec.hypervisor_name(), "JaneODoe-12-vm7");
        assert_eq!(parse_hypervisor_name(&rec.hypervisor_name()), Some("vm7"));
    }

    #[test]
    fn test_parse_malformed_names() {
        assert_eq!(parse_hypervisor_name("vm-100"), None);
        assert_eq!(parse_hypervisor_name("template"), None);
        assert_eq!(parse_hypervisor_name("a-b-c-d"), None);
    }

    #[test]
    fn test_vm_state_key() {
        assert_eq!(vm_state_key("abc"), "vm:abc:state");
    }
}
