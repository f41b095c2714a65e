use nimbus_shared::models::{InstallStatus, InstallTemplate, IpAddress, OsType, SshKey, VmRecord};
use time::{Duration, OffsetDateTime};

/// Enregistrement VM prêt à installer, avec une IP assignée
pub fn vm_record(id: &str) -> VmRecord {
    VmRecord {
        id: id.into(),
        name: format!("test {id}"),
        user_id: 7,
        user_full_name: "Ada Lovelace".into(),
        cpu_cores: 2,
        ram_bytes: 2 * 1024 * 1024 * 1024,
        disk_bytes: 20 * 1024 * 1024 * 1024,
        network_bandwidth_bytes: 1024 * 1024 * 1024 * 1024,
        install_status: InstallStatus::AwaitingConfig,
        vm_username: None,
        vm_password: None,
        primary_ipv4: Some("203.0.113.10".into()),
        primary_ipv6: None,
        expires_at: Some(OffsetDateTime::now_utc() + Duration::days(30)),
        last_accessed_at: Some(OffsetDateTime::now_utc()),
        assigned_ips: vec![IpAddress {
            address: "203.0.113.10".into(),
            subnet: "255.255.255.0".into(),
            gateway: "203.0.113.1".into(),
            mac_address: None,
        }],
    }
}

pub fn linux_template() -> InstallTemplate {
    InstallTemplate {
        id: "tpl-linux".into(),
        name: "Debian 12".into(),
        os_type: OsType::Linux,
        image_url: "https://images.example/debian-12.qcow2".into(),
    }
}

pub fn windows_template() -> InstallTemplate {
    InstallTemplate {
        id: "tpl-win".into(),
        name: "Windows Server 2022".into(),
        os_type: OsType::Windows,
        image_url: "https://images.example/win2022.qcow2".into(),
    }
}

pub fn ssh_key(id: &str, user_id: u32) -> SshKey {
    SshKey {
        id: id.into(),
        user_id,
        key: format!("ssh-ed25519 AAAAC3Nza{id} test@example"),
    }
}
