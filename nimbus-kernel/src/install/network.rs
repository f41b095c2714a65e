use super::PipelineError;
use nimbus_shared::hypervisor::{FirewallOptions, FirewallRule, HypervisorApi, VmRef};
use nimbus_shared::models::IpAddress;
use std::collections::HashMap;

/// Nom de l'ipset portant la liste blanche d'adresses de la VM
pub const ALLOWED_IPSET: &str = "allowed-ip-addresses";

/// Longueur de préfixe CIDR d'un masque en notation pointée
pub fn subnet_prefix_len(mask: &str) -> u32 {
    mask.split('.')
        .filter_map(|octet| octet.parse::<u8>().ok())
        .map(|octet| octet.count_ones())
        .sum()
}

pub fn ip_with_cidr(ip: &IpAddress) -> String {
    format!("{}/{}", ip.address, subnet_prefix_len(&ip.subnet))
}

/// Remplace le câblage réseau de la VM : purge des NICs existantes, puis
/// une NIC virtio par adresse assignée + ipconfig cloud-init associée.
/// IPv4 seulement : une IPv6 assignée est acceptée mais pas câblée ici.
pub async fn configure_network(
    hypervisor: &dyn HypervisorApi,
    vm: &VmRef,
    ips: &[IpAddress],
    net_bridge: &str,
) -> Result<(), PipelineError> {
    let config = hypervisor.vm_config(vm).await?;
    let nic_keys: Vec<String> = config
        .keys()
        .filter(|key| key.starts_with("net"))
        .cloned()
        .collect();
    if !nic_keys.is_empty() {
        hypervisor.delete_vm_config_keys(vm, &nic_keys).await?;
    }

    let mut values = HashMap::new();
    for (index, ip) in ips.iter().enumerate() {
        values.insert(
            format!("net{index}"),
            format!("virtio,bridge={net_bridge},firewall=1"),
        );
        values.insert(
            format!("ipconfig{index}"),
            format!("ip={},gw={}", ip_with_cidr(ip), ip.gateway),
        );
    }
    hypervisor.set_vm_config(vm, &values).await?;
    Ok(())
}

/// Verrouille la VM sur ses adresses assignées : ipset de la liste
/// blanche, politique DROP des deux côtés, puis exactement deux règles
/// ACCEPT (entrant vers l'ipset, sortant depuis l'ipset). Le spoofing
/// d'adresses non assignées est bloqué au bord de l'hyperviseur.
pub async fn configure_firewall(
    hypervisor: &dyn HypervisorApi,
    vm: &VmRef,
    ips: &[IpAddress],
) -> Result<(), PipelineError> {
    hypervisor.firewall_create_ipset(vm, ALLOWED_IPSET).await?;
    for ip in ips {
        hypervisor
            .firewall_add_to_ipset(vm, ALLOWED_IPSET, &ip.address)
            .await?;
    }

    hypervisor
        .firewall_set_options(
            vm,
            &FirewallOptions {
                enable: true,
                policy_in: "DROP".into(),
                policy_out: "DROP".into(),
            },
        )
        .await?;

    hypervisor
        .firewall_add_rule(
            vm,
            &FirewallRule {
                action: "ACCEPT".into(),
                direction: "in".into(),
                source: String::new(),
                dest: format!("+{ALLOWED_IPSET}"),
                enable: true,
            },
        )
        .await?;
    hypervisor
        .firewall_add_rule(
            vm,
            &FirewallRule {
                action: "ACCEPT".into(),
                direction: "out".into(),
                source: format!("+{ALLOWED_IPSET}"),
                dest: String::new(),
                enable: true,
            },
        )
        .await?;
    Ok(())
}
