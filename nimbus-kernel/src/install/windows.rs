use super::network::subnet_prefix_len;
use super::PipelineError;
use nimbus_shared::hypervisor::{HypervisorApi, VmRef};
use nimbus_shared::models::IpAddress;

/// Script poussé via le canal exec de l'agent : cloud-init ne sait pas
/// configurer le réseau Windows, on rebinde l'adaptateur principal sur
/// l'IP statique/passerelle/DNS à la main.
pub fn network_rebind_script(primary_ip: &IpAddress) -> String {
    format!(
        r#"
$defaultInterface = Get-NetAdapter | Where-Object {{ $_.InterfaceAlias -like "Ethernet*" }} | Select-Object -First 1

$ipv4Address = "{address}"
$subnetMaskBitLength = "{prefix}"
$defaultGateway = "{gateway}"

Get-NetIPAddress -InterfaceIndex $defaultInterface.ifIndex | Remove-NetIPAddress -Confirm:$false
Remove-NetRoute -InterfaceIndex $defaultInterface.ifIndex -DestinationPrefix "0.0.0.0/0" -Confirm:$false
New-NetIPAddress -InterfaceIndex $defaultInterface.ifIndex -IPAddress $ipv4Address -PrefixLength $subnetMaskBitLength -DefaultGateway $defaultGateway

$dnsServers = '1.1.1.1', '1.0.0.1'
$defaultInterface | Set-DnsClientServerAddress -ServerAddresses $dnsServers
"#,
        address = primary_ip.address,
        prefix = subnet_prefix_len(&primary_ip.subnet),
        gateway = primary_ip.gateway,
    )
}

/// Post-install Windows : rebind réseau puis mot de passe du compte via
/// l'agent (le hash cloud-init ne s'applique pas au compte Windows)
pub async fn post_install(
    hypervisor: &dyn HypervisorApi,
    vm: &VmRef,
    primary_ip: &IpAddress,
    username: &str,
    password: &str,
) -> Result<(), PipelineError> {
    let script = network_rebind_script(primary_ip);
    hypervisor.agent_exec(vm, "powershell.exe -NoExit", &script).await?;
    hypervisor.agent_set_password(vm, username, password).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_embeds_static_addressing() {
        let ip = IpAddress {
            address: "198.51.100.7".into(),
            subnet: "255.255.255.192".into(),
            gateway: "198.51.100.1".into(),
            mac_address: None,
        };
        let script = network_rebind_script(&ip);
        assert!(script.contains(r#"$ipv4Address = "198.51.100.7""#));
        assert!(script.contains(r#"$subnetMaskBitLength = "26""#));
        assert!(script.contains(r#"$defaultGateway = "198.51.100.1""#));
        assert!(script.contains("Set-DnsClientServerAddress"));
    }
}
