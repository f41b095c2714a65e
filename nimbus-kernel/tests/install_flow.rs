mod common;

use common::{harness, wait_terminal};
use nimbus_devkit::fixtures;
use nimbus_kernel::install::InstallOptions;
use nimbus_kernel::livelog::OperationStatus;
use nimbus_shared::models::InstallStatus;
use nimbus_shared::store::VmStore;

fn opts(template_id: &str) -> InstallOptions {
    InstallOptions {
        template_id: template_id.into(),
        username: "ada".into(),
        password: "correct horse".into(),
        ssh_key_ids: Some(vec!["k1".into()]),
        allow_password_authentication: Some(true),
        passwordless_sudo: Some(true),
    }
}

#[tokio::test]
async fn install_runs_steps_in_order() {
    let h = harness().await;
    h.store.insert_vm(fixtures::vm_record("vm1")).await.unwrap();
    h.store.insert_template(fixtures::linux_template()).await.unwrap();
    h.store.insert_ssh_key(fixtures::ssh_key("k1", 7)).await.unwrap();

    let operation_id = h.pipeline.start_install("vm1", opts("tpl-linux"));
    let log = wait_terminal(&h.logs, &operation_id).await;

    assert_eq!(log.status, OperationStatus::Success, "log: {:#?}", log.messages);
    assert_eq!(log.vm_id.as_deref(), Some("vm1"));

    // ordre exact des effets de bord contre l'hyperviseur
    assert_eq!(
        h.fake.journal(),
        vec![
            "storage_download_url",
            "create_vm",
            "resize_disk",
            "delete_vm_config_keys",
            "set_vm_config",
            "firewall_create_ipset",
            "firewall_add_to_ipset",
            "firewall_set_options",
            "firewall_add_rule:in",
            "firewall_add_rule:out",
            "power_action:start",
            "agent_set_password",
        ]
    );

    let vm = h.store.vm("vm1").await.unwrap().unwrap();
    assert_eq!(vm.install_status, InstallStatus::Ok);
    assert_eq!(vm.vm_username.as_deref(), Some("ada"));

    // réseau : une NIC + ipconfig par adresse assignée
    let (vmid, _) = h.fake.find_vm("vm1").unwrap();
    let config = h.fake.vm_config_of(vmid);
    assert_eq!(config.get("net0").unwrap(), "virtio,bridge=vmbr0,firewall=1");
    assert_eq!(config.get("ipconfig0").unwrap(), "ip=203.0.113.10/24,gw=203.0.113.1");

    // firewall : la liste blanche contient l'adresse assignée
    assert_eq!(h.fake.ipset_entries("allowed-ip-addresses"), vec!["203.0.113.10"]);

    // cloud-init : un snippet posé, hash shadow, jamais le clair
    let names = h.snippets.names();
    assert_eq!(names.len(), 1);
    let snippet = h.snippets.get(&names[0]).unwrap();
    assert!(snippet.contains("hostname: vm1"));
    assert!(snippet.contains("passwd: $6$"));
    assert!(!snippet.contains("correct horse"));
    assert!(snippet.contains("ssh-ed25519"));
}

#[tokio::test]
async fn install_skips_download_when_image_cached() {
    let h = harness().await;
    h.store.insert_vm(fixtures::vm_record("vm2")).await.unwrap();
    let template = fixtures::linux_template();
    h.store.insert_template(template.clone()).await.unwrap();
    h.store.insert_ssh_key(fixtures::ssh_key("k1", 7)).await.unwrap();

    // l'image dérivée de l'URL du template est déjà en cache noeud
    let name = nimbus_kernel::install::image::image_name(&template.image_url);
    h.fake.seed_storage(&name);

    let operation_id = h.pipeline.start_install("vm2", opts("tpl-linux"));
    let log = wait_terminal(&h.logs, &operation_id).await;

    assert_eq!(log.status, OperationStatus::Success, "log: {:#?}", log.messages);
    assert_eq!(h.fake.journal().first().map(String::as_str), Some("create_vm"));
}

#[tokio::test]
async fn windows_install_runs_agent_post_install() {
    let h = harness().await;
    h.store.insert_vm(fixtures::vm_record("vm3")).await.unwrap();
    h.store.insert_template(fixtures::windows_template()).await.unwrap();

    let operation_id = h.pipeline.start_install(
        "vm3",
        InstallOptions {
            template_id: "tpl-win".into(),
            username: "ada".into(),
            password: "correct horse".into(),
            ssh_key_ids: None,
            allow_password_authentication: None,
            passwordless_sudo: None,
        },
    );
    let log = wait_terminal(&h.logs, &operation_id).await;
    assert_eq!(log.status, OperationStatus::Success, "log: {:#?}", log.messages);

    // le compte Windows est toujours Administrator
    let vm = h.store.vm("vm3").await.unwrap().unwrap();
    assert_eq!(vm.vm_username.as_deref(), Some("Administrator"));
    assert_eq!(
        h.fake.passwords_set(),
        vec![("Administrator".to_string(), "correct horse".to_string())]
    );

    // script de rebind réseau poussé via l'agent
    let scripts = h.fake.exec_inputs();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].contains("203.0.113.10"));
    assert!(scripts[0].contains("New-NetIPAddress"));
}

#[tokio::test]
async fn install_rejects_partial_ssh_key_match() {
    let h = harness().await;
    h.store.insert_vm(fixtures::vm_record("vm4")).await.unwrap();
    h.store.insert_template(fixtures::linux_template()).await.unwrap();
    h.store.insert_ssh_key(fixtures::ssh_key("k1", 7)).await.unwrap();

    let mut options = opts("tpl-linux");
    options.ssh_key_ids = Some(vec!["k1".into(), "k-missing".into()]);

    let operation_id = h.pipeline.start_install("vm4", options);
    let log = wait_terminal(&h.logs, &operation_id).await;

    assert_eq!(log.status, OperationStatus::Failed);
    // précondition violée : aucun effet de bord hyperviseur
    assert!(h.fake.journal().is_empty());
    let vm = h.store.vm("vm4").await.unwrap().unwrap();
    assert_eq!(vm.install_status, InstallStatus::AwaitingConfig);
}

#[tokio::test]
async fn install_rejects_wrong_status() {
    let h = harness().await;
    let mut record = fixtures::vm_record("vm5");
    record.install_status = InstallStatus::Ok;
    h.store.insert_vm(record).await.unwrap();
    h.store.insert_template(fixtures::linux_template()).await.unwrap();

    let operation_id = h.pipeline.start_install("vm5", opts("tpl-linux"));
    let log = wait_terminal(&h.logs, &operation_id).await;

    assert_eq!(log.status, OperationStatus::Failed);
    let last = log.messages.last().unwrap();
    assert!(last.message.contains("expected AWAITING_CONFIG"), "{}", last.message);
    assert!(h.fake.journal().is_empty());
}
