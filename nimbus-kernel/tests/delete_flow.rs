mod common;

use common::{harness, wait_state_present, wait_terminal};
use nimbus_devkit::fixtures;
use nimbus_kernel::bridge;
use nimbus_kernel::livelog::OperationStatus;
use nimbus_shared::models::InstallStatus;
use nimbus_shared::store::VmStore;
use std::time::Duration;

#[tokio::test]
async fn delete_converges_to_absent_state() {
    let h = harness().await;
    let mut record = fixtures::vm_record("vm1");
    record.install_status = InstallStatus::Ok;
    let name = record.hypervisor_name();
    h.store.insert_vm(record).await.unwrap();
    h.fake.add_vm(100, &name, "n1", "running");

    // le poller doit d'abord avoir matérialisé la VM dans le cache
    wait_state_present(&h.cache, "vm1").await;

    let operation_id = h.pipeline.start_delete("vm1");
    let log = wait_terminal(&h.logs, &operation_id).await;

    assert_eq!(log.status, OperationStatus::Success, "log: {:#?}", log.messages);

    // VM allumée : extinction avant suppression
    assert_eq!(h.fake.journal(), vec!["power_action:stop", "delete_vm"]);

    // convergence : l'entrée cache finit par disparaître (TTL sans refresh)
    let state = bridge::get_vm_state(&h.cache, "vm1", 0, Duration::ZERO).await.unwrap();
    assert!(state.is_none(), "state entry should have expired after delete");

    let vm = h.store.vm("vm1").await.unwrap().unwrap();
    assert_eq!(vm.install_status, InstallStatus::AwaitingConfig);
}

#[tokio::test]
async fn delete_of_stopped_vm_skips_power_off() {
    let h = harness().await;
    let mut record = fixtures::vm_record("vm2");
    record.install_status = InstallStatus::Ok;
    let name = record.hypervisor_name();
    h.store.insert_vm(record).await.unwrap();
    h.fake.add_vm(101, &name, "n1", "stopped");

    wait_state_present(&h.cache, "vm2").await;

    let operation_id = h.pipeline.start_delete("vm2");
    let log = wait_terminal(&h.logs, &operation_id).await;

    assert_eq!(log.status, OperationStatus::Success, "log: {:#?}", log.messages);
    assert_eq!(h.fake.journal(), vec!["delete_vm"]);
}

#[tokio::test]
async fn delete_requires_ok_status() {
    let h = harness().await;
    h.store.insert_vm(fixtures::vm_record("vm3")).await.unwrap();

    let operation_id = h.pipeline.start_delete("vm3");
    let log = wait_terminal(&h.logs, &operation_id).await;

    assert_eq!(log.status, OperationStatus::Failed);
    let last = log.messages.last().unwrap();
    assert!(last.message.contains("expected OK"), "{}", last.message);
    assert!(h.fake.journal().is_empty());
}
