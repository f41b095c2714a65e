/**
 * PIPELINE D'INSTALLATION - Cycle de vie complet create/destroy d'une VM
 *
 * RÔLE :
 * Déroule la séquence ordonnée d'effets de bord contre l'hyperviseur :
 * image en cache noeud, cloud-init, création qemu, disque, réseau,
 * firewall, allumage, agent invité, post-install par OS.
 *
 * FONCTIONNEMENT :
 * - chaque invocation tourne détachée de la requête et journalise sa
 *   progression dans les live logs, étape par étape
 * - la première erreur interrompt la séquence, sans rollback compensatoire :
 *   le statut d'installation persisté est l'ancre de reprise opérateur
 * - un verrou par VM exclut deux pipelines simultanés sur le même id ;
 *   les préconditions de statut restent la garde entre processus
 */

pub mod cloudinit;
pub mod delete;
pub mod image;
pub mod network;
pub mod placement;
pub mod windows;

use crate::bridge::{self, BridgeError, EventBridge};
use crate::livelog::{LiveLogger, LiveLogs};
use crate::locks::VmLocks;
use crate::snippets::{SnippetError, SnippetStore};
use cloudinit::CloudInitOpts;
use nimbus_shared::cache::{CacheError, StateCache};
use nimbus_shared::hypervisor::{
    CreateVmParams, HyperError, HypervisorApi, PowerAction, VmRef,
};
use nimbus_shared::models::{InstallStatus, OsType};
use nimbus_shared::store::{StoreError, VmStore};
use placement::{NodeSelector, PlacementRequest};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Précondition violée : rien n'a été tenté côté hyperviseur
    #[error("{0}")]
    Precondition(String),
    #[error("hypervisor call failed: {0}")]
    Hypervisor(#[from] HyperError),
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
    #[error("state cache error: {0}")]
    Cache(#[from] CacheError),
    /// Attente bornée dépassée ou bridge indisponible
    #[error("{0}")]
    Wait(#[from] BridgeError),
    #[error("cloud-init upload failed: {0}")]
    Snippet(#[from] SnippetError),
    #[error("{0}")]
    Failed(String),
}

/// Options d'installation fournies par l'appelant
#[derive(Debug, Clone, serde::Deserialize)]
pub struct InstallOptions {
    pub template_id: String,
    pub username: String,
    pub password: String,
    pub ssh_key_ids: Option<Vec<String>>,
    pub allow_password_authentication: Option<bool>,
    pub passwordless_sudo: Option<bool>,
}

/// Réglages du pipeline (stockages, bridge, bornes d'attente)
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub storage: String,
    pub snippet_storage: String,
    pub net_bridge: String,
    pub task_timeout: Duration,
    pub image_download_timeout: Duration,
    pub power_change_timeout: Duration,
    pub agent_timeout: Duration,
    pub agent_poll: Duration,
    pub state_retry_delay: Duration,
    pub state_max_retries: u32,
    pub state_removed_max_retries: u32,
}

#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn VmStore>,
    pub cache: Arc<dyn StateCache>,
    pub hypervisor: Arc<dyn HypervisorApi>,
    pub snippets: Arc<dyn SnippetStore>,
    pub bridge: EventBridge,
    pub selector: Arc<dyn NodeSelector>,
    pub locks: VmLocks,
    pub logs: LiveLogs,
    pub cfg: PipelineConfig,
}

impl Pipeline {
    /// Lance une installation détachée et retourne l'id d'opération
    pub fn start_install(&self, vm_id: &str, opts: InstallOptions) -> String {
        let pipeline = self.clone();
        let vm_id = vm_id.to_string();
        self.logs.spawn("install-vm", Some(vm_id.clone()), move |logger| async move {
            let lock = pipeline.locks.lock_for(&vm_id);
            let _guard = lock.lock().await;
            pipeline.run_install(&vm_id, opts, &logger).await
        })
    }

    /// Lance une suppression détachée et retourne l'id d'opération
    pub fn start_delete(&self, vm_id: &str) -> String {
        let pipeline = self.clone();
        let vm_id = vm_id.to_string();
        self.logs.spawn("delete-vm", Some(vm_id.clone()), move |logger| async move {
            let lock = pipeline.locks.lock_for(&vm_id);
            let _guard = lock.lock().await;
            pipeline.run_delete(&vm_id, &logger).await
        })
    }

    async fn run_install(
        &self,
        vm_id: &str,
        opts: InstallOptions,
        logger: &LiveLogger,
    ) -> Result<(), PipelineError> {
        let now = OffsetDateTime::now_utc();
        let vm = self
            .store
            .vm(vm_id)
            .await?
            .ok_or_else(|| PipelineError::Precondition(format!("unknown vm {vm_id}")))?;

        if vm.expired_at(now) {
            return Err(PipelineError::Precondition(format!(
                "paid service expired for vm {vm_id}"
            )));
        }
        if vm.install_status != InstallStatus::AwaitingConfig {
            return Err(PipelineError::Precondition(format!(
                "vm install status is {}, expected AWAITING_CONFIG",
                vm.install_status
            )));
        }

        logger.log("Fetching template...");
        let template = self
            .store
            .template(&opts.template_id)
            .await?
            .ok_or_else(|| {
                PipelineError::Precondition(format!("template {} not found", opts.template_id))
            })?;

        // garde anti double-install : la VM ne doit pas déjà être visible
        if bridge::get_vm_state(self.cache.as_ref(), vm_id, 0, self.cfg.state_retry_delay)
            .await?
            .is_some()
        {
            return Err(PipelineError::Precondition(format!(
                "vm {vm_id} already exists at the hypervisor"
            )));
        }

        logger.log("Fetching SSH keys...");
        let requested_keys = opts.ssh_key_ids.clone().unwrap_or_default();
        let ssh_keys = self.store.ssh_keys(vm.user_id, &requested_keys).await?;
        if ssh_keys.len() != requested_keys.len() {
            // une correspondance partielle est une erreur, pas une install partielle
            return Err(PipelineError::Precondition("ssh keys not found".into()));
        }

        logger.log("Updating VM status...");
        let is_windows = template.os_type == OsType::Windows;
        let username = if is_windows { "Administrator".to_string() } else { opts.username.clone() };
        self.store.set_credentials(vm_id, &username, &opts.password).await?;
        self.store.set_install_status(vm_id, InstallStatus::Installing).await?;

        logger.log("Selecting placement node...");
        let node = self
            .selector
            .select(&PlacementRequest {
                cpu_cores: vm.cpu_cores,
                ram_bytes: vm.ram_bytes,
                disk_bytes: vm.disk_bytes,
            })
            .await?;

        let base_image = image::ensure_image(
            self.hypervisor.as_ref(),
            &self.bridge,
            logger,
            &node,
            &self.cfg.storage,
            &template.image_url,
            self.cfg.image_download_timeout,
        )
        .await?;

        logger.log("Uploading cloud-init snippet...");
        let allow_pwauth = opts.allow_password_authentication.unwrap_or(true);
        let user_data = cloudinit::render_user_data(&CloudInitOpts {
            hostname: vm.id.clone(),
            username: opts.username.clone(),
            password_hash: cloudinit::shadow_hash(&opts.password),
            ssh_keys: ssh_keys.iter().map(|k| k.key.clone()).collect(),
            passwordless_sudo: opts.passwordless_sudo.unwrap_or(true),
            password_authentication: allow_pwauth,
            lock_password: !allow_pwauth,
            update_packages: true,
        });
        let snippet_id = Uuid::new_v4().to_string();
        self.snippets.put(&format!("{snippet_id}.yml"), &user_data).await?;

        logger.log("Allocating hypervisor VM id...");
        let vmid = next_free_vmid(self.hypervisor.as_ref()).await?;
        let vm_ref = VmRef { node: node.clone(), vmid };

        logger.log("Creating VM...");
        let params = CreateVmParams {
            name: vm.hypervisor_name(),
            description: vm.description(),
            ostype: if is_windows { "win10" } else { "l26" }.into(),
            bios: if is_windows { "ovmf" } else { "seabios" }.into(),
            bootdisk: "scsi0".into(),
            cores: vm.cpu_cores,
            sockets: 1,
            memory: vm.ram_bytes / 1024 / 1024,
            net0: format!("virtio,bridge={}", self.cfg.net_bridge),
            ide2: format!("{}:cloudinit,media=cdrom", self.cfg.storage),
            cicustom: format!("user={}:snippets/{snippet_id}.yml", self.cfg.snippet_storage),
            agent: "enabled=1,fstrim_cloned_disks=1".into(),
            scsihw: "virtio-scsi-single".into(),
            virtio0: format!(
                "{}:0,format=qcow2,iothread=on,import-from={}",
                self.cfg.storage, base_image.volid
            ),
            efidisk0: is_windows.then(|| {
                format!("{}:1,efitype=4m,pre-enrolled-keys=1,format=qcow2", self.cfg.storage)
            }),
            onboot: true,
            cpu: "host".into(),
        };
        // écoute posée avant le create : sa complétion ne peut être manquée
        let create_watch = self.bridge.watch();
        let task_id = self.hypervisor.create_vm(&vm_ref, &params).await?;
        create_watch.task_done(&task_id, self.cfg.task_timeout).await?;

        // la taille initiale vient de l'image ; l'extension est un appel séparé
        logger.log("Expanding disk...");
        let size_gb = vm.disk_bytes / 1024 / 1024 / 1024;
        self.hypervisor
            .resize_disk(&vm_ref, "virtio0", &format!("{size_gb}G"))
            .await?;

        logger.log("Waiting for the poller to observe the VM...");
        bridge::get_vm_state(
            self.cache.as_ref(),
            vm_id,
            self.cfg.state_max_retries,
            self.cfg.state_retry_delay,
        )
        .await?
        .ok_or_else(|| {
            PipelineError::Failed(format!("vm {vm_id} state did not appear in the cache"))
        })?;

        logger.log("Configuring network...");
        network::configure_network(
            self.hypervisor.as_ref(),
            &vm_ref,
            &vm.assigned_ips,
            &self.cfg.net_bridge,
        )
        .await?;

        logger.log("Configuring firewall...");
        network::configure_firewall(self.hypervisor.as_ref(), &vm_ref, &vm.assigned_ips).await?;

        logger.log("Starting VM...");
        self.power_action_wait(&vm_ref, vm_id, PowerAction::Start).await?;

        logger.log("Waiting for guest agent...");
        let agent_up = bridge::wait_for_agent_online(
            self.hypervisor.as_ref(),
            &vm_ref,
            self.cfg.agent_timeout,
            self.cfg.agent_poll,
        )
        .await;
        if !agent_up {
            return Err(PipelineError::Failed(format!(
                "guest agent did not come online within {:?}",
                self.cfg.agent_timeout
            )));
        }

        match template.os_type {
            OsType::Windows => {
                logger.log("Running Windows post-install...");
                let primary_ip = vm
                    .assigned_ips
                    .iter()
                    .find(|ip| Some(&ip.address) == vm.primary_ipv4.as_ref())
                    .ok_or_else(|| {
                        PipelineError::Failed("primary ipv4 address is not assigned".into())
                    })?;
                windows::post_install(
                    self.hypervisor.as_ref(),
                    &vm_ref,
                    primary_ip,
                    &username,
                    &opts.password,
                )
                .await?;
            }
            OsType::Linux => {
                logger.log("Setting account password via guest agent...");
                self.hypervisor
                    .agent_set_password(&vm_ref, &username, &opts.password)
                    .await?;
            }
        }

        logger.log("Updating VM status...");
        self.store.set_install_status(vm_id, InstallStatus::Ok).await?;
        logger.success("VM installed successfully");
        Ok(())
    }

    /// Déclenche une action d'alimentation et attend sa tâche ET la
    /// transition d'état observée par le poller. Les deux écoutes sont
    /// prises avant l'appel (pas de replay côté pub/sub).
    pub async fn power_action_wait(
        &self,
        vm: &VmRef,
        vm_id: &str,
        action: PowerAction,
    ) -> Result<(), PipelineError> {
        let task_watch = self.bridge.watch();
        let power_watch = self.bridge.watch();

        let task_id = self.hypervisor.power_action(vm, action).await?;

        let (task, power) = tokio::join!(
            task_watch.task_done(&task_id, self.cfg.task_timeout),
            power_watch.power_change(vm_id, self.cfg.power_change_timeout),
        );
        task?;
        power?;
        Ok(())
    }
}

/// Plus petit id qemu libre >= 100 sur le cluster
pub async fn next_free_vmid(hypervisor: &dyn HypervisorApi) -> Result<u32, PipelineError> {
    let existing: HashSet<u32> = hypervisor
        .cluster_resources()
        .await?
        .into_iter()
        .map(|resource| resource.vmid)
        .collect();

    let mut vmid = 100;
    while existing.contains(&vmid) {
        vmid += 1;
    }
    Ok(vmid)
}
