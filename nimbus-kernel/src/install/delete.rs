use super::{Pipeline, PipelineError};
use crate::bridge;
use crate::livelog::LiveLogger;
use nimbus_shared::hypervisor::{PowerAction, VmRef};
use nimbus_shared::models::{InstallStatus, PowerState};

impl Pipeline {
    /// Séquence de suppression : extinction si besoin, delete hyperviseur,
    /// convergence du cache vers l'absence, retour du statut à
    /// AWAITING_CONFIG. L'annulation de l'abonnement de facturation est du
    /// ressort de l'appelant, avant d'invoquer cette séquence.
    pub(super) async fn run_delete(
        &self,
        vm_id: &str,
        logger: &LiveLogger,
    ) -> Result<(), PipelineError> {
        let vm = self
            .store
            .vm(vm_id)
            .await?
            .ok_or_else(|| PipelineError::Precondition(format!("unknown vm {vm_id}")))?;

        if vm.install_status != InstallStatus::Ok {
            return Err(PipelineError::Precondition(format!(
                "vm install status is {}, expected OK",
                vm.install_status
            )));
        }

        logger.log("Reading VM state...");
        let state = bridge::get_vm_state(self.cache.as_ref(), vm_id, 0, self.cfg.state_retry_delay)
            .await?
            .ok_or_else(|| {
                PipelineError::Precondition(format!("vm {vm_id} does not exist at the hypervisor"))
            })?;
        let vm_ref = VmRef { node: state.node.clone(), vmid: state.vmid };

        if state.status == PowerState::Running {
            logger.log("Stopping VM...");
            self.power_action_wait(&vm_ref, vm_id, PowerAction::Stop).await?;
        }

        logger.log("Deleting VM...");
        let watch = self.bridge.watch();
        let task_id = self.hypervisor.delete_vm(&vm_ref).await?;
        watch.task_done(&task_id, self.cfg.task_timeout).await?;

        logger.log("Waiting for VM state to clear...");
        let removed = bridge::wait_for_state_removed(
            self.cache.as_ref(),
            vm_id,
            self.cfg.state_removed_max_retries,
            self.cfg.state_retry_delay,
        )
        .await?;
        if !removed {
            return Err(PipelineError::Failed(format!(
                "vm {vm_id} state is still present in the cache after deletion"
            )));
        }

        self.store
            .set_install_status(vm_id, InstallStatus::AwaitingConfig)
            .await?;
        logger.success("VM deleted successfully");
        Ok(())
    }
}
