/**
 * EVENT BRIDGE - Événements typés + primitives d'attente bornée
 *
 * RÔLE :
 * Le poller publie les changements d'état sur le pub/sub du cache partagé ;
 * ce module les re-expose en événements typés locaux au processus et
 * fournit les attentes bornées consommées par le pipeline.
 *
 * FONCTIONNEMENT :
 * - un seul abonnement pattern par processus, démultiplexé par canal
 * - la livraison est au-plus-une-fois, sans replay : tout enchaînement
 *   "déclencher une action puis attendre sa complétion" doit créer son
 *   `watch()` AVANT de déclencher, sinon une complétion rapide est perdue
 * - l'attente de l'agent invité est la seule en polling : aucun événement
 *   push n'existe pour la vivacité de l'agent
 */

use nimbus_shared::cache::{CacheError, ChannelMessage, StateCache};
use nimbus_shared::hypervisor::{HypervisorApi, VmRef};
use nimbus_shared::models::{
    task_status_is_terminal, vm_state_key, TaskChange, VMPowerStateChange, VMState,
    CHANNEL_PATTERN, CHANNEL_POWER_CHANGE, CHANNEL_TASK_CHANGE, TASK_STATUS_FAILED,
    TASK_STATUS_OK,
};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },
    #[error("event bridge closed")]
    Closed,
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Événements hyperviseur typés, locaux au processus
#[derive(Debug, Clone)]
pub enum HyperEvent {
    PowerChange(VMPowerStateChange),
    TaskOk(TaskChange),
    TaskFailed(TaskChange),
    TaskDone(TaskChange),
}

#[derive(Clone)]
pub struct EventBridge {
    tx: broadcast::Sender<HyperEvent>,
}

impl EventBridge {
    /// S'abonne au pattern hyperviseur et démarre la pompe de démultiplexage
    pub async fn connect(cache: &dyn StateCache) -> Result<Self, BridgeError> {
        let mut rx = cache.subscribe_pattern(CHANNEL_PATTERN).await?;
        let (tx, _) = broadcast::channel(256);

        let fanout = tx.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => Self::demux(&fanout, &msg),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        eprintln!("[bridge] lagged, dropped {n} pub/sub messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        eprintln!("[bridge] pub/sub stream closed");
                        break;
                    }
                }
            }
        });

        Ok(Self { tx })
    }

    fn demux(tx: &broadcast::Sender<HyperEvent>, msg: &ChannelMessage) {
        match msg.channel.as_str() {
            CHANNEL_POWER_CHANGE => match serde_json::from_str::<VMPowerStateChange>(&msg.payload) {
                Ok(change) => {
                    let _ = tx.send(HyperEvent::PowerChange(change));
                }
                Err(_) => eprintln!("[bridge] invalid power-change payload: {}", msg.payload),
            },
            CHANNEL_TASK_CHANGE => match serde_json::from_str::<TaskChange>(&msg.payload) {
                Ok(change) => {
                    if change.new_status == TASK_STATUS_OK {
                        let _ = tx.send(HyperEvent::TaskOk(change.clone()));
                    }
                    if change.new_status == TASK_STATUS_FAILED {
                        let _ = tx.send(HyperEvent::TaskFailed(change.clone()));
                    }
                    if task_status_is_terminal(&change.new_status) {
                        let _ = tx.send(HyperEvent::TaskDone(change));
                    }
                }
                Err(_) => eprintln!("[bridge] invalid task-change payload: {}", msg.payload),
            },
            _ => {}
        }
    }

    /// Prise d'écoute : le flux bufferise dès la création du watch, à créer
    /// avant l'appel hyperviseur qu'il doit observer
    pub fn watch(&self) -> EventWatch {
        EventWatch { rx: self.tx.subscribe() }
    }

    pub async fn wait_for_task_done(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<TaskChange, BridgeError> {
        self.watch().task_done(task_id, timeout).await
    }

    pub async fn wait_for_power_change(
        &self,
        vm_id: &str,
        timeout: Duration,
    ) -> Result<VMPowerStateChange, BridgeError> {
        self.watch().power_change(vm_id, timeout).await
    }
}

/// Attente filtrée sur le flux d'événements ; consommée par l'attente
pub struct EventWatch {
    rx: broadcast::Receiver<HyperEvent>,
}

impl EventWatch {
    pub async fn task_done(mut self, task_id: &str, timeout: Duration) -> Result<TaskChange, BridgeError> {
        let wait = async {
            loop {
                match self.rx.recv().await {
                    Ok(HyperEvent::TaskDone(task)) if task.task_id == task_id => return Ok(task),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(BridgeError::Closed),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| BridgeError::Timeout { what: format!("task {task_id}"), timeout })?
    }

    pub async fn power_change(
        mut self,
        vm_id: &str,
        timeout: Duration,
    ) -> Result<VMPowerStateChange, BridgeError> {
        let wait = async {
            loop {
                match self.rx.recv().await {
                    Ok(HyperEvent::PowerChange(change)) if change.vm_id == vm_id => {
                        return Ok(change)
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(BridgeError::Closed),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| BridgeError::Timeout { what: format!("power change of vm {vm_id}"), timeout })?
    }
}

/// Lit l'état d'une VM dans le cache, avec retry borné sur absence.
/// Sert autant à "la VM existe-t-elle déjà ?" (le poller a besoin d'un tick
/// pour la voir) qu'à confirmer une absence.
pub async fn get_vm_state(
    cache: &dyn StateCache,
    vm_id: &str,
    max_retries: u32,
    retry_delay: Duration,
) -> Result<Option<VMState>, CacheError> {
    let key = vm_state_key(vm_id);
    let mut attempt = 0;
    loop {
        if let Some(raw) = cache.get(&key).await? {
            let state: VMState = serde_json::from_str(&raw)?;
            return Ok(Some(state));
        }
        if attempt >= max_retries {
            return Ok(None);
        }
        attempt += 1;
        tokio::time::sleep(retry_delay).await;
    }
}

/// Symétrique de `get_vm_state` : retry borné jusqu'à confirmation d'absence.
/// `true` si l'entrée a disparu dans la fenêtre.
pub async fn wait_for_state_removed(
    cache: &dyn StateCache,
    vm_id: &str,
    max_retries: u32,
    retry_delay: Duration,
) -> Result<bool, CacheError> {
    let key = vm_state_key(vm_id);
    let mut attempt = 0;
    loop {
        if cache.get(&key).await?.is_none() {
            return Ok(true);
        }
        if attempt >= max_retries {
            return Ok(false);
        }
        attempt += 1;
        tokio::time::sleep(retry_delay).await;
    }
}

/// Attente hybride : la vivacité de l'agent invité n'a pas d'événement
/// push, on sonde à intervalle court jusqu'au timeout
pub async fn wait_for_agent_online(
    hypervisor: &dyn HypervisorApi,
    vm: &VmRef,
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if hypervisor.agent_ping(vm).await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}
