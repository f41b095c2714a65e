/**
 * LIVE LOGS - Journal de progression des opérations longues
 *
 * RÔLE :
 * Une installation/suppression tourne détachée de la requête HTTP qui l'a
 * lancée ; l'appelant ne garde qu'un id d'opération et vient relire le
 * journal en polling jusqu'à l'état terminal.
 *
 * FONCTIONNEMENT :
 * - `start` alloue un id aléatoire et enregistre un journal "working"
 * - chaque `log` ferme l'entrée précédente encore "working" en "ok" :
 *   seule la dernière entrée est jamais en cours
 * - `success`/`fail` posent l'état terminal, qui n'est jamais réécrit
 * - tout est en mémoire processus ; un sweep périodique évince les
 *   opérations terminées après la fenêtre de rétention
 */

use crate::state::{new_state, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Ok,
    Error,
    Warning,
    Working,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Working,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationLog {
    pub messages: Vec<LogEntry>,
    pub status: OperationStatus,
    pub vm_id: Option<String>,
    #[serde(skip)]
    closed_at: Option<OffsetDateTime>,
}

/// Registre des journaux d'opérations, partagé entre handlers et pipelines
#[derive(Clone)]
pub struct LiveLogs {
    inner: Shared<HashMap<String, OperationLog>>,
}

impl LiveLogs {
    pub fn new() -> Self {
        Self { inner: new_state(HashMap::new()) }
    }

    /// Enregistre une nouvelle opération et retourne son logger
    pub fn start(&self, kind: &str, vm_id: Option<String>) -> LiveLogger {
        let id = uuid::Uuid::new_v4().to_string();
        self.inner.lock().insert(
            id.clone(),
            OperationLog {
                messages: Vec::new(),
                status: OperationStatus::Working,
                vm_id,
                closed_at: None,
            },
        );
        println!("[livelog] {id}: started {kind}");
        LiveLogger { id, logs: self.clone() }
    }

    /// Lance le corps de l'opération détaché et retourne l'id immédiatement.
    /// Une erreur du corps ferme le journal en échec avec son message.
    pub fn spawn<F, Fut, E>(&self, kind: &str, vm_id: Option<String>, body: F) -> String
    where
        F: FnOnce(LiveLogger) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let logger = self.start(kind, vm_id);
        let id = logger.id().to_string();
        let handle = logger.clone();
        tokio::spawn(async move {
            if let Err(e) = body(logger).await {
                handle.fail(&format!("Error: {e}"));
            }
        });
        id
    }

    pub fn get(&self, operation_id: &str) -> Option<OperationLog> {
        self.inner.lock().get(operation_id).cloned()
    }

    /// Évince périodiquement les opérations terminées trop anciennes
    pub fn spawn_sweeper(&self, retention: std::time::Duration, sweep_every: std::time::Duration) {
        let logs = self.clone();
        let retention = time::Duration::try_from(retention).unwrap_or(time::Duration::hours(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_every);
            loop {
                interval.tick().await;
                let cutoff = OffsetDateTime::now_utc() - retention;
                let mut map = logs.inner.lock();
                let before = map.len();
                map.retain(|_, op| match op.closed_at {
                    Some(closed) => closed > cutoff,
                    None => true,
                });
                let evicted = before - map.len();
                if evicted > 0 {
                    println!("[livelog] evicted {evicted} finished operations");
                }
            }
        });
    }
}

impl Default for LiveLogs {
    fn default() -> Self {
        Self::new()
    }
}

/// Poignée d'écriture d'une opération donnée
#[derive(Clone)]
pub struct LiveLogger {
    id: String,
    logs: LiveLogs,
}

impl LiveLogger {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn append(&self, message: &str, status: EntryStatus, terminal: Option<OperationStatus>) {
        let mut map = self.logs.inner.lock();
        let Some(op) = map.get_mut(&self.id) else { return };

        if let Some(last) = op.messages.last_mut() {
            if last.status == EntryStatus::Working {
                last.status = EntryStatus::Ok;
            }
        }
        op.messages.push(LogEntry {
            message: message.to_string(),
            date: OffsetDateTime::now_utc(),
            status,
        });

        // l'état terminal n'est posé qu'une fois
        if let Some(final_status) = terminal {
            if op.status == OperationStatus::Working {
                op.status = final_status;
                op.closed_at = Some(OffsetDateTime::now_utc());
            }
        }
        println!("[livelog] {}: {message}", self.id);
    }

    pub fn log(&self, message: &str) {
        self.append(message, EntryStatus::Working, None);
    }

    pub fn success(&self, message: &str) {
        self.append(message, EntryStatus::Ok, Some(OperationStatus::Success));
    }

    pub fn fail(&self, message: &str) {
        self.append(message, EntryStatus::Error, Some(OperationStatus::Failed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_only_last_entry_in_progress() {
        let logs = LiveLogs::new();
        let logger = logs.start("test", None);

        logger.log("step 1");
        logger.log("step 2");
        logger.log("step 3");

        let op = logs.get(logger.id()).unwrap();
        assert_eq!(op.status, OperationStatus::Working);
        let statuses: Vec<EntryStatus> = op.messages.iter().map(|m| m.status).collect();
        assert_eq!(
            statuses,
            vec![EntryStatus::Ok, EntryStatus::Ok, EntryStatus::Working]
        );
    }

    #[tokio::test]
    async fn test_success_closes_every_entry() {
        let logs = LiveLogs::new();
        let logger = logs.start("test", Some("vm1".into()));

        for i in 0..3 {
            logger.log(&format!("step {i}"));
        }
        logger.success("done");

        let op = logs.get(logger.id()).unwrap();
        assert_eq!(op.status, OperationStatus::Success);
        assert_eq!(op.messages.len(), 4);
        assert!(op.messages.iter().all(|m| m.status == EntryStatus::Ok));
        assert_eq!(op.vm_id.as_deref(), Some("vm1"));
    }

    #[tokio::test]
    async fn test_terminal_status_is_not_overwritten() {
        let logs = LiveLogs::new();
        let logger = logs.start("test", None);

        logger.fail("boom");
        logger.success("too late");

        let op = logs.get(logger.id()).unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        // les appels tardifs continuent d'ajouter des entrées
        assert_eq!(op.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_closes_log() {
        let logs = LiveLogs::new();
        let id = logs.spawn("test", None, |logger| async move {
            logger.log("working...");
            Err::<(), String>("injected".into())
        });

        // le corps tourne détaché : on attend l'état terminal
        for _ in 0..50 {
            if logs.get(&id).unwrap().status != OperationStatus::Working {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let op = logs.get(&id).unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.messages.last().unwrap().message, "Error: injected");
    }

    #[tokio::test]
    async fn test_get_unknown_operation() {
        let logs = LiveLogs::new();
        assert!(logs.get("nope").is_none());
    }

    #[tokio::test]
    async fn test_sweeper_evicts_finished_but_keeps_working() {
        let logs = LiveLogs::new();
        let finished = logs.start("test", None);
        finished.success("done");
        let working = logs.start("test", None);
        working.log("still going");

        logs.spawn_sweeper(
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(20),
        );
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(logs.get(finished.id()).is_none());
        assert!(logs.get(working.id()).is_some());
    }
}
