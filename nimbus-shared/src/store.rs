/**
 * STORE DES VMS - Collaborateur facturation/enregistrements
 *
 * RÔLE : Accès aux enregistrements VM payés (roster), aux clés SSH et aux
 * templates d'installation ; écriture du statut d'installation et des
 * identifiants OS. C'est lui qui fait foi sur le cycle de vie.
 *
 * `JsonFileStore` persiste le tout dans un document JSON (rechargé au boot,
 * sauvé à chaque mutation) ; construit sans chemin, il reste en mémoire
 * pour les tests.
 */

use crate::models::{InstallStatus, InstallTemplate, SshKey, VmRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("vm not found: {0}")]
    VmNotFound(String),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store data error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait VmStore: Send + Sync {
    /// Roster : les VMs dont le service payé n'est pas expiré
    async fn active_vms(&self) -> Result<Vec<VmRecord>, StoreError>;
    async fn vm(&self, id: &str) -> Result<Option<VmRecord>, StoreError>;
    async fn set_install_status(&self, id: &str, status: InstallStatus) -> Result<(), StoreError>;
    async fn set_credentials(&self, id: &str, username: &str, password: &str) -> Result<(), StoreError>;
    /// Clés SSH de l'utilisateur parmi `ids` ; le contrat d'exactitude
    /// (toutes retrouvées ou erreur) est vérifié par l'appelant.
    async fn ssh_keys(&self, user_id: u32, ids: &[String]) -> Result<Vec<SshKey>, StoreError>;
    async fn template(&self, id: &str) -> Result<Option<InstallTemplate>, StoreError>;
    async fn templates(&self) -> Result<Vec<InstallTemplate>, StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    vms: Vec<VmRecord>,
    ssh_keys: Vec<SshKey>,
    templates: Vec<InstallTemplate>,
}

pub struct JsonFileStore {
    data: Arc<RwLock<StoreData>>,
    data_file: Option<PathBuf>,
}

impl JsonFileStore {
    /// Charge le store depuis un fichier JSON (créé vide s'il n'existe pas)
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            StoreData::default()
        };
        Ok(Self {
            data: Arc::new(RwLock::new(data)),
            data_file: Some(path),
        })
    }

    /// Store volatile, sans persistance (tests)
    pub fn in_memory() -> Self {
        Self {
            data: Arc::new(RwLock::new(StoreData::default())),
            data_file: None,
        }
    }

    async fn save(&self) -> Result<(), StoreError> {
        if let Some(path) = &self.data_file {
            let data = self.data.read().await;
            let content = serde_json::to_string_pretty(&*data)?;
            tokio::fs::write(path, content).await?;
        }
        Ok(())
    }

    pub async fn insert_vm(&self, record: VmRecord) -> Result<(), StoreError> {
        self.data.write().await.vms.push(record);
        self.save().await
    }

    pub async fn insert_ssh_key(&self, key: SshKey) -> Result<(), StoreError> {
        self.data.write().await.ssh_keys.push(key);
        self.save().await
    }

    pub async fn insert_template(&self, template: InstallTemplate) -> Result<(), StoreError> {
        self.data.write().await.templates.push(template);
        self.save().await
    }
}

#[async_trait]
impl VmStore for JsonFileStore {
    async fn active_vms(&self) -> Result<Vec<VmRecord>, StoreError> {
        let now = OffsetDateTime::now_utc();
        let data = self.data.read().await;
        Ok(data
            .vms
            .iter()
            .filter(|vm| !vm.expired_at(now))
            .cloned()
            .collect())
    }

    async fn vm(&self, id: &str) -> Result<Option<VmRecord>, StoreError> {
        let data = self.data.read().await;
        Ok(data.vms.iter().find(|vm| vm.id == id).cloned())
    }

    async fn set_install_status(&self, id: &str, status: InstallStatus) -> Result<(), StoreError> {
        {
            let mut data = self.data.write().await;
            let vm = data
                .vms
                .iter_mut()
                .find(|vm| vm.id == id)
                .ok_or_else(|| StoreError::VmNotFound(id.to_string()))?;
            vm.install_status = status;
        }
        self.save().await
    }

    async fn set_credentials(&self, id: &str, username: &str, password: &str) -> Result<(), StoreError> {
        {
            let mut data = self.data.write().await;
            let vm = data
                .vms
                .iter_mut()
                .find(|vm| vm.id == id)
                .ok_or_else(|| StoreError::VmNotFound(id.to_string()))?;
            vm.vm_username = Some(username.to_string());
            vm.vm_password = Some(password.to_string());
        }
        self.save().await
    }

    async fn ssh_keys(&self, user_id: u32, ids: &[String]) -> Result<Vec<SshKey>, StoreError> {
        let data = self.data.read().await;
        Ok(data
            .ssh_keys
            .iter()
            .filter(|k| k.user_id == user_id && ids.contains(&k.id))
            .cloned()
            .collect())
    }

    async fn template(&self, id: &str) -> Result<Option<InstallTemplate>, StoreError> {
        let data = self.data.read().await;
        Ok(data.templates.iter().find(|t| t.id == id).cloned())
    }

    async fn templates(&self) -> Result<Vec<InstallTemplate>, StoreError> {
        let data = self.data.read().await;
        Ok(data.templates.clone())
    }
}
