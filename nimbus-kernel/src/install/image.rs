use super::PipelineError;
use crate::bridge::EventBridge;
use crate::livelog::LiveLogger;
use nimbus_shared::hypervisor::{HypervisorApi, StorageContent};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Clé de contenu stable dérivée de l'URL : deux templates pointant sur la
/// même image partagent le même fichier en cache noeud
pub fn image_name(url: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    format!("{digest}.img")
}

/// Garantit la présence de l'image de base sur le stockage du noeud.
/// Télécharge via une tâche hyperviseur si absente, puis re-liste : un
/// téléchargement silencieusement échoué est une erreur dure.
pub async fn ensure_image(
    hypervisor: &dyn HypervisorApi,
    bridge: &EventBridge,
    logger: &LiveLogger,
    node: &str,
    storage: &str,
    url: &str,
    download_timeout: Duration,
) -> Result<StorageContent, PipelineError> {
    let name = image_name(url);

    logger.log("Checking node image cache...");
    let contents = hypervisor.storage_content(node, storage).await?;
    if let Some(existing) = contents.into_iter().find(|c| c.file_name() == name) {
        logger.log("Image already cached, skipping download");
        return Ok(existing);
    }

    logger.log("Image missing, downloading to node storage...");
    let watch = bridge.watch();
    let task_id = hypervisor.storage_download_url(node, storage, url, &name).await?;

    logger.log("Waiting for image download to complete...");
    watch.task_done(&task_id, download_timeout).await?;

    logger.log("Download complete");
    let contents = hypervisor.storage_content(node, storage).await?;
    contents
        .into_iter()
        .find(|c| c.file_name() == name)
        .ok_or_else(|| {
            PipelineError::Failed(format!(
                "image download finished but {name} is missing from {node}:{storage}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_name_is_stable_and_url_derived() {
        let a = image_name("https://images.example/debian-12.qcow2");
        let b = image_name("https://images.example/debian-12.qcow2");
        let c = image_name("https://images.example/ubuntu-24.qcow2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.ends_with(".img"));
        assert_eq!(a.len(), 64 + 4);
    }
}
