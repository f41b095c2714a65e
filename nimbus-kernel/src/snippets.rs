use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum SnippetError {
    #[error("snippet store io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dépôt des snippets cloud-init, en écriture seule : le pipeline y pose
/// chaque document sous un id frais, l'hyperviseur le lit par référence.
#[async_trait]
pub trait SnippetStore: Send + Sync {
    async fn put(&self, name: &str, content: &str) -> Result<(), SnippetError>;
}

/// Implémentation répertoire local (volume snippets monté sur le noeud)
pub struct DirSnippetStore {
    dir: PathBuf,
}

impl DirSnippetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SnippetStore for DirSnippetStore {
    async fn put(&self, name: &str, content: &str) -> Result<(), SnippetError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(name), content).await?;
        Ok(())
    }
}

/// Dépôt en mémoire, consultable par les tests
#[derive(Clone, Default)]
pub struct MemorySnippetStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemorySnippetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.entries.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl SnippetStore for MemorySnippetStore {
    async fn put(&self, name: &str, content: &str) -> Result<(), SnippetError> {
        self.entries
            .lock()
            .unwrap()
            .insert(name.to_string(), content.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dir_store_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirSnippetStore::new(dir.path().join("snippets"));
        store.put("abc.yml", "#cloud-config\n").await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("snippets/abc.yml")).unwrap();
        assert_eq!(content, "#cloud-config\n");
    }
}
