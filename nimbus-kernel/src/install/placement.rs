use super::PipelineError;
use async_trait::async_trait;

/// Besoin de ressources d'une VM à placer
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub cpu_cores: u32,
    pub ram_bytes: u64,
    pub disk_bytes: u64,
}

/// Politique de placement sur un noeud du cluster. L'implémentation par
/// défaut est statique ; le trait laisse la porte ouverte à une sélection
/// tenant compte de la charge.
#[async_trait]
pub trait NodeSelector: Send + Sync {
    async fn select(&self, request: &PlacementRequest) -> Result<String, PipelineError>;
}

pub struct StaticNodeSelector {
    pub node: String,
}

#[async_trait]
impl NodeSelector for StaticNodeSelector {
    async fn select(&self, _request: &PlacementRequest) -> Result<String, PipelineError> {
        Ok(self.node.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_selector_ignores_request() {
        let selector = StaticNodeSelector { node: "node2".into() };
        let node = selector
            .select(&PlacementRequest { cpu_cores: 64, ram_bytes: u64::MAX, disk_bytes: 0 })
            .await
            .unwrap();
        assert_eq!(node, "node2");
    }
}
