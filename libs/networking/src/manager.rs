//! Backend trait and the mode-keyed registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::identity::PodNetwork;

/// A network plugin family.
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Mode name this backend serves.
    fn mode(&self) -> &str;

    /// One-time setup (validate configuration, discover plugins).
    async fn init(&self) -> Result<(), NetworkError>;

    /// Attach the pod's network identity. On success the pod's IP is set.
    async fn set_up_pod(&self, pod: &dyn PodNetwork) -> Result<(), NetworkError>;

    /// Release whatever `set_up_pod` created. Must tolerate partial setups.
    async fn tear_down_pod(&self, pod: &dyn PodNetwork) -> Result<(), NetworkError>;
}

/// Routes pods to the backend registered for their mode.
#[derive(Clone, Default)]
pub struct NetworkManager {
    backends: BTreeMap<String, Arc<dyn NetworkBackend>>,
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("modes", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NetworkManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend; a later registration for the same mode wins.
    pub fn register(&mut self, backend: Arc<dyn NetworkBackend>) {
        let mode = backend.mode().to_string();
        if self.backends.insert(mode.clone(), backend).is_some() {
            warn!(mode = %mode, "Replacing network backend");
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn NetworkBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn modes(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    /// Initializes every registered backend.
    pub async fn init(&self) -> Result<(), NetworkError> {
        for (mode, backend) in &self.backends {
            backend.init().await?;
            debug!(mode = %mode, "Network backend initialized");
        }
        Ok(())
    }

    fn backend_for(&self, pod: &dyn PodNetwork) -> Result<&Arc<dyn NetworkBackend>, NetworkError> {
        let mode = pod.mode();
        self.backends
            .get(&mode)
            .ok_or(NetworkError::UnknownMode(mode))
    }

    pub async fn set_up_pod(&self, pod: &dyn PodNetwork) -> Result<(), NetworkError> {
        let backend = self.backend_for(pod)?;
        backend.set_up_pod(pod).await?;
        info!(
            pod_id = %pod.pod_id(),
            mode = %backend.mode(),
            ip = ?pod.ip_addr(),
            "Pod network set up"
        );
        Ok(())
    }

    pub async fn tear_down_pod(&self, pod: &dyn PodNetwork) -> Result<(), NetworkError> {
        let backend = self.backend_for(pod)?;
        backend.tear_down_pod(pod).await?;
        pod.set_ip_addr(None);
        info!(pod_id = %pod.pod_id(), mode = %backend.mode(), "Pod network torn down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NetworkIdentity;
    use crate::mock::MockNetworkBackend;

    #[tokio::test]
    async fn test_routes_by_mode() {
        let cni = Arc::new(MockNetworkBackend::new("cni"));
        let cnm = Arc::new(MockNetworkBackend::new("cnm"));
        let manager = NetworkManager::new()
            .with_backend(cni.clone())
            .with_backend(cnm.clone());
        manager.init().await.unwrap();

        let pod = NetworkIdentity::new("pod_a", "cnm", "bridge");
        pod.attach("ctr-1", Some(10), None);
        manager.set_up_pod(&pod).await.unwrap();

        assert_eq!(cnm.set_up_calls(), vec!["pod_a".to_string()]);
        assert!(cni.set_up_calls().is_empty());
        assert!(pod.ip_addr().is_some());

        manager.tear_down_pod(&pod).await.unwrap();
        assert_eq!(cnm.tear_down_calls(), vec!["pod_a".to_string()]);
        assert_eq!(pod.ip_addr(), None);
    }

    #[tokio::test]
    async fn test_unknown_mode() {
        let manager = NetworkManager::new();
        let pod = NetworkIdentity::new("pod_b", "weave", "x");
        let err = manager.set_up_pod(&pod).await.unwrap_err();
        assert!(matches!(err, NetworkError::UnknownMode(mode) if mode == "weave"));
    }
}
