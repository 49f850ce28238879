//! Runtime-native networking.
//!
//! The container runtime already attached the network container to its
//! network when it started it, so setup only adopts the address the runtime
//! reported. Teardown is a no-op: removing the container releases it.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::NetworkError;
use crate::identity::PodNetwork;
use crate::manager::NetworkBackend;
use crate::MODE_CNM;

#[derive(Debug, Default, Clone)]
pub struct CnmBackend;

impl CnmBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkBackend for CnmBackend {
    fn mode(&self) -> &str {
        MODE_CNM
    }

    async fn init(&self) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn set_up_pod(&self, pod: &dyn PodNetwork) -> Result<(), NetworkError> {
        let Some(container_id) = pod.container_id() else {
            return Err(NetworkError::MissingIdentity {
                pod: pod.pod_id(),
                what: "network container",
            });
        };

        match pod.runtime_ip() {
            Some(ip) => pod.set_ip_addr(Some(ip)),
            None => warn!(
                pod_id = %pod.pod_id(),
                container_id = %container_id,
                network = %pod.network_name(),
                "Runtime reported no address for network container"
            ),
        }
        Ok(())
    }

    async fn tear_down_pod(&self, pod: &dyn PodNetwork) -> Result<(), NetworkError> {
        debug!(pod_id = %pod.pod_id(), "Runtime-native network released with container");
        Ok(())
    }
}
