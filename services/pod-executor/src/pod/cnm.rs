//! Runtime-native pod.
//!
//! The first member is the network container: it is attached to the
//! configured runtime network and publishes every member's ports. The
//! remaining members join its namespace.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use podex_id::PodId;
use podex_networking::NetworkIdentity;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::members::PodCore;
use super::{Pod, PodConfig, PodDeps, PodError, PodEvent, PodStatus};
use crate::runtime::PortBinding;
use crate::task::{ContainerTaskSpec, RuntimeInfo};

pub struct CnmPod {
    core: Arc<PodCore>,
}

impl CnmPod {
    pub fn new(
        config: PodConfig,
        specs: Vec<ContainerTaskSpec>,
        deps: PodDeps,
        events: mpsc::UnboundedSender<PodEvent>,
    ) -> Self {
        Self {
            core: Arc::new(PodCore::new(config, specs, deps, events)),
        }
    }
}

/// Every member's port mappings, in member order.
fn collect_ports(specs: impl Iterator<Item = Vec<PortBinding>>) -> Vec<PortBinding> {
    let mut ports: Vec<PortBinding> = Vec::new();
    for binding in specs.flatten() {
        if !ports.contains(&binding) {
            ports.push(binding);
        }
    }
    ports
}

#[async_trait]
impl Pod for CnmPod {
    fn id(&self) -> PodId {
        self.core.pod_id()
    }

    fn network(&self) -> Arc<NetworkIdentity> {
        self.core.identity.clone()
    }

    /// Nothing to create yet: the network container is the first member.
    async fn init(&self) -> Result<(), PodError> {
        let mut inner = self.core.lock().await;
        if inner.status != PodStatus::Unknown {
            return Err(PodError::InvalidState {
                operation: "init",
                status: inner.status,
            });
        }
        debug!(
            pod_id = %self.core.config.pod_id,
            network = %self.core.config.network_name,
            members = inner.members.len(),
            "Runtime-native pod planned"
        );
        inner.status = PodStatus::Init;
        Ok(())
    }

    async fn start(&self) -> Result<(), PodError> {
        let mut inner = self.core.lock().await;
        self.core.begin_start(&mut inner)?;

        let ports = collect_ports(inner.members.iter().map(|m| m.spec.port_mappings.clone()));
        let network_name = self.core.config.network_name.clone();

        let first = match self
            .core
            .start_member(&mut inner, 0, &network_name, ports)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                self.core.fail_start(&mut inner, &e).await;
                return Err(e);
            }
        };

        self.core
            .identity
            .attach(&first.id, first.pid, first.ip_address.clone());
        if let Err(e) = self.core.set_up_network(&mut inner).await {
            self.core.fail_start(&mut inner, &e).await;
            return Err(e);
        }
        info!(
            pod_id = %self.core.config.pod_id,
            network_container = %first.name,
            "Network container ready"
        );

        let network_mode = format!("container:{}", first.id);
        for idx in 1..inner.members.len() {
            if let Err(e) = self
                .core
                .start_member(&mut inner, idx, &network_mode, Vec::new())
                .await
            {
                self.core.fail_start(&mut inner, &e).await;
                return Err(e);
            }
        }

        self.core.spawn_watch(&mut inner);
        Ok(())
    }

    async fn stop(&self, grace: Option<Duration>) {
        self.core.stop(grace).await;
    }

    async fn finit(&self) -> Result<(), PodError> {
        self.core.finit().await
    }

    async fn status(&self) -> PodStatus {
        self.core.status().await
    }

    async fn containers(&self) -> Vec<RuntimeInfo> {
        self.core.containers().await
    }

    async fn healthy(&self) -> Option<bool> {
        self.core.healthy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(host: u32, container: u32) -> PortBinding {
        PortBinding {
            host_port: host,
            container_port: container,
            protocol: "tcp".to_string(),
        }
    }

    #[test]
    fn test_collect_ports_merges_members() {
        let ports = collect_ports(
            vec![
                vec![binding(31000, 80)],
                vec![],
                vec![binding(31001, 9090), binding(31000, 80)],
            ]
            .into_iter(),
        );
        assert_eq!(ports, vec![binding(31000, 80), binding(31001, 9090)]);
    }
}
