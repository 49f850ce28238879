//! Namespace-owning pod.
//!
//! An infrastructure container is created with no network of its own. Its
//! network namespace (`/proc/{pid}/ns/net`) is handed to the CNI backend,
//! and every member joins it with `container:{infra id}`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use podex_id::PodId;
use podex_networking::NetworkIdentity;
use tokio::sync::mpsc;
use tracing::info;

use super::members::{PodCore, PodInner};
use super::{Pod, PodConfig, PodDeps, PodError, PodEvent, PodStatus};
use crate::runtime::{ContainerConfig, ContainerStatus};
use crate::task::{ContainerTaskSpec, RuntimeInfo};

pub struct CniPod {
    core: Arc<PodCore>,
}

impl CniPod {
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

    fn infra_config(&self) -> ContainerConfig {
        let config = &self.core.config;
        let mut labels = BTreeMap::new();
        labels.insert("podex.pod_id".to_string(), config.pod_id.to_string());
        labels.insert("podex.executor_id".to_string(), config.executor_id.to_string());
        labels.insert("podex.role".to_string(), "infra".to_string());
        ContainerConfig {
            name: format!("podex-{}-infra", config.pod_id),
            image: config.infra_image.clone(),
            labels,
            network_mode: "none".to_string(),
            ..Default::default()
        }
    }

    async fn init_locked(&self, inner: &mut PodInner) -> Result<(), PodError> {
        let runtime = &self.core.deps.runtime;
        let config = self.infra_config();

        let created = runtime
            .create_container(&config)
            .await
            .map_err(|e| PodError::runtime(&config.name, e))?;
        inner.infra = Some(created.id.clone());

        runtime
            .start_container(&created.id)
            .await
            .map_err(|e| PodError::runtime(&config.name, e))?;
        let info = runtime
            .inspect_container(&created.id)
            .await
            .map_err(|e| PodError::runtime(&config.name, e))?;
        if info.status != ContainerStatus::Running {
            return Err(PodError::MemberFailed(format!(
                "infra container {} is {}",
                config.name, info.status
            )));
        }

        self.core.identity.attach(&info.id, info.pid, None);
        self.core.set_up_network(inner).await?;

        info!(
            pod_id = %self.core.config.pod_id,
            infra_id = %info.id,
            pid = ?info.pid,
            "Infra container ready"
        );
        Ok(())
    }
}

#[async_trait]
impl Pod for CniPod {
    fn id(&self) -> PodId {
        self.core.pod_id()
    }

    fn network(&self) -> Arc<NetworkIdentity> {
        self.core.identity.clone()
    }

    async fn init(&self) -> Result<(), PodError> {
        let mut inner = self.core.lock().await;
        if inner.status != PodStatus::Unknown {
            return Err(PodError::InvalidState {
                operation: "init",
                status: inner.status,
            });
        }
        match self.init_locked(&mut inner).await {
            Ok(()) => {
                inner.status = PodStatus::Init;
                Ok(())
            }
            Err(e) => {
                self.core.tear_down_network(&mut inner).await;
                inner.status = PodStatus::Failed;
                Err(e)
            }
        }
    }

    async fn start(&self) -> Result<(), PodError> {
        let mut inner = self.core.lock().await;
        self.core.begin_start(&mut inner)?;

        let Some(infra) = inner.infra.clone() else {
            let err = PodError::InvalidState {
                operation: "start",
                status: inner.status,
            };
            self.core.fail_start(&mut inner, &err).await;
            return Err(err);
        };
        let network_mode = format!("container:{infra}");

        for idx in 0..inner.members.len() {
            // The namespace is owned by CNI; nothing is published.
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
