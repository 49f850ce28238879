//! Normalized view of one container to create.

use std::collections::BTreeMap;
use std::time::Duration;

use podex_id::TaskId;
use serde::Serialize;

use crate::health::HealthCheckConfig;
use crate::runtime::{
    ContainerConfig, ContainerInfo, ContainerStatus, PortBinding, ResourceSpec, UploadFile,
};

/// Observed runtime state of a member container.
///
/// Lives inside its [`ContainerTaskSpec`]; only creation, start and the
/// watch loop write to it. Serialized as the status update payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub name: String,
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub resources: ResourceSpec,
}

impl RuntimeInfo {
    fn new(name: &str, resources: ResourceSpec) -> Self {
        Self {
            container_id: None,
            name: name.to_string(),
            status: ContainerStatus::Unknown,
            exit_code: None,
            healthy: None,
            message: None,
            ip_address: None,
            pid: None,
            resources,
        }
    }

    /// Folds a runtime observation in. Returns true if the status changed.
    pub fn apply(&mut self, info: &ContainerInfo) -> bool {
        let changed = self.status != info.status;
        self.container_id = Some(info.id.clone());
        self.status = info.status;
        self.exit_code = info.exit_code;
        if info.pid.is_some() || info.status.is_down() {
            self.pid = info.pid;
        }
        if info.ip_address.is_some() {
            self.ip_address = info.ip_address.clone();
        }
        if let Some(error) = &info.error {
            self.message = Some(error.clone());
        }
        changed
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Everything needed to create and supervise one member container.
#[derive(Debug, Clone)]
pub struct ContainerTaskSpec {
    pub task_id: TaskId,
    /// Task name from the descriptor.
    pub task_name: String,
    /// Runtime container name.
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// `host:container[:ro]` binds.
    pub volumes: Vec<String>,
    pub port_mappings: Vec<PortBinding>,
    pub resources: ResourceSpec,
    pub devices: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub kill_timeout: Duration,
    /// Remove the container when the pod stops.
    pub auto_remove: bool,
    pub privileged: bool,
    pub force_pull: bool,
    pub hostname: Option<String>,
    pub health_check: Option<HealthCheckConfig>,
    /// Files placed in the container before its process starts.
    pub files: Vec<UploadFile>,
    pub runtime: RuntimeInfo,
}

impl ContainerTaskSpec {
    pub fn new(task_id: TaskId, task_name: &str, name: &str, image: &str) -> Self {
        Self {
            task_id,
            task_name: task_name.to_string(),
            name: name.to_string(),
            image: image.to_string(),
            command: Vec::new(),
            env: BTreeMap::new(),
            volumes: Vec::new(),
            port_mappings: Vec::new(),
            resources: ResourceSpec::default(),
            devices: Vec::new(),
            labels: BTreeMap::new(),
            kill_timeout: Duration::from_secs(10),
            auto_remove: true,
            privileged: false,
            force_pull: false,
            hostname: None,
            health_check: None,
            files: Vec::new(),
            runtime: RuntimeInfo::new(name, ResourceSpec::default()),
        }
    }

    pub fn with_resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = resources;
        self.runtime.resources = resources;
        self
    }

    pub fn container_id(&self) -> Option<&str> {
        self.runtime.container_id.as_deref()
    }

    /// Runtime create request for this member.
    ///
    /// The pod decides the network mode and which ports get published.
    pub fn to_container_config(&self, network_mode: &str, ports: Vec<PortBinding>) -> ContainerConfig {
        ContainerConfig {
            name: self.name.clone(),
            image: self.image.clone(),
            cmd: self.command.clone(),
            env: self.env.clone(),
            labels: self.labels.clone(),
            binds: self.volumes.clone(),
            network_mode: network_mode.to_string(),
            port_bindings: ports,
            hostname: self.hostname.clone(),
            privileged: self.privileged,
            resources: self.resources,
            devices: self.devices.clone(),
            force_pull: self.force_pull,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerTaskSpec {
        ContainerTaskSpec::new(TaskId::parse("web.task").unwrap(), "web", "podex-p-0-web", "nginx")
    }

    #[test]
    fn test_apply_tracks_status_changes() {
        let mut spec = spec();
        let mut info = ContainerInfo {
            id: "c1".to_string(),
            name: "podex-p-0-web".to_string(),
            status: ContainerStatus::Created,
            ..Default::default()
        };
        assert!(spec.runtime.apply(&info));
        assert!(!spec.runtime.apply(&info));

        info.status = ContainerStatus::Running;
        info.pid = Some(42);
        info.ip_address = Some("10.0.0.2".to_string());
        assert!(spec.runtime.apply(&info));
        assert_eq!(spec.container_id(), Some("c1"));
        assert_eq!(spec.runtime.pid, Some(42));

        // Exited containers lose their pid but keep the last address.
        info.status = ContainerStatus::Exited;
        info.pid = None;
        info.ip_address = None;
        info.exit_code = Some(1);
        assert!(spec.runtime.apply(&info));
        assert_eq!(spec.runtime.pid, None);
        assert_eq!(spec.runtime.ip_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(spec.runtime.exit_code, Some(1));
    }

    #[test]
    fn test_runtime_info_json() {
        let spec = spec().with_resources(ResourceSpec {
            cpus: Some(0.5),
            memory_mb: None,
            cpu_shares: None,
        });
        let json: serde_json::Value = serde_json::from_slice(&spec.runtime.to_json()).unwrap();
        assert_eq!(json["name"], "podex-p-0-web");
        assert_eq!(json["status"], "unknown");
        assert_eq!(json["resources"]["cpus"], 0.5);
        assert!(json.get("container_id").is_none());
    }

    #[test]
    fn test_container_config_uses_pod_network() {
        let mut spec = spec();
        spec.command = vec!["nginx".to_string()];
        spec.volumes = vec!["/data:/data:ro".to_string()];
        let config = spec.to_container_config("container:infra", vec![]);
        assert_eq!(config.network_mode, "container:infra");
        assert_eq!(config.binds, vec!["/data:/data:ro"]);
        assert!(config.port_bindings.is_empty());
    }
}
