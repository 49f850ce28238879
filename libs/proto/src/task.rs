//! Task descriptors as delivered by the control plane.

use podex_id::{AgentId, ExecutorId, FrameworkId, TaskId};
use serde::{Deserialize, Serialize};

use crate::codec::base64_opt;

// =============================================================================
// Task
// =============================================================================

/// A unit of work the control plane asks this node to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Human-readable task name.
    pub name: String,

    /// Unique task identifier.
    pub task_id: TaskId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,

    /// Resources allocated to this task (cpus, mem, ports, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_policy: Option<KillPolicy>,

    /// Opaque custom data (base64 on the wire).
    #[serde(
        default,
        with = "base64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

impl TaskInfo {
    /// Returns the summed value of a scalar resource (e.g. `cpus`, `mem`).
    pub fn scalar(&self, name: &str) -> Option<f64> {
        let values: Vec<f64> = self
            .resources
            .iter()
            .filter(|r| r.name == name)
            .filter_map(|r| r.scalar.as_ref().map(|s| s.value))
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum())
        }
    }

    /// Returns every port offered through `ports` range resources, in order.
    pub fn offered_ports(&self) -> Vec<u32> {
        self.resources
            .iter()
            .filter(|r| r.name == "ports")
            .filter_map(|r| r.ranges.as_ref())
            .flat_map(|ranges| ranges.range.iter())
            .flat_map(|range| range.begin..=range.end)
            .filter_map(|port| u32::try_from(port).ok())
            .collect()
    }

    /// Docker image requested by this task, if any.
    pub fn image(&self) -> Option<&str> {
        self.container
            .as_ref()
            .and_then(|c| c.docker.as_ref())
            .map(|d| d.image.as_str())
            .filter(|image| !image.is_empty())
    }
}

/// A group of tasks that must be launched together as one pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskGroupInfo {
    #[serde(default)]
    pub tasks: Vec<TaskInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

// =============================================================================
// Resources
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Scalar,
    Ranges,
    Set,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalar: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Ranges>,
}

impl Resource {
    pub fn scalar(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            kind: ValueType::Scalar,
            scalar: Some(Scalar { value }),
            ranges: None,
        }
    }

    pub fn ranges(name: &str, range: Vec<Range>) -> Self {
        Self {
            name: name.to_string(),
            kind: ValueType::Ranges,
            scalar: None,
            ranges: Some(Ranges { range }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranges {
    #[serde(default)]
    pub range: Vec<Range>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub begin: u64,
    pub end: u64,
}

// =============================================================================
// Command
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CommandInfo {
    /// Run `value` through `/bin/sh -c` (defaults to true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl CommandInfo {
    pub fn is_shell(&self) -> bool {
        self.shell.unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Environment {
    #[serde(default)]
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

// =============================================================================
// Container
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerType {
    #[default]
    Docker,
    Mesos,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerInfo {
    #[serde(rename = "type", default)]
    pub kind: ContainerType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerInfo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_infos: Vec<NetworkInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DockerNetwork {
    Host,
    Bridge,
    None,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DockerInfo {
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<DockerNetwork>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<PortMapping>,

    #[serde(default)]
    pub privileged: bool,

    /// Extra runtime parameters (`key`/`value` pairs).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,

    #[serde(default)]
    pub force_pull_image: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host port; 0 means "take the next offered port".
    #[serde(default)]
    pub host_port: u32,
    pub container_port: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeMode {
    #[default]
    Rw,
    Ro,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub container_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
    #[serde(default)]
    pub mode: VolumeMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<IpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IpAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

// =============================================================================
// Health check
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckType {
    Http,
    Tcp,
    Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(rename = "type")]
    pub kind: HealthCheckType,

    #[serde(default = "default_delay")]
    pub delay_seconds: f64,

    #[serde(default = "default_interval")]
    pub interval_seconds: f64,

    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,

    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures: u32,

    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpCheckInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpCheckInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,
}

fn default_delay() -> f64 {
    15.0
}

fn default_interval() -> f64 {
    10.0
}

fn default_timeout() -> f64 {
    5.0
}

fn default_consecutive_failures() -> u32 {
    3
}

fn default_grace_period() -> f64 {
    10.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpCheckInfo {
    pub port: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpCheckInfo {
    pub port: u32,
}

// =============================================================================
// Kill policy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationInfo {
    pub nanoseconds: i64,
}

impl DurationInfo {
    pub fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_nanos(u64::try_from(self.nanoseconds).unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KillPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<DurationInfo>,
}

impl KillPolicy {
    pub fn grace(&self) -> Option<std::time::Duration> {
        self.grace_period.map(DurationInfo::to_std)
    }
}

// =============================================================================
// Executor / framework
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_id: Option<FrameworkId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FrameworkId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_json() -> &'static str {
        r#"{
            "name": "web",
            "task_id": "web.1",
            "agent_id": "agent-7",
            "resources": [
                {"name": "cpus", "type": "SCALAR", "scalar": {"value": 0.5}},
                {"name": "mem", "type": "SCALAR", "scalar": {"value": 128}},
                {"name": "ports", "type": "RANGES", "ranges": {"range": [{"begin": 31000, "end": 31002}]}}
            ],
            "command": {"shell": false, "value": "./serve", "arguments": ["--port", "8080"]},
            "container": {
                "type": "DOCKER",
                "docker": {
                    "image": "nginx:1.25",
                    "network": "BRIDGE",
                    "port_mappings": [{"host_port": 0, "container_port": 80, "protocol": "tcp"}]
                },
                "volumes": [{"container_path": "/data", "host_path": "/srv/data", "mode": "RO"}]
            },
            "health_check": {"type": "HTTP", "http": {"port": 80, "path": "/healthz"}},
            "kill_policy": {"grace_period": {"nanoseconds": 3000000000}},
            "data": "aGVsbG8=",
            "labels": [{"key": "team", "value": "edge"}]
        }"#
    }

    #[test]
    fn test_task_info_deserialization() {
        let task: TaskInfo = serde_json::from_str(task_json()).unwrap();
        assert_eq!(task.task_id.as_str(), "web.1");
        assert_eq!(task.image(), Some("nginx:1.25"));
        assert_eq!(task.scalar("cpus"), Some(0.5));
        assert_eq!(task.scalar("mem"), Some(128.0));
        assert_eq!(task.scalar("disk"), None);
        assert_eq!(task.offered_ports(), vec![31000, 31001, 31002]);
        assert_eq!(task.data.as_deref(), Some(&b"hello"[..]));

        let container = task.container.as_ref().unwrap();
        assert_eq!(container.volumes[0].mode, VolumeMode::Ro);

        let check = task.health_check.as_ref().unwrap();
        assert_eq!(check.kind, HealthCheckType::Http);
        assert_eq!(check.interval_seconds, 10.0);
        assert_eq!(check.consecutive_failures, 3);

        let grace = task.kill_policy.unwrap().grace().unwrap();
        assert_eq!(grace, std::time::Duration::from_secs(3));
    }

    #[test]
    fn test_command_shell_defaults_true() {
        let cmd = CommandInfo::default();
        assert!(cmd.is_shell());
    }

    #[test]
    fn test_image_empty_is_none() {
        let mut task: TaskInfo = serde_json::from_str(task_json()).unwrap();
        task.container.as_mut().unwrap().docker.as_mut().unwrap().image = String::new();
        assert_eq!(task.image(), None);
    }

    #[test]
    fn test_negative_grace_clamps_to_zero() {
        let info = DurationInfo { nanoseconds: -5 };
        assert_eq!(info.to_std(), std::time::Duration::ZERO);
    }
}
