//! Container runtime interface.
//!
//! The pod engine only ever talks to a container runtime through
//! [`ContainerRuntime`]. Two implementations are provided:
//!
//! - [`DockerRuntime`]: Docker Engine REST API over its unix socket
//! - [`MockRuntime`]: in-memory and scriptable, for tests and dry runs

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod docker;
mod mock;

pub use docker::DockerRuntime;
pub use mock::{MockRuntime, RuntimeCall};

/// Errors from container runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("runtime API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to pull image {image}: {message}")]
    ImagePull { image: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid request: {0}")]
    Invalid(String),

    /// Failure injected or reported by a runtime without more structure.
    #[error("{0}")]
    Failed(String),
}

impl From<hyper::http::Error> for RuntimeError {
    fn from(err: hyper::http::Error) -> Self {
        RuntimeError::Invalid(err.to_string())
    }
}

// =============================================================================
// Types
// =============================================================================

/// Lifecycle status reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    Unknown,
}

impl ContainerStatus {
    /// Parses the runtime's lowercase status string.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    /// Running or paused: the process exists.
    pub fn is_up(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Exited or dead: the process is gone for good.
    pub fn is_down(self) -> bool {
        matches!(self, Self::Exited | Self::Dead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU and memory limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,
}

/// A published port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_port: u32,
    pub container_port: u32,
    pub protocol: String,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// `host:container[:ro]` or an anonymous `container` path.
    pub binds: Vec<String>,
    /// `none`, a network name, or `container:{id}`.
    pub network_mode: String,
    pub port_bindings: Vec<PortBinding>,
    pub hostname: Option<String>,
    pub privileged: bool,
    pub resources: ResourceSpec,
    /// Host device paths passed through unchanged.
    pub devices: Vec<String>,
    pub force_pull: bool,
}

/// Observed state of one container.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub exit_code: Option<i64>,
    pub pid: Option<u32>,
    pub ip_address: Option<String>,
    pub error: Option<String>,
}

/// A single file to place inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    /// Absolute destination path.
    pub dest: String,
    pub data: Vec<u8>,
    pub mode: u32,
    /// Owner as `uid` or `uid:gid`.
    pub user: Option<String>,
}

/// Result of a command run inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

// =============================================================================
// Interface
// =============================================================================

/// Single-container operations the pod engine depends on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container.
    async fn create_container(&self, config: &ContainerConfig) -> Result<ContainerInfo, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stop a container, escalating to SIGKILL after `timeout`.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError>;

    async fn upload_to_container(&self, id: &str, file: &UploadFile) -> Result<(), RuntimeError>;

    async fn run_command(&self, id: &str, argv: &[String]) -> Result<ExecOutput, RuntimeError>;

    async fn update_resources(&self, id: &str, resources: &ResourceSpec) -> Result<(), RuntimeError>;

    /// Commit the container's filesystem as an image; returns the image id.
    async fn commit_image(
        &self,
        id: &str,
        repository: &str,
        tag: Option<&str>,
    ) -> Result<String, RuntimeError>;

    async fn kill_container(&self, id: &str, signal: &str) -> Result<(), RuntimeError>;
}
