//! Pods: a set of member containers sharing one network identity.
//!
//! ```text
//! UNKNOWN ──init──> INIT ──start──> STARTING ──all up──> RUNNING
//!                                       │                   │
//!                                       ├── stop ──> KILLING ──> KILLED
//!                                       ├── member down ──> FAILED
//!                                       └── all exited 0 ──> FINISH
//! ```
//!
//! Two variants differ only in who owns the network identity:
//! - [`CniPod`]: an infrastructure container owns the namespace and the CNI
//!   backend wires it up before any member exists
//! - [`CnmPod`]: the first member owns the runtime-native network; the rest
//!   join it
//!
//! Both share [`members::PodCore`] for member bookkeeping, the watch loop
//! and teardown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use podex_id::{ExecutorId, PodId};
use podex_networking::{NetworkError, NetworkIdentity, NetworkManager, MODE_CNI, MODE_CNM};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::metrics::MetricsSink;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::task::{ContainerTaskSpec, RuntimeInfo};

mod cni;
mod cnm;
mod members;

pub use cni::CniPod;
pub use cnm::CnmPod;

// =============================================================================
// Status and events
// =============================================================================

/// Aggregate pod state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PodStatus {
    Unknown,
    Init,
    Starting,
    Running,
    Killing,
    Killed,
    Failed,
    Finish,
}

impl PodStatus {
    /// No further transitions happen from here.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Killed | Self::Failed | Self::Finish)
    }

    /// The watch loop is responsible for this pod.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Init => "INIT",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Killing => "KILLING",
            Self::Killed => "KILLED",
            Self::Failed => "FAILED",
            Self::Finish => "FINISH",
        }
    }
}

impl std::fmt::Display for PodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transitions reported by the watch loop, each sent once.
#[derive(Debug, Clone, PartialEq)]
pub enum PodEvent {
    /// Every member observed running.
    Running { members: Vec<RuntimeInfo> },
    /// The aggregate health flag changed.
    HealthChanged {
        healthy: bool,
        members: Vec<RuntimeInfo>,
    },
    /// A member went down; the pod has been torn down.
    Failed {
        error: String,
        members: Vec<RuntimeInfo>,
    },
    /// Every member exited cleanly.
    Finished { members: Vec<RuntimeInfo> },
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum PodError {
    #[error("invalid pod state: {operation} while {status}")]
    InvalidState {
        operation: &'static str,
        status: PodStatus,
    },

    #[error("container {container}: {source}")]
    Runtime {
        container: String,
        #[source]
        source: RuntimeError,
    },

    #[error("network: {0}")]
    Network(#[from] NetworkError),

    #[error("{hook} hook failed for {container}: {reason}")]
    Hook {
        hook: &'static str,
        container: String,
        reason: String,
    },

    #[error("{0}")]
    MemberFailed(String),

    #[error("pod has no members")]
    Empty,
}

impl PodError {
    pub(crate) fn runtime(container: &str, source: RuntimeError) -> Self {
        PodError::Runtime {
            container: container.to_string(),
            source,
        }
    }
}

// =============================================================================
// Hooks
// =============================================================================

/// What a hook sees.
#[derive(Clone)]
pub struct HookContext {
    pub spec: ContainerTaskSpec,
    pub container_id: String,
    pub runtime: Arc<dyn ContainerRuntime>,
}

pub type Hook = Arc<dyn Fn(HookContext) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Callbacks around each member's start and stop, run in order.
///
/// - `pre_start`: after create, before the process starts; failure aborts
///   the pod start
/// - `post_start`: after the process started
/// - `pre_stop` / `post_stop`: around each member's stop; failures are logged
#[derive(Clone, Default)]
pub struct PodHooks {
    pub pre_start: Option<Hook>,
    pub post_start: Option<Hook>,
    pub pre_stop: Option<Hook>,
    pub post_stop: Option<Hook>,
}

impl std::fmt::Debug for PodHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodHooks")
            .field("pre_start", &self.pre_start.is_some())
            .field("post_start", &self.post_start.is_some())
            .field("pre_stop", &self.pre_stop.is_some())
            .field("post_stop", &self.post_stop.is_some())
            .finish()
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct PodConfig {
    pub pod_id: PodId,
    pub executor_id: ExecutorId,
    /// `cni` or `cnm`.
    pub network_mode: String,
    pub network_name: String,
    /// Image for the namespace-owning container.
    pub infra_image: String,
    pub watch_interval: Duration,
    /// Consecutive inspect failures tolerated per member.
    pub inspect_failure_limit: u32,
    /// Remove members when the pod is stopped.
    pub remove_containers: bool,
}

impl PodConfig {
    pub fn new(pod_id: PodId, executor_id: ExecutorId) -> Self {
        Self {
            pod_id,
            executor_id,
            network_mode: MODE_CNM.to_string(),
            network_name: "bridge".to_string(),
            infra_image: "registry.k8s.io/pause:3.9".to_string(),
            watch_interval: Duration::from_secs(1),
            inspect_failure_limit: podex_reconcile::DEFAULT_FAILURE_LIMIT,
            remove_containers: true,
        }
    }
}

// =============================================================================
// Interface
// =============================================================================

/// A group of containers managed as one failure domain.
#[async_trait]
pub trait Pod: Send + Sync {
    fn id(&self) -> PodId;

    /// Accessors the network backend uses.
    fn network(&self) -> Arc<NetworkIdentity>;

    /// Prepares the network identity. Must run before `start`.
    async fn init(&self) -> Result<(), PodError>;

    /// Creates and starts every member. Rolls back on the first failure.
    async fn start(&self) -> Result<(), PodError>;

    /// Stops every member. Idempotent.
    async fn stop(&self, grace: Option<Duration>);

    /// Releases pod-level resources. Idempotent.
    async fn finit(&self) -> Result<(), PodError>;

    async fn status(&self) -> PodStatus;

    async fn containers(&self) -> Vec<RuntimeInfo>;

    /// AND of member health; `None` until every checked member has reported.
    async fn healthy(&self) -> Option<bool>;
}

/// Collaborators shared by every pod variant.
#[derive(Clone)]
pub struct PodDeps {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub network: NetworkManager,
    pub hooks: PodHooks,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Builds the variant for `config.network_mode`.
pub fn build_pod(
    config: PodConfig,
    specs: Vec<ContainerTaskSpec>,
    deps: PodDeps,
) -> Result<(Arc<dyn Pod>, mpsc::UnboundedReceiver<PodEvent>), PodError> {
    if specs.is_empty() {
        return Err(PodError::Empty);
    }
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let pod: Arc<dyn Pod> = match config.network_mode.as_str() {
        MODE_CNI => Arc::new(CniPod::new(config, specs, deps, events_tx)),
        MODE_CNM => Arc::new(CnmPod::new(config, specs, deps, events_tx)),
        other => return Err(NetworkError::UnknownMode(other.to_string()).into()),
    };
    Ok((pod, events_rx))
}
