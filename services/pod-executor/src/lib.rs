//! Pod executor library
//!
//! The pod executor runs on a cluster node, one process per task group. It
//! subscribes to the local control-plane agent, launches the group as a pod
//! of containers sharing one network identity, watches the containers, and
//! reports every task's state transitions back to the agent.
//!
//! ## Architecture
//!
//! ```text
//! agent ──events──> DriverHandle ──callbacks──> Executor ──> Pod (CNI | CNM)
//!   ^                    │                         │           ├── members
//!   └───status updates───┘<───────PodEvent─────────┘           └── health checkers
//! ```
//!
//! ## Modules
//!
//! - `driver`: subscription, event dispatch, acknowledgement tracking
//! - `executor`: task translation, launch/kill sequencing, framework messages
//! - `pod`: pod lifecycle, network variants, container watch loop
//! - `health`: per-task TCP/HTTP/command checks
//! - `runtime`: container runtime abstraction (Docker Engine, mock)

pub mod config;
pub mod driver;
pub mod executor;
pub mod health;
pub mod metrics;
pub mod pod;
pub mod runtime;
pub mod task;

// Re-export commonly used types
pub use driver::{DriverConfig, DriverHandle, DriverStatus, ExecutorDriver, ExecutorHandler};
pub use executor::{Executor, ExecutorConfig, ExecutorState};
pub use pod::{Pod, PodEvent, PodStatus};
pub use runtime::{ContainerRuntime, DockerRuntime, MockRuntime};
