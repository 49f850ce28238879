//! # podex-id
//!
//! Typed identifiers used by the pod executor.
//!
//! ## Two Families
//!
//! - **Control-plane IDs** (`TaskId`, `ExecutorId`, `FrameworkId`, `AgentId`)
//!   are opaque strings issued by the control plane. The agent never
//!   generates them; it only validates and carries them.
//! - **Agent IDs** (`PodId`) are generated locally in the format
//!   `{prefix}_{ulid}`, e.g. `pod_01HV4Z2WQXKJNM8GPQY6VBKC3D`.
//!
//! Both families are distinct types so a task ID can never be passed where
//! an executor ID is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
