//! Pod network management.
//!
//! A pod owns one network identity that every member container shares.
//! Who creates that identity depends on the network mode:
//!
//! - `cni`: the pod creates an infrastructure container with a private
//!   namespace and a CNI plugin chain attaches the final interface to it
//! - `cnm`: the container runtime's native networking assigns the identity
//!   to the first member; the backend only records what the runtime chose
//!
//! Backends never see pod internals. They work through the [`PodNetwork`]
//! accessor trait, and [`NetworkManager`] routes each pod to the backend
//! registered for its mode.

mod cni;
mod cnm;
mod error;
mod identity;
mod manager;
mod mock;

pub use cni::{CniBackend, CniConfig};
pub use cnm::CnmBackend;
pub use error::NetworkError;
pub use identity::{NetworkIdentity, PodNetwork};
pub use manager::{NetworkBackend, NetworkManager};
pub use mock::MockNetworkBackend;

/// Mode name for the namespace-owning variant.
pub const MODE_CNI: &str = "cni";

/// Mode name for the runtime-native variant.
pub const MODE_CNM: &str = "cnm";
