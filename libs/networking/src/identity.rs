//! The accessor surface a backend uses to reach a pod's network identity.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Read/write view of a pod's network identity.
///
/// Implementations must be cheap and non-blocking; backends call these
/// while a pod operation is in progress.
pub trait PodNetwork: Send + Sync {
    /// Pod identifier, used for logging and plugin arguments.
    fn pod_id(&self) -> String;

    /// Network mode the pod was built for (`cni` or `cnm`).
    fn mode(&self) -> String;

    /// Network name passed to the backend (CNI network or runtime network).
    fn network_name(&self) -> String;

    /// Network namespace path, once the owning container is up.
    fn netns(&self) -> Option<String>;

    /// Id of the container that owns the network identity.
    fn container_id(&self) -> Option<String>;

    /// Address assigned to the pod.
    fn ip_addr(&self) -> Option<String>;

    fn set_ip_addr(&self, ip: Option<String>);

    /// Address the container runtime reported for the owning container.
    fn runtime_ip(&self) -> Option<String>;

    /// Whether the backend must inject an interface into the namespace.
    fn injection(&self) -> bool;

    /// Extra `KEY=VALUE` arguments for the backend.
    fn net_args(&self) -> BTreeMap<String, String>;
}

#[derive(Debug, Default, Clone)]
struct IdentityState {
    netns: Option<String>,
    container_id: Option<String>,
    ip: Option<String>,
    runtime_ip: Option<String>,
}

/// Shared, interior-mutable network identity owned by a pod.
#[derive(Debug)]
pub struct NetworkIdentity {
    pod_id: String,
    mode: String,
    network_name: String,
    injection: bool,
    net_args: BTreeMap<String, String>,
    state: Mutex<IdentityState>,
}

impl NetworkIdentity {
    pub fn new(pod_id: impl Into<String>, mode: impl Into<String>, network_name: impl Into<String>) -> Self {
        let mode = mode.into();
        Self {
            pod_id: pod_id.into(),
            injection: mode == crate::MODE_CNI,
            mode,
            network_name: network_name.into(),
            net_args: BTreeMap::new(),
            state: Mutex::new(IdentityState::default()),
        }
    }

    pub fn with_net_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.net_args.insert(key.into(), value.into());
        self
    }

    /// Records the container that owns the identity and its process id.
    pub fn attach(&self, container_id: &str, pid: Option<u32>, runtime_ip: Option<String>) {
        let mut state = self.lock();
        state.container_id = Some(container_id.to_string());
        state.netns = pid.filter(|p| *p > 0).map(|p| format!("/proc/{p}/ns/net"));
        state.runtime_ip = runtime_ip.filter(|ip| !ip.is_empty());
    }

    /// Forgets everything learned from the runtime.
    pub fn detach(&self) {
        *self.lock() = IdentityState::default();
    }

    fn lock(&self) -> MutexGuard<'_, IdentityState> {
        // A poisoned lock only means a panic elsewhere; the data is plain.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PodNetwork for NetworkIdentity {
    fn pod_id(&self) -> String {
        self.pod_id.clone()
    }

    fn mode(&self) -> String {
        self.mode.clone()
    }

    fn network_name(&self) -> String {
        self.network_name.clone()
    }

    fn netns(&self) -> Option<String> {
        self.lock().netns.clone()
    }

    fn container_id(&self) -> Option<String> {
        self.lock().container_id.clone()
    }

    fn ip_addr(&self) -> Option<String> {
        self.lock().ip.clone()
    }

    fn set_ip_addr(&self, ip: Option<String>) {
        self.lock().ip = ip;
    }

    fn runtime_ip(&self) -> Option<String> {
        self.lock().runtime_ip.clone()
    }

    fn injection(&self) -> bool {
        self.injection
    }

    fn net_args(&self) -> BTreeMap<String, String> {
        self.net_args.clone()
    }
}
