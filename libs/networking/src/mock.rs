//! In-memory backend for tests and dry runs.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::NetworkError;
use crate::identity::PodNetwork;
use crate::manager::NetworkBackend;

/// Records every call and hands out `10.88.0.x` addresses.
#[derive(Debug)]
pub struct MockNetworkBackend {
    mode: String,
    fail_set_up: AtomicBool,
    fail_tear_down: AtomicBool,
    next_host: AtomicU32,
    set_up: Mutex<Vec<String>>,
    tear_down: Mutex<Vec<String>>,
}

impl MockNetworkBackend {
    pub fn new(mode: &str) -> Self {
        Self {
            mode: mode.to_string(),
            fail_set_up: AtomicBool::new(false),
            fail_tear_down: AtomicBool::new(false),
            next_host: AtomicU32::new(2),
            set_up: Mutex::new(Vec::new()),
            tear_down: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_set_up(&self, fail: bool) {
        self.fail_set_up.store(fail, Ordering::SeqCst);
    }

    pub fn fail_tear_down(&self, fail: bool) {
        self.fail_tear_down.store(fail, Ordering::SeqCst);
    }

    /// Pod ids passed to `set_up_pod`, in call order.
    pub fn set_up_calls(&self) -> Vec<String> {
        self.set_up.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Pod ids passed to `tear_down_pod`, in call order.
    pub fn tear_down_calls(&self) -> Vec<String> {
        self.tear_down.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NetworkBackend for MockNetworkBackend {
    fn mode(&self) -> &str {
        &self.mode
    }

    async fn init(&self) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn set_up_pod(&self, pod: &dyn PodNetwork) -> Result<(), NetworkError> {
        if let Ok(mut calls) = self.set_up.lock() {
            calls.push(pod.pod_id());
        }
        if self.fail_set_up.load(Ordering::SeqCst) {
            return Err(NetworkError::SetupFailed("mock set up failure".to_string()));
        }
        if pod.container_id().is_none() {
            return Err(NetworkError::MissingIdentity {
                pod: pod.pod_id(),
                what: "network container",
            });
        }
        let host = self.next_host.fetch_add(1, Ordering::SeqCst);
        pod.set_ip_addr(Some(format!("10.88.0.{}", host % 254)));
        Ok(())
    }

    async fn tear_down_pod(&self, pod: &dyn PodNetwork) -> Result<(), NetworkError> {
        if let Ok(mut calls) = self.tear_down.lock() {
            calls.push(pod.pod_id());
        }
        if self.fail_tear_down.load(Ordering::SeqCst) {
            return Err(NetworkError::SetupFailed("mock tear down failure".to_string()));
        }
        Ok(())
    }
}
