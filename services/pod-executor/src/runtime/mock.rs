//! Mock runtime for testing and development.
//!
//! Containers live in memory. Behavior is scripted by matching a fragment
//! of the container name, so tests can fail or exit one member of a pod
//! without knowing its generated id.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    ContainerConfig, ContainerInfo, ContainerRuntime, ContainerStatus, ExecOutput, ResourceSpec,
    RuntimeError, UploadFile,
};

/// A runtime call, recorded in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCall {
    Create { name: String, network_mode: String },
    Start(String),
    Stop { id: String, timeout: Duration },
    Remove(String),
    Inspect(String),
    Upload { id: String, dest: String },
    Exec { id: String, argv: Vec<String> },
    Update { id: String, resources: ResourceSpec },
    Commit { id: String, repository: String },
    Kill { id: String, signal: String },
}

impl RuntimeCall {
    fn is_inspect(&self) -> bool {
        matches!(self, RuntimeCall::Inspect(_))
    }
}

#[derive(Debug, Clone)]
struct MockContainer {
    config: ContainerConfig,
    info: ContainerInfo,
}

#[derive(Debug, Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    calls: Vec<RuntimeCall>,
    uploads: Vec<(String, UploadFile)>,
    fail_create: Vec<String>,
    fail_start: Vec<String>,
    fail_inspect: bool,
    exec_result: Option<ExecOutput>,
}

/// In-memory [`ContainerRuntime`].
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    next_id: AtomicU32,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Fail `create_container` for names containing `fragment`.
    pub fn fail_create(&self, fragment: &str) {
        self.with_state(|s| s.fail_create.push(fragment.to_string()));
    }

    /// Fail `start_container` for names containing `fragment`.
    pub fn fail_start(&self, fragment: &str) {
        self.with_state(|s| s.fail_start.push(fragment.to_string()));
    }

    /// Make every `inspect_container` call fail.
    pub fn fail_inspect(&self, fail: bool) {
        self.with_state(|s| s.fail_inspect = fail);
    }

    /// Force the status of every container whose name contains `fragment`.
    pub fn set_status(&self, fragment: &str, status: ContainerStatus, exit_code: Option<i64>) {
        self.with_state(|s| {
            for c in s.containers.values_mut() {
                if c.info.name.contains(fragment) {
                    c.info.status = status;
                    c.info.exit_code = exit_code;
                }
            }
        });
    }

    /// Result returned by every `run_command`.
    pub fn set_exec_result(&self, exit_code: i64, output: &str) {
        self.with_state(|s| {
            s.exec_result = Some(ExecOutput {
                exit_code,
                output: output.to_string(),
            })
        });
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.with_state(|s| s.calls.clone())
    }

    /// Calls other than `inspect`, which the watch loop issues constantly.
    pub fn mutating_calls(&self) -> Vec<RuntimeCall> {
        self.with_state(|s| s.calls.iter().filter(|c| !c.is_inspect()).cloned().collect())
    }

    pub fn call_count(&self, pred: impl Fn(&RuntimeCall) -> bool) -> usize {
        self.with_state(|s| s.calls.iter().filter(|c| pred(c)).count())
    }

    /// Current state of the container whose name contains `fragment`.
    pub fn container_by_name(&self, fragment: &str) -> Option<ContainerInfo> {
        self.with_state(|s| {
            s.containers
                .values()
                .find(|c| c.info.name.contains(fragment))
                .map(|c| c.info.clone())
        })
    }

    /// Config the container was created with.
    pub fn config_by_name(&self, fragment: &str) -> Option<ContainerConfig> {
        self.with_state(|s| {
            s.containers
                .values()
                .find(|c| c.info.name.contains(fragment))
                .map(|c| c.config.clone())
        })
    }

    /// Containers not yet removed.
    pub fn live_containers(&self) -> usize {
        self.with_state(|s| s.containers.len())
    }

    pub fn uploads(&self) -> Vec<(String, UploadFile)> {
        self.with_state(|s| s.uploads.clone())
    }
}

fn matches_any(fragments: &[String], name: &str) -> bool {
    fragments.iter().any(|f| name.contains(f.as_str()))
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> Result<ContainerInfo, RuntimeError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| {
            s.calls.push(RuntimeCall::Create {
                name: config.name.clone(),
                network_mode: config.network_mode.clone(),
            });
            if matches_any(&s.fail_create, &config.name) {
                return Err(RuntimeError::Failed(format!(
                    "mock create failure for {}",
                    config.name
                )));
            }
            let info = ContainerInfo {
                id: format!("mock{n:08x}"),
                name: config.name.clone(),
                status: ContainerStatus::Created,
                ..Default::default()
            };
            info!(container = %config.name, container_id = %info.id, "[MOCK] Container created");
            s.containers.insert(
                info.id.clone(),
                MockContainer {
                    config: config.clone(),
                    info: info.clone(),
                },
            );
            Ok(info)
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_state(|s| {
            s.calls.push(RuntimeCall::Start(id.to_string()));
            let fail_start = s.fail_start.clone();
            let c = s
                .containers
                .get_mut(id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            if matches_any(&fail_start, &c.info.name) {
                return Err(RuntimeError::Failed(format!(
                    "mock start failure for {}",
                    c.info.name
                )));
            }
            let seq = u32::from_str_radix(id.trim_start_matches("mock"), 16).unwrap_or(0);
            c.info.status = ContainerStatus::Running;
            c.info.pid = Some(1000 + seq);
            if !c.config.network_mode.starts_with("container:") && c.config.network_mode != "none" {
                c.info.ip_address = Some(format!("172.17.0.{}", 2 + seq % 250));
            }
            debug!(container_id = id, "[MOCK] Container started");
            Ok(())
        })
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        self.with_state(|s| {
            s.calls.push(RuntimeCall::Stop {
                id: id.to_string(),
                timeout,
            });
            let c = s
                .containers
                .get_mut(id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            if c.info.status.is_up() {
                c.info.status = ContainerStatus::Exited;
                c.info.exit_code = Some(137);
                c.info.pid = None;
            }
            Ok(())
        })
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), RuntimeError> {
        self.with_state(|s| {
            s.calls.push(RuntimeCall::Remove(id.to_string()));
            s.containers.remove(id);
            Ok(())
        })
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        self.with_state(|s| {
            s.calls.push(RuntimeCall::Inspect(id.to_string()));
            if s.fail_inspect {
                return Err(RuntimeError::Failed("mock inspect failure".to_string()));
            }
            s.containers
                .get(id)
                .map(|c| c.info.clone())
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
        })
    }

    async fn upload_to_container(&self, id: &str, file: &UploadFile) -> Result<(), RuntimeError> {
        self.with_state(|s| {
            s.calls.push(RuntimeCall::Upload {
                id: id.to_string(),
                dest: file.dest.clone(),
            });
            if !s.containers.contains_key(id) {
                return Err(RuntimeError::NotFound(id.to_string()));
            }
            s.uploads.push((id.to_string(), file.clone()));
            Ok(())
        })
    }

    async fn run_command(&self, id: &str, argv: &[String]) -> Result<ExecOutput, RuntimeError> {
        self.with_state(|s| {
            s.calls.push(RuntimeCall::Exec {
                id: id.to_string(),
                argv: argv.to_vec(),
            });
            if !s.containers.contains_key(id) {
                return Err(RuntimeError::NotFound(id.to_string()));
            }
            Ok(s.exec_result.clone().unwrap_or_default())
        })
    }

    async fn update_resources(&self, id: &str, resources: &ResourceSpec) -> Result<(), RuntimeError> {
        self.with_state(|s| {
            s.calls.push(RuntimeCall::Update {
                id: id.to_string(),
                resources: *resources,
            });
            let c = s
                .containers
                .get_mut(id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            c.config.resources = *resources;
            Ok(())
        })
    }

    async fn commit_image(
        &self,
        id: &str,
        repository: &str,
        tag: Option<&str>,
    ) -> Result<String, RuntimeError> {
        self.with_state(|s| {
            s.calls.push(RuntimeCall::Commit {
                id: id.to_string(),
                repository: repository.to_string(),
            });
            if !s.containers.contains_key(id) {
                return Err(RuntimeError::NotFound(id.to_string()));
            }
            Ok(format!("sha256:{repository}-{}", tag.unwrap_or("latest")))
        })
    }

    async fn kill_container(&self, id: &str, signal: &str) -> Result<(), RuntimeError> {
        self.with_state(|s| {
            s.calls.push(RuntimeCall::Kill {
                id: id.to_string(),
                signal: signal.to_string(),
            });
            if !s.containers.contains_key(id) {
                return Err(RuntimeError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }
}
