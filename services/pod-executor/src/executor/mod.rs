//! Executor: task groups in, one pod out.
//!
//! ```text
//! NOT_RUNNING ──launch──> LAUNCHING ──pod started──> RUNNING
//!      │                      │                         │
//!      └──────────────────────┴── kill / shutdown ──> KILLING ──> SHUTDOWN
//!                             └── launch failure ─────────────────^
//! ```
//!
//! One executor process runs exactly one task group. Launch, kill and pod
//! teardown are serialized by a single lifecycle lock; the event callbacks
//! themselves only validate and spawn, so the driver's event loop keeps
//! processing acknowledgements while a pod starts or stops.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use podex_id::{ExecutorId, PodId, TaskId};
use podex_networking::NetworkManager;
use podex_proto::{KillPolicy, Subscribed, TaskGroupInfo, TaskInfo, TaskState, TaskStatus};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::driver::{ExecutorDriver, ExecutorHandler};
use crate::metrics::MetricsSink;
use crate::pod::{build_pod, Hook, HookContext, Pod, PodConfig, PodDeps, PodEvent, PodHooks};
use crate::runtime::{ContainerRuntime, UploadFile};
use crate::task::RuntimeInfo;

mod error;
pub mod fetch;
pub mod messages;
pub mod resources;
pub mod translate;
pub mod xref;

pub use error::ExecutorError;
pub use messages::{MessageHandler, MessageTarget};
pub use resources::{Allocation, ExtendedResourceAllocator, NoopAllocator};
pub use translate::{translate, LaunchPlan, TranslateContext};
pub use xref::CrossRef;

const REASON_LAUNCH_FAILED: &str = "REASON_CONTAINER_LAUNCH_FAILED";
const REASON_TERMINATED: &str = "REASON_CONTAINER_TERMINATED";
const REASON_KILLED: &str = "REASON_TASK_KILLED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutorState {
    #[default]
    NotRunning,
    Launching,
    Running,
    Killing,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub executor_id: ExecutorId,
    /// `cni` or `cnm`.
    pub network_mode: String,
    pub network_name: String,
    pub infra_image: String,
    pub watch_interval: Duration,
    pub inspect_failure_limit: u32,
    pub remove_containers: bool,
    /// Kill grace for tasks without a kill policy.
    pub default_kill_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl ExecutorConfig {
    pub fn new(executor_id: ExecutorId) -> Self {
        let pod = PodConfig::new(PodId::new(), executor_id.clone());
        Self {
            executor_id,
            network_mode: pod.network_mode,
            network_name: pod.network_name,
            infra_image: pod.infra_image,
            watch_interval: pod.watch_interval,
            inspect_failure_limit: pod.inspect_failure_limit,
            remove_containers: pod.remove_containers,
            default_kill_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(30),
        }
    }

    fn pod_config(&self, pod_id: PodId) -> PodConfig {
        PodConfig {
            network_mode: self.network_mode.clone(),
            network_name: self.network_name.clone(),
            infra_image: self.infra_image.clone(),
            watch_interval: self.watch_interval,
            inspect_failure_limit: self.inspect_failure_limit,
            remove_containers: self.remove_containers,
            ..PodConfig::new(pod_id, self.executor_id.clone())
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    state: ExecutorState,
    pod_id: Option<PodId>,
    pod: Option<Arc<dyn Pod>>,
    pump: Option<AbortHandle>,
}

struct Inner {
    config: ExecutorConfig,
    runtime: Arc<dyn ContainerRuntime>,
    network: NetworkManager,
    allocator: Arc<dyn ExtendedResourceAllocator>,
    metrics: Arc<dyn MetricsSink>,
    http: reqwest::Client,
    xref: CrossRef,
    lifecycle: Mutex<Lifecycle>,
    /// Held for the whole of launch, kill and teardown.
    ops: Arc<tokio::sync::Mutex<()>>,
}

/// The [`ExecutorHandler`] for one task group. Cheap to clone.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        runtime: Arc<dyn ContainerRuntime>,
        network: NetworkManager,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self::with_allocator(config, runtime, network, metrics, Arc::new(NoopAllocator))
    }

    pub fn with_allocator(
        config: ExecutorConfig,
        runtime: Arc<dyn ContainerRuntime>,
        network: NetworkManager,
        metrics: Arc<dyn MetricsSink>,
        allocator: Arc<dyn ExtendedResourceAllocator>,
    ) -> Self {
        let http = fetch::http_client(config.fetch_timeout);
        Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                network,
                allocator,
                metrics,
                http,
                xref: CrossRef::new(),
                lifecycle: Mutex::new(Lifecycle::default()),
                ops: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> ExecutorState {
        self.lifecycle().state
    }

    pub fn pod(&self) -> Option<Arc<dyn Pod>> {
        self.lifecycle().pod.clone()
    }

    pub fn xref(&self) -> &CrossRef {
        &self.inner.xref
    }

    fn set_state(&self, state: ExecutorState) {
        let previous = std::mem::replace(&mut self.lifecycle().state, state);
        debug!(from = ?previous, to = ?state, "Executor state");
    }

    // =========================================================================
    // Launch
    // =========================================================================

    /// Sends `state` for every task, tears down whatever exists and shuts
    /// down. Caller holds the lifecycle lock.
    async fn fail_launch(
        &self,
        driver: &Arc<dyn ExecutorDriver>,
        task_ids: &[TaskId],
        state: TaskState,
        message: &str,
    ) {
        error!(state = state.as_str(), error = %message, "Task group launch failed");
        self.inner
            .metrics
            .incr_counter("executor_launch_failures_total", &[("state", state.as_str())]);
        let statuses = task_ids
            .iter()
            .map(|id| {
                TaskStatus::new(id.clone(), state)
                    .with_message(message)
                    .with_reason(REASON_LAUNCH_FAILED)
            })
            .collect();
        self.teardown(driver, statuses, None).await;
    }

    async fn launch(
        &self,
        driver: Arc<dyn ExecutorDriver>,
        task_ids: Vec<TaskId>,
        mut plans: Vec<LaunchPlan>,
        pod_id: PodId,
    ) {
        let started = Instant::now();
        for task_id in &task_ids {
            send(driver.as_ref(), TaskStatus::new(task_id.clone(), TaskState::Starting)).await;
        }

        if let Err(e) = self.resolve(&pod_id, &mut plans).await {
            return self
                .fail_launch(&driver, &task_ids, TaskState::Failed, &e.to_string())
                .await;
        }

        let specs = plans.into_iter().map(|p| p.spec).collect();
        let deps = PodDeps {
            runtime: self.inner.runtime.clone(),
            network: self.inner.network.clone(),
            hooks: PodHooks {
                pre_start: Some(upload_files_hook()),
                ..Default::default()
            },
            metrics: self.inner.metrics.clone(),
        };
        let (pod, events) = match build_pod(self.inner.config.pod_config(pod_id), specs, deps) {
            Ok(built) => built,
            Err(e) => {
                return self
                    .fail_launch(&driver, &task_ids, TaskState::Failed, &e.to_string())
                    .await
            }
        };
        self.lifecycle().pod = Some(pod.clone());

        if let Err(e) = pod.init().await {
            return self
                .fail_launch(&driver, &task_ids, TaskState::Failed, &e.to_string())
                .await;
        }
        if let Err(e) = pod.start().await {
            return self
                .fail_launch(&driver, &task_ids, TaskState::Failed, &e.to_string())
                .await;
        }

        for member in pod.containers().await {
            self.inner.xref.update_runtime(&member);
        }

        let pump = tokio::spawn(self.clone().pump(driver.clone(), events));
        {
            let mut lifecycle = self.lifecycle();
            lifecycle.pump = Some(pump.abort_handle());
            if lifecycle.state == ExecutorState::Launching {
                lifecycle.state = ExecutorState::Running;
            }
        }
        self.inner.metrics.observe_duration(
            "executor_launch_duration_seconds",
            started.elapsed(),
            &[("network_mode", self.inner.config.network_mode.as_str())],
        );
        info!(
            pod_id = %pod_id,
            tasks = task_ids.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Task group launched"
        );
    }

    /// Fetches remote inputs and allocates extended resources.
    async fn resolve(&self, pod_id: &PodId, plans: &mut [LaunchPlan]) -> Result<(), ExecutorError> {
        let requests: Vec<_> = plans
            .iter()
            .flat_map(|p| p.extended.iter().cloned())
            .collect();
        let allocation = self.inner.allocator.allocate(pod_id, &requests).await?;
        if !requests.is_empty() {
            info!(
                pod_id = %pod_id,
                devices = allocation.devices.len(),
                "Extended resources allocated"
            );
        }

        for plan in plans.iter_mut() {
            for file in std::mem::take(&mut plan.remote_files) {
                let data = fetch::fetch_bytes(&self.inner.http, &file.url).await?;
                plan.spec.files.push(UploadFile {
                    mode: file.file_mode(),
                    dest: file.dest,
                    data,
                    user: file.user,
                });
            }

            let mut remote_env = BTreeMap::new();
            for url in &plan.remote_env {
                remote_env.extend(fetch::fetch_env(&self.inner.http, url).await?);
            }
            plan.finalize(remote_env, &allocation.env, &allocation.devices);
        }
        Ok(())
    }

    // =========================================================================
    // Pod events
    // =========================================================================

    async fn pump(self, driver: Arc<dyn ExecutorDriver>, mut events: mpsc::UnboundedReceiver<PodEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                PodEvent::Running { members } => {
                    for member in &members {
                        self.report(&driver, member, TaskState::Running, None).await;
                    }
                }
                PodEvent::HealthChanged { healthy, members } => {
                    for member in &members {
                        let healthy = member.healthy.unwrap_or(healthy);
                        self.report(&driver, member, TaskState::Running, Some(healthy))
                            .await;
                    }
                }
                PodEvent::Failed { error, members } => {
                    return self
                        .finish_pod(&driver, members, TaskState::Failed, Some(error))
                        .await;
                }
                PodEvent::Finished { members } => {
                    return self
                        .finish_pod(&driver, members, TaskState::Finished, None)
                        .await;
                }
            }
        }
    }

    async fn report(
        &self,
        driver: &Arc<dyn ExecutorDriver>,
        member: &RuntimeInfo,
        state: TaskState,
        healthy: Option<bool>,
    ) {
        self.inner.xref.update_runtime(member);
        let Some(task_id) = self.inner.xref.task_for(&member.name) else {
            debug!(container = %member.name, "No task for container");
            return;
        };
        let mut status = TaskStatus::new(task_id, state).with_data(member.to_json());
        if let Some(healthy) = healthy {
            status = status.with_healthy(healthy);
        }
        send(driver.as_ref(), status).await;
    }

    /// Terminal pod event: one status per member, then shutdown.
    async fn finish_pod(
        &self,
        driver: &Arc<dyn ExecutorDriver>,
        members: Vec<RuntimeInfo>,
        state: TaskState,
        error: Option<String>,
    ) {
        let _ops = self.inner.ops.lock().await;
        {
            let mut lifecycle = self.lifecycle();
            // Dropped, not aborted: this is the pump itself.
            lifecycle.pump.take();
            if matches!(
                lifecycle.state,
                ExecutorState::Killing | ExecutorState::Shutdown
            ) {
                return;
            }
        }

        let statuses = members
            .iter()
            .filter_map(|member| {
                self.inner.xref.update_runtime(member);
                let task_id = self.inner.xref.task_for(&member.name)?;
                let mut status = TaskStatus::new(task_id, state).with_data(member.to_json());
                if let Some(error) = &error {
                    status = status.with_message(error).with_reason(REASON_TERMINATED);
                }
                Some(status)
            })
            .collect();
        match &error {
            Some(error) => warn!(error = %error, "Pod failed"),
            None => info!("Pod finished"),
        }
        self.teardown(driver, statuses, None).await;
    }

    // =========================================================================
    // Kill and teardown
    // =========================================================================

    async fn kill(&self, driver: Arc<dyn ExecutorDriver>, grace: Option<Duration>) {
        let _ops = self.inner.ops.lock().await;
        {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                ExecutorState::Killing | ExecutorState::Shutdown => return,
                _ => lifecycle.state = ExecutorState::Killing,
            }
        }

        let task_ids = self.inner.xref.task_ids();
        for task_id in &task_ids {
            send(driver.as_ref(), TaskStatus::new(task_id.clone(), TaskState::Killing)).await;
        }
        let statuses = task_ids
            .into_iter()
            .map(|id| TaskStatus::new(id, TaskState::Killed).with_reason(REASON_KILLED))
            .collect();
        self.teardown(&driver, statuses, grace).await;
    }

    /// Stops the pod, releases everything, sends `statuses` and stops the
    /// driver. Caller holds the lifecycle lock.
    async fn teardown(
        &self,
        driver: &Arc<dyn ExecutorDriver>,
        statuses: Vec<TaskStatus>,
        grace: Option<Duration>,
    ) {
        let (pod, pod_id, pump) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == ExecutorState::Shutdown {
                return;
            }
            (lifecycle.pod.take(), lifecycle.pod_id, lifecycle.pump.take())
        };
        if let Some(pump) = pump {
            pump.abort();
        }

        if let Some(pod) = &pod {
            pod.stop(grace).await;
            if let Err(e) = pod.finit().await {
                warn!(pod_id = %pod.id(), error = %e, "Pod finit failed");
            }
        }
        if let Some(pod_id) = &pod_id {
            self.inner.allocator.release(pod_id).await;
        }

        for status in statuses {
            send(driver.as_ref(), status).await;
        }
        self.inner.xref.clean();
        self.set_state(ExecutorState::Shutdown);
        info!(pod_id = ?pod_id.map(|id| id.to_string()), "Executor shut down");
        driver.stop().await;
    }

    // =========================================================================
    // Framework messages
    // =========================================================================

    fn message_targets(&self) -> Vec<MessageTarget> {
        if self.state() != ExecutorState::Running {
            return Vec::new();
        }
        let xref = &self.inner.xref;
        xref.task_ids()
            .into_iter()
            .filter_map(|task_id| {
                let container = xref.container_for(&task_id)?;
                let container_id = xref.runtime(&container)?.container_id?;
                Some(MessageTarget {
                    task_id,
                    container_id,
                })
            })
            .collect()
    }

    fn spawn_kill(&self, driver: Arc<dyn ExecutorDriver>, grace: Option<Duration>) {
        let this = self.clone();
        tokio::spawn(async move { this.kill(driver, grace).await });
    }

    fn spawn_launch(
        &self,
        driver: Arc<dyn ExecutorDriver>,
        task_ids: Vec<TaskId>,
        plans: Vec<LaunchPlan>,
        pod_id: PodId,
        ops: OwnedMutexGuard<()>,
    ) {
        let this = self.clone();
        let launch_driver = driver.clone();
        let launch_ids = task_ids.clone();
        let handle = tokio::spawn(async move {
            let _ops = ops;
            this.launch(launch_driver, launch_ids, plans, pod_id).await;
        });

        // A panicking launch is turned into the ordinary failure path.
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(pod_id = %pod_id, "Launch panicked");
                    let _ops = this.inner.ops.lock().await;
                    this.fail_launch(&driver, &task_ids, TaskState::Failed, "launch panicked")
                        .await;
                }
            }
        });
    }
}

/// Uploads every materialised file before the member's process starts.
fn upload_files_hook() -> Hook {
    Arc::new(|ctx: HookContext| -> BoxFuture<'static, Result<(), String>> {
        Box::pin(async move {
            for file in &ctx.spec.files {
                ctx.runtime
                    .upload_to_container(&ctx.container_id, file)
                    .await
                    .map_err(|e| format!("upload {}: {e}", file.dest))?;
            }
            if !ctx.spec.files.is_empty() {
                debug!(
                    container = %ctx.spec.name,
                    files = ctx.spec.files.len(),
                    "Files uploaded"
                );
            }
            Ok(())
        })
    })
}

async fn send(driver: &dyn ExecutorDriver, status: TaskStatus) {
    let task_id = status.task_id.clone();
    let state = status.state;
    if let Err(e) = driver.send_status_update(status).await {
        warn!(task_id = %task_id, state = state.as_str(), error = %e, "Status update failed");
    }
}

#[async_trait]
impl ExecutorHandler for Executor {
    async fn registered(&self, _driver: Arc<dyn ExecutorDriver>, subscribed: Subscribed) {
        info!(
            executor_id = %subscribed.executor_info.executor_id,
            state = ?self.state(),
            "Executor registered"
        );
    }

    async fn disconnected(&self, _driver: Arc<dyn ExecutorDriver>) {
        warn!(state = ?self.state(), "Executor disconnected from agent");
    }

    async fn launch_task_group(&self, driver: Arc<dyn ExecutorDriver>, group: TaskGroupInfo) {
        if group.tasks.is_empty() {
            error!("Received an empty task group");
            driver.abort().await;
            return;
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = group.tasks.iter().find(|t| !seen.insert(t.task_id.clone())) {
            error!(task_id = %dup.task_id, "Duplicate task id in task group");
            driver.abort().await;
            return;
        }

        let task_ids: Vec<TaskId> = group.tasks.iter().map(|t| t.task_id.clone()).collect();
        let claimed = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == ExecutorState::NotRunning {
                let pod_id = PodId::new();
                lifecycle.state = ExecutorState::Launching;
                lifecycle.pod_id = Some(pod_id);
                Ok(pod_id)
            } else {
                Err(lifecycle.state)
            }
        };
        let pod_id = match claimed {
            Ok(pod_id) => pod_id,
            Err(state) => {
                warn!(state = ?state, tasks = task_ids.len(), "Task group already launched, dropping");
                for task_id in task_ids {
                    send(
                        driver.as_ref(),
                        TaskStatus::new(task_id, TaskState::Dropped)
                            .with_message("executor already runs a task group"),
                    )
                    .await;
                }
                return;
            }
        };
        // Uncontended here; taken before returning so a later kill queues
        // behind the launch.
        let ops = self.inner.ops.clone().lock_owned().await;
        info!(pod_id = %pod_id, tasks = task_ids.len(), "Launching task group");
        self.inner.metrics.set_gauge("executor_tasks", task_ids.len() as f64);

        let ctx = TranslateContext {
            pod_id,
            executor_id: self.inner.config.executor_id.clone(),
            default_kill_timeout: self.inner.config.default_kill_timeout,
        };
        let mut plans = Vec::with_capacity(group.tasks.len());
        for (index, task) in group.tasks.iter().enumerate() {
            match translate(&ctx, index, task) {
                Ok(plan) => plans.push(plan),
                Err(e) => {
                    let message = e.to_string();
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _ops = ops;
                        this.fail_launch(&driver, &task_ids, TaskState::Error, &message)
                            .await;
                    });
                    return;
                }
            }
        }

        for (task, plan) in group.tasks.into_iter().zip(&plans) {
            self.inner.xref.set_container_with_task_id(
                task,
                &plan.spec.name,
                plan.spec.runtime.clone(),
            );
        }
        self.spawn_launch(driver, task_ids, plans, pod_id, ops);
    }

    async fn launch_task(&self, driver: Arc<dyn ExecutorDriver>, task: TaskInfo) {
        self.launch_task_group(driver, TaskGroupInfo { tasks: vec![task] })
            .await;
    }

    async fn kill_task(
        &self,
        driver: Arc<dyn ExecutorDriver>,
        task_id: TaskId,
        kill_policy: Option<KillPolicy>,
    ) {
        if !self.inner.xref.contains_task(&task_id) {
            warn!(task_id = %task_id, "Kill for unknown task");
            send(
                driver.as_ref(),
                TaskStatus::new(task_id, TaskState::Lost).with_message("unknown task"),
            )
            .await;
            return;
        }
        info!(task_id = %task_id, "Killing task group");
        let grace = kill_policy.as_ref().and_then(KillPolicy::grace);
        self.spawn_kill(driver, grace);
    }

    async fn framework_message(&self, driver: Arc<dyn ExecutorDriver>, data: Vec<u8>) {
        let this = self.clone();
        tokio::spawn(async move {
            let targets = this.message_targets();
            let handler = MessageHandler {
                runtime: this.inner.runtime.as_ref(),
                http: &this.inner.http,
            };
            let ack = handler.handle(&data, &targets).await;
            match ack.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = driver.send_framework_message(bytes).await {
                        warn!(message_id = %ack.id, error = %e, "Acknowledgement not sent");
                    }
                }
                Err(e) => warn!(message_id = %ack.id, error = %e, "Acknowledgement not encoded"),
            }
        });
    }

    async fn shutdown(&self, driver: Arc<dyn ExecutorDriver>) {
        info!(state = ?self.state(), "Shutdown requested");
        self.spawn_kill(driver, None);
    }

    async fn error(&self, driver: Arc<dyn ExecutorDriver>, message: String) {
        error!(message = %message, "Fatal error from agent");
        driver.abort().await;
    }
}
