//! Member bookkeeping shared by both pod variants.
//!
//! [`PodCore`] owns the member list behind one async mutex. Start, stop,
//! finit and every watch-loop tick hold that lock for their whole run, so
//! a status report always sees a consistent snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use podex_id::PodId;
use podex_networking::{NetworkIdentity, PodNetwork};
use podex_reconcile::FailureBudget;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{Hook, HookContext, PodConfig, PodDeps, PodError, PodEvent, PodStatus};
use crate::health::{HealthChecker, HealthTarget};
use crate::runtime::{ContainerInfo, ContainerStatus, PortBinding};
use crate::task::{ContainerTaskSpec, RuntimeInfo};

pub(crate) struct Member {
    pub spec: ContainerTaskSpec,
    pub checker: Option<HealthChecker>,
    pub removed: bool,
}

impl Member {
    fn new(spec: ContainerTaskSpec) -> Self {
        let checker = spec
            .health_check
            .clone()
            .map(|config| HealthChecker::new(spec.name.clone(), config));
        Self {
            spec,
            checker,
            removed: false,
        }
    }
}

pub(crate) struct PodInner {
    pub status: PodStatus,
    pub members: Vec<Member>,
    /// Namespace-owning container, when the variant uses one.
    pub infra: Option<String>,
    pub network_up: bool,
    pub healthy: Option<bool>,
    inspect_budget: FailureBudget,
    watch: Option<AbortHandle>,
    started_at: Option<Instant>,
}

/// Result of one reconciliation tick.
enum Verdict {
    Continue,
    Stop,
}

pub(crate) struct PodCore {
    pub config: PodConfig,
    pub deps: PodDeps,
    pub identity: Arc<NetworkIdentity>,
    events: mpsc::UnboundedSender<PodEvent>,
    inner: Mutex<PodInner>,
    cancel: watch::Sender<bool>,
}

impl PodCore {
    pub fn new(
        config: PodConfig,
        specs: Vec<ContainerTaskSpec>,
        deps: PodDeps,
        events: mpsc::UnboundedSender<PodEvent>,
    ) -> Self {
        let identity = Arc::new(NetworkIdentity::new(
            config.pod_id.to_string(),
            config.network_mode.clone(),
            config.network_name.clone(),
        ));
        let (cancel, _) = watch::channel(false);
        let inner = PodInner {
            status: PodStatus::Unknown,
            members: specs.into_iter().map(Member::new).collect(),
            infra: None,
            network_up: false,
            healthy: None,
            inspect_budget: FailureBudget::new(config.inspect_failure_limit),
            watch: None,
            started_at: None,
        };
        Self {
            config,
            deps,
            identity,
            events,
            inner: Mutex::new(inner),
            cancel,
        }
    }

    pub fn pod_id(&self) -> PodId {
        self.config.pod_id
    }

    pub async fn lock(&self) -> MutexGuard<'_, PodInner> {
        self.inner.lock().await
    }

    pub async fn status(&self) -> PodStatus {
        self.inner.lock().await.status
    }

    pub async fn containers(&self) -> Vec<RuntimeInfo> {
        snapshot(&*self.inner.lock().await)
    }

    pub async fn healthy(&self) -> Option<bool> {
        self.inner.lock().await.healthy
    }

    fn emit(&self, event: PodEvent) {
        if self.events.send(event).is_err() {
            debug!(pod_id = %self.config.pod_id, "Pod event dropped, no listener");
        }
    }

    fn set_status(&self, inner: &mut PodInner, next: PodStatus) {
        if inner.status != next {
            debug!(pod_id = %self.config.pod_id, from = %inner.status, to = %next, "Pod status");
            inner.status = next;
        }
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Moves INIT to STARTING; anything else is an error.
    pub fn begin_start(&self, inner: &mut PodInner) -> Result<(), PodError> {
        if inner.status != PodStatus::Init {
            return Err(PodError::InvalidState {
                operation: "start",
                status: inner.status,
            });
        }
        self.set_status(inner, PodStatus::Starting);
        inner.started_at = Some(Instant::now());
        Ok(())
    }

    /// Creates, hooks and starts one member. Strictly sequential per pod.
    pub async fn start_member(
        &self,
        inner: &mut PodInner,
        idx: usize,
        network_mode: &str,
        ports: Vec<PortBinding>,
    ) -> Result<ContainerInfo, PodError> {
        let runtime = self.deps.runtime.clone();
        let member = &mut inner.members[idx];
        let name = member.spec.name.clone();

        let config = member.spec.to_container_config(network_mode, ports);
        let created = runtime
            .create_container(&config)
            .await
            .map_err(|e| PodError::runtime(&name, e))?;
        member.spec.runtime.apply(&created);
        let id = created.id.clone();

        self.run_hook("pre_start", self.deps.hooks.pre_start.as_ref(), &member.spec, &id)
            .await?;

        runtime
            .start_container(&id)
            .await
            .map_err(|e| PodError::runtime(&name, e))?;
        let info = runtime
            .inspect_container(&id)
            .await
            .map_err(|e| PodError::runtime(&name, e))?;
        member.spec.runtime.apply(&info);

        info!(
            pod_id = %self.config.pod_id,
            container = %name,
            container_id = %id,
            network_mode = network_mode,
            status = %info.status,
            "Member started"
        );

        self.run_hook("post_start", self.deps.hooks.post_start.as_ref(), &member.spec, &id)
            .await?;
        Ok(info)
    }

    async fn run_hook(
        &self,
        hook_name: &'static str,
        hook: Option<&Hook>,
        spec: &ContainerTaskSpec,
        container_id: &str,
    ) -> Result<(), PodError> {
        let Some(hook) = hook else {
            return Ok(());
        };
        let ctx = HookContext {
            spec: spec.clone(),
            container_id: container_id.to_string(),
            runtime: self.deps.runtime.clone(),
        };
        hook(ctx).await.map_err(|reason| PodError::Hook {
            hook: hook_name,
            container: spec.name.clone(),
            reason,
        })
    }

    /// Rolls back a failed start: members stopped and removed, network down.
    pub async fn fail_start(&self, inner: &mut PodInner, err: &PodError) {
        error!(pod_id = %self.config.pod_id, error = %err, "Pod start failed, rolling back");
        self.stop_checkers(inner);
        self.stop_members(inner, None, true).await;
        self.tear_down_network(inner).await;
        self.set_status(inner, PodStatus::Failed);
        self.deps.metrics.incr_counter("pod_start_failures", &[]);
    }

    /// Spawns the watch loop under a supervisor that turns a panic into a
    /// running failure.
    pub fn spawn_watch(self: &Arc<Self>, inner: &mut PodInner) {
        let core = self.clone();
        let cancel = self.cancel.subscribe();
        let task = tokio::spawn(async move { core.watch_loop(cancel).await });
        inner.watch = Some(task.abort_handle());

        let core = self.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(pod_id = %core.config.pod_id, "Reconciliation loop panicked");
                    core.running_failure("reconciliation loop panicked".to_string())
                        .await;
                }
            }
        });
        self.deps
            .metrics
            .set_gauge("pod_members", inner.members.len() as f64);
    }

    // =========================================================================
    // Watch loop
    // =========================================================================

    async fn watch_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.watch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(pod_id = %self.config.pod_id, "Watch loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Verdict::Stop = self.reconcile_tick().await {
                        break;
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(pod_id = %self.config.pod_id, "Watch loop exited");
    }

    async fn reconcile_tick(&self) -> Verdict {
        let mut guard = self.inner.lock().await;
        if !guard.status.is_active() {
            return Verdict::Stop;
        }

        let pod_ip = self.identity.ip_addr();
        let inner = &mut *guard;
        let mut all_up = true;
        let mut down = Vec::new();

        for member in inner.members.iter_mut() {
            let name = member.spec.name.clone();
            let Some(id) = member.spec.container_id().map(str::to_string) else {
                all_up = false;
                continue;
            };

            match self.deps.runtime.inspect_container(&id).await {
                Ok(info) => {
                    inner.inspect_budget.record_success(&name);
                    let previous = member.spec.runtime.status;
                    if member.spec.runtime.apply(&info) {
                        info!(
                            pod_id = %self.config.pod_id,
                            container = %name,
                            from = %previous,
                            to = %info.status,
                            exit_code = ?info.exit_code,
                            "Member status changed"
                        );
                    }
                }
                Err(e) => match inner.inspect_budget.record_failure(&name) {
                    Ok(failures) => {
                        warn!(
                            pod_id = %self.config.pod_id,
                            container = %name,
                            consecutive_failures = failures,
                            limit = inner.inspect_budget.limit(),
                            error = %e,
                            "Inspect failed, retrying next tick"
                        );
                        all_up = false;
                        continue;
                    }
                    Err(exhausted) => {
                        error!(
                            pod_id = %self.config.pod_id,
                            container = %name,
                            error = %e,
                            "{exhausted}, treating member as dead"
                        );
                        member.spec.runtime.status = ContainerStatus::Dead;
                        member.spec.runtime.message = Some(format!("inspect failed: {e}"));
                    }
                },
            }

            let status = member.spec.runtime.status;
            if status.is_up() {
                if status == ContainerStatus::Running {
                    start_checker(member, &pod_ip, &id, self);
                }
            } else {
                all_up = false;
                if status.is_down() {
                    down.push((name, member.spec.runtime.exit_code));
                }
            }
        }

        self.refresh_health(inner);

        if !down.is_empty() {
            let clean_exit = down.len() == inner.members.len()
                && down.iter().all(|(_, code)| *code == Some(0));
            if clean_exit {
                self.finish(inner).await;
            } else {
                let error = down
                    .iter()
                    .map(|(name, code)| match code {
                        Some(code) => format!("container {name} exited with code {code}"),
                        None => format!("container {name} is dead"),
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                self.fail_running(inner, error).await;
            }
            return Verdict::Stop;
        }

        if all_up && inner.status == PodStatus::Starting {
            self.set_status(inner, PodStatus::Running);
            if let Some(started_at) = inner.started_at {
                self.deps
                    .metrics
                    .observe_duration("pod_start_duration", started_at.elapsed(), &[]);
            }
            info!(pod_id = %self.config.pod_id, members = inner.members.len(), "Pod running");
            self.emit(PodEvent::Running {
                members: snapshot(inner),
            });
        }

        Verdict::Continue
    }

    fn refresh_health(&self, inner: &mut PodInner) {
        let mut any_checked = false;
        let mut all_confirmed = true;
        for member in inner.members.iter_mut() {
            let Some(checker) = &member.checker else {
                continue;
            };
            any_checked = true;
            let state = checker.state();
            if state.ticks > 0 {
                member.spec.runtime.healthy = Some(state.healthy);
            }
            all_confirmed &= state.is_confirmed_healthy();
        }
        if !any_checked {
            return;
        }

        let previous = inner.healthy;
        let current = if all_confirmed {
            Some(true)
        } else if inner
            .members
            .iter()
            .any(|m| m.spec.runtime.healthy == Some(false))
        {
            Some(false)
        } else {
            // Some checker has not reported yet.
            previous
        };

        if current != previous {
            inner.healthy = current;
            if let (Some(healthy), PodStatus::Running) = (current, inner.status) {
                info!(pod_id = %self.config.pod_id, healthy, "Pod health changed");
                self.emit(PodEvent::HealthChanged {
                    healthy,
                    members: snapshot(inner),
                });
            }
        }
    }

    async fn finish(&self, inner: &mut PodInner) {
        info!(pod_id = %self.config.pod_id, "All members exited cleanly");
        self.stop_checkers(inner);
        self.tear_down_network(inner).await;
        self.set_status(inner, PodStatus::Finish);
        self.deps.metrics.incr_counter("pod_finished", &[]);
        self.emit(PodEvent::Finished {
            members: snapshot(inner),
        });
    }

    /// Running-failure teardown. Runs at most once per pod.
    async fn fail_running(&self, inner: &mut PodInner, error: String) {
        if !inner.status.is_active() {
            return;
        }
        error!(pod_id = %self.config.pod_id, error = %error, "Member failed, tearing down pod");
        self.stop_checkers(inner);
        self.stop_members(inner, None, false).await;
        self.tear_down_network(inner).await;
        self.set_status(inner, PodStatus::Failed);
        self.deps.metrics.incr_counter("pod_failed", &[]);
        self.emit(PodEvent::Failed {
            error,
            members: snapshot(inner),
        });
    }

    /// Entry for failures detected outside a tick.
    pub async fn running_failure(&self, error: String) {
        let mut inner = self.inner.lock().await;
        self.fail_running(&mut inner, error).await;
    }

    // =========================================================================
    // Stop / finit
    // =========================================================================

    pub async fn stop(&self, grace: Option<Duration>) {
        let mut inner = self.inner.lock().await;
        match inner.status {
            PodStatus::Killed | PodStatus::Failed | PodStatus::Finish => {
                debug!(pod_id = %self.config.pod_id, status = %inner.status, "Stop ignored");
                return;
            }
            _ => {}
        }

        info!(pod_id = %self.config.pod_id, grace_ms = ?grace.map(|g| g.as_millis() as u64), "Stopping pod");
        self.set_status(&mut inner, PodStatus::Killing);
        self.cancel.send_replace(true);
        self.stop_checkers(&mut inner);
        let remove = self.config.remove_containers;
        self.stop_members(&mut inner, grace, remove).await;
        self.set_status(&mut inner, PodStatus::Killed);
        self.deps.metrics.incr_counter("pod_killed", &[]);
    }

    /// Releases the network identity and every container still present.
    pub async fn finit(&self) -> Result<(), PodError> {
        let mut inner = self.inner.lock().await;
        self.cancel.send_replace(true);
        if let Some(watch) = inner.watch.take() {
            watch.abort();
        }
        self.stop_checkers(&mut inner);

        if inner.status.is_active() {
            warn!(pod_id = %self.config.pod_id, "Finit on an active pod, stopping members first");
            self.stop_members(&mut inner, None, false).await;
        }

        let mut first_err: Option<PodError> = None;
        if let Err(e) = self.tear_down_network_checked(&mut inner).await {
            first_err = Some(e);
        }

        for member in inner.members.iter_mut().rev() {
            if member.removed {
                continue;
            }
            let Some(id) = member.spec.container_id().map(str::to_string) else {
                continue;
            };
            match self.deps.runtime.remove_container(&id, true).await {
                Ok(()) => member.removed = true,
                Err(e) => {
                    warn!(container = %member.spec.name, error = %e, "Failed to remove member");
                    if first_err.is_none() {
                        first_err = Some(PodError::runtime(&member.spec.name, e));
                    }
                }
            }
        }

        if let Some(infra) = inner.infra.take() {
            if let Err(e) = self.deps.runtime.remove_container(&infra, true).await {
                warn!(container_id = %infra, error = %e, "Failed to remove infra container");
                if first_err.is_none() {
                    first_err = Some(PodError::runtime(&infra, e));
                }
            }
        }

        self.identity.detach();
        debug!(pod_id = %self.config.pod_id, "Pod finalized");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stop_checkers(&self, inner: &mut PodInner) {
        for member in inner.members.iter_mut() {
            if let Some(checker) = member.checker.take() {
                checker.stop();
            }
        }
    }

    /// Stops members in reverse creation order.
    ///
    /// Each member waits `min(grace, kill_timeout)`, or its own kill timeout
    /// when no grace is given.
    pub async fn stop_members(&self, inner: &mut PodInner, grace: Option<Duration>, remove: bool) {
        let runtime = self.deps.runtime.clone();
        for member in inner.members.iter_mut().rev() {
            if member.removed {
                continue;
            }
            let Some(id) = member.spec.container_id().map(str::to_string) else {
                continue;
            };
            let name = member.spec.name.clone();
            let timeout = match grace {
                Some(grace) => grace.min(member.spec.kill_timeout),
                None => member.spec.kill_timeout,
            };

            if let Err(e) = self
                .run_hook("pre_stop", self.deps.hooks.pre_stop.as_ref(), &member.spec, &id)
                .await
            {
                warn!(container = %name, error = %e, "pre_stop hook failed");
            }

            if !member.spec.runtime.status.is_down() {
                match runtime.stop_container(&id, timeout).await {
                    Ok(()) => debug!(container = %name, timeout_ms = timeout.as_millis() as u64, "Member stopped"),
                    Err(e) => warn!(container = %name, error = %e, "Failed to stop member"),
                }
                if let Ok(info) = runtime.inspect_container(&id).await {
                    member.spec.runtime.apply(&info);
                }
            }

            if let Err(e) = self
                .run_hook("post_stop", self.deps.hooks.post_stop.as_ref(), &member.spec, &id)
                .await
            {
                warn!(container = %name, error = %e, "post_stop hook failed");
            }

            if remove && member.spec.auto_remove {
                match runtime.remove_container(&id, true).await {
                    Ok(()) => member.removed = true,
                    Err(e) => warn!(container = %name, error = %e, "Failed to remove member"),
                }
            }
        }
    }

    pub async fn tear_down_network(&self, inner: &mut PodInner) {
        if let Err(e) = self.tear_down_network_checked(inner).await {
            warn!(pod_id = %self.config.pod_id, error = %e, "Network teardown failed");
        }
    }

    async fn tear_down_network_checked(&self, inner: &mut PodInner) -> Result<(), PodError> {
        if !inner.network_up {
            return Ok(());
        }
        inner.network_up = false;
        self.deps.network.tear_down_pod(self.identity.as_ref()).await?;
        Ok(())
    }

    pub async fn set_up_network(&self, inner: &mut PodInner) -> Result<(), PodError> {
        // Mark first so a partial setup is still torn down.
        inner.network_up = true;
        self.deps.network.set_up_pod(self.identity.as_ref()).await?;
        info!(
            pod_id = %self.config.pod_id,
            ip = ?self.identity.ip_addr(),
            netns = ?self.identity.netns(),
            "Pod network ready"
        );
        Ok(())
    }
}

fn start_checker(member: &mut Member, pod_ip: &Option<String>, id: &str, core: &PodCore) {
    let Some(checker) = &member.checker else {
        return;
    };
    if checker.is_started() {
        return;
    }
    let target = HealthTarget {
        ip: pod_ip.clone().or_else(|| member.spec.runtime.ip_address.clone()),
        container_id: id.to_string(),
    };
    if let Err(e) = checker.start(target, core.deps.runtime.clone()) {
        warn!(
            pod_id = %core.config.pod_id,
            container = %member.spec.name,
            error = %e,
            "Health checker could not start"
        );
    }
}

fn snapshot(inner: &PodInner) -> Vec<RuntimeInfo> {
    inner.members.iter().map(|m| m.spec.runtime.clone()).collect()
}
