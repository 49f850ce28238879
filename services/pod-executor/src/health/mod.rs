//! Per-container health checking.
//!
//! A [`HealthChecker`] owns one background task that:
//! - waits out the initial delay (cancellable)
//! - probes once immediately, then on a fixed interval
//! - records every result in a shared [`HealthState`]
//!
//! Three probe kinds are supported: HTTP (status in `[200, 400)`), TCP
//! (connect succeeds) and Command (in-container exec exits 0). The checker
//! never acts on the result itself; the pod's watch loop reads the state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use podex_proto::{CommandInfo, HealthCheck, HealthCheckType};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::runtime::ContainerRuntime;

mod probe;

pub use probe::Prober;

/// Errors building a health checker.
#[derive(Debug, Error, PartialEq)]
pub enum HealthError {
    #[error("interval ({interval:?}) must be longer than timeout ({timeout:?})")]
    InvalidInterval { interval: Duration, timeout: Duration },

    #[error("invalid probe port: {0}")]
    InvalidPort(u32),

    #[error("command probe has no command")]
    EmptyCommand,

    #[error("{0} health check has no probe definition")]
    MissingProbe(&'static str),

    #[error("failed to build probe client: {0}")]
    Client(String),
}

/// What to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    Http {
        port: u16,
        path: String,
        scheme: String,
    },
    Tcp {
        port: u16,
    },
    Command {
        argv: Vec<String>,
    },
}

impl ProbeKind {
    /// Network probes target the pod address; command probes the container.
    pub fn needs_ip(&self) -> bool {
        !matches!(self, ProbeKind::Command { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Http { .. } => "http",
            ProbeKind::Tcp { .. } => "tcp",
            ProbeKind::Command { .. } => "command",
        }
    }
}

/// Validated health-check settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckConfig {
    pub probe: ProbeKind,
    /// Wait before the first probe.
    pub initial_wait: Duration,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failures after which the member is reported failing.
    pub max_consecutive_failures: u32,
}

impl HealthCheckConfig {
    pub fn new(
        probe: ProbeKind,
        initial_wait: Duration,
        interval: Duration,
        timeout: Duration,
        max_consecutive_failures: u32,
    ) -> Result<Self, HealthError> {
        if interval <= timeout {
            return Err(HealthError::InvalidInterval { interval, timeout });
        }
        match &probe {
            ProbeKind::Http { port, .. } | ProbeKind::Tcp { port } if *port == 0 => {
                return Err(HealthError::InvalidPort(0));
            }
            ProbeKind::Command { argv } if argv.first().map_or(true, |a| a.is_empty()) => {
                return Err(HealthError::EmptyCommand);
            }
            _ => {}
        }
        Ok(Self {
            probe,
            initial_wait,
            interval,
            timeout,
            max_consecutive_failures: max_consecutive_failures.max(1),
        })
    }

    /// Builds the config from the task descriptor's health check.
    ///
    /// The initial wait is the longer of the delay and the grace period.
    pub fn from_proto(check: &HealthCheck) -> Result<Self, HealthError> {
        let probe = match check.kind {
            HealthCheckType::Http => {
                let http = check.http.as_ref().ok_or(HealthError::MissingProbe("http"))?;
                let path = match http.path.as_deref() {
                    Some(p) if p.starts_with('/') => p.to_string(),
                    Some(p) if !p.is_empty() => format!("/{p}"),
                    _ => "/".to_string(),
                };
                ProbeKind::Http {
                    port: port(http.port)?,
                    path,
                    scheme: http.scheme.clone().unwrap_or_else(|| "http".to_string()),
                }
            }
            HealthCheckType::Tcp => {
                let tcp = check.tcp.as_ref().ok_or(HealthError::MissingProbe("tcp"))?;
                ProbeKind::Tcp {
                    port: port(tcp.port)?,
                }
            }
            HealthCheckType::Command => {
                let command = check
                    .command
                    .as_ref()
                    .ok_or(HealthError::MissingProbe("command"))?;
                ProbeKind::Command {
                    argv: command_argv(command),
                }
            }
        };

        let initial_wait = secs(check.delay_seconds).max(secs(check.grace_period_seconds));
        Self::new(
            probe,
            initial_wait,
            secs(check.interval_seconds),
            secs(check.timeout_seconds),
            check.consecutive_failures,
        )
    }
}

fn port(raw: u32) -> Result<u16, HealthError> {
    match u16::try_from(raw) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(HealthError::InvalidPort(raw)),
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

/// Argv for a command, honoring the shell flag.
pub fn command_argv(command: &CommandInfo) -> Vec<String> {
    let value = command.value.clone().unwrap_or_default();
    if command.is_shell() {
        if value.is_empty() {
            return Vec::new();
        }
        return vec!["/bin/sh".to_string(), "-c".to_string(), value];
    }
    let mut argv = Vec::with_capacity(command.arguments.len() + 1);
    if !value.is_empty() {
        argv.push(value);
    }
    argv.extend(command.arguments.iter().cloned());
    argv
}

// =============================================================================
// State
// =============================================================================

/// Probe counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthState {
    /// Failed probes, total.
    pub failures: u64,
    pub consecutive_failures: u32,
    /// Probes run.
    pub ticks: u64,
    pub healthy: bool,
    pub started: bool,
}

impl HealthState {
    pub fn record(&mut self, ok: bool) {
        self.ticks += 1;
        if ok {
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        self.healthy = self.consecutive_failures == 0;
    }

    /// Healthy and probed at least once.
    pub fn is_confirmed_healthy(&self) -> bool {
        self.ticks > 0 && self.healthy
    }
}

/// Where probes are aimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTarget {
    /// Pod address for network probes.
    pub ip: Option<String>,
    /// Container for command probes.
    pub container_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Running,
    Paused,
    Stopped,
}

// =============================================================================
// Checker
// =============================================================================

/// Background prober for one container.
///
/// Dropping the checker stops its task.
pub struct HealthChecker {
    name: String,
    config: Arc<HealthCheckConfig>,
    state: Arc<Mutex<HealthState>>,
    control: watch::Sender<Control>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("name", &self.name)
            .field("probe", &self.config.probe.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl HealthChecker {
    pub fn new(name: impl Into<String>, config: HealthCheckConfig) -> Self {
        let (control, _) = watch::channel(Control::Running);
        Self {
            name: name.into(),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(HealthState::default())),
            control,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    pub fn state(&self) -> HealthState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    /// Spawns the probe task. Calling it again is a no-op.
    pub fn start(
        &self,
        target: HealthTarget,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<(), HealthError> {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() || *self.control.borrow() == Control::Stopped {
            return Ok(());
        }

        let prober = Prober::new(&self.config, target, runtime)?;
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.started = true;
        }

        info!(
            container = %self.name,
            probe = self.config.probe.as_str(),
            initial_wait_ms = self.config.initial_wait.as_millis() as u64,
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting health checker"
        );

        *task = Some(tokio::spawn(run_checker(
            self.name.clone(),
            self.config.clone(),
            self.state.clone(),
            self.control.subscribe(),
            prober,
        )));
        Ok(())
    }

    /// Suspends probing; counters are kept.
    pub fn pause(&self) {
        self.set_control(Control::Paused);
    }

    pub fn resume(&self) {
        self.set_control(Control::Running);
    }

    /// Cancels the probe task. Safe while a probe is in flight.
    pub fn stop(&self) {
        self.control.send_replace(Control::Stopped);
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            task.abort();
            debug!(container = %self.name, "Health checker stopped");
        }
    }

    fn set_control(&self, next: Control) {
        self.control.send_if_modified(|current| {
            if *current == Control::Stopped || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_checker(
    name: String,
    config: Arc<HealthCheckConfig>,
    state: Arc<Mutex<HealthState>>,
    mut control: watch::Receiver<Control>,
    prober: Prober,
) {
    if !config.initial_wait.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(config.initial_wait) => {}
            _ = stopped(&mut control) => return,
        }
    }

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = *control.borrow();
                match current {
                    Control::Stopped => break,
                    Control::Paused => continue,
                    Control::Running => {}
                }

                let ok = tokio::select! {
                    ok = prober.probe(config.timeout) => ok,
                    _ = stopped(&mut control) => break,
                };

                let snapshot = {
                    let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
                    state.record(ok);
                    *state
                };

                if ok {
                    debug!(container = %name, ticks = snapshot.ticks, "Health probe passed");
                } else if snapshot.consecutive_failures >= config.max_consecutive_failures {
                    warn!(
                        container = %name,
                        consecutive_failures = snapshot.consecutive_failures,
                        failures = snapshot.failures,
                        "Health check failing"
                    );
                } else {
                    debug!(
                        container = %name,
                        consecutive_failures = snapshot.consecutive_failures,
                        "Health probe failed"
                    );
                }
            }
            changed = control.changed() => {
                if changed.is_err() || *control.borrow() == Control::Stopped {
                    break;
                }
            }
        }
    }
}

/// Resolves once the checker is told to stop (or the handle is gone).
async fn stopped(control: &mut watch::Receiver<Control>) {
    loop {
        if *control.borrow_and_update() == Control::Stopped {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}
