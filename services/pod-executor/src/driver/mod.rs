//! Executor driver: the session with the control-plane agent.
//!
//! Owns the subscription, dispatches inbound events to an
//! [`ExecutorHandler`], and tracks outbound status updates until the agent
//! acknowledges them. A dropped connection is re-subscribed with every
//! unacknowledged task and update, with exponential backoff bounded by the
//! recovery timeout; running past that bound aborts the driver.
//!
//! ```text
//! NOT_STARTED ──run──> RUNNING ──stop──> STOPPED
//!                         └──abort / recovery timeout──> ABORTED
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use podex_id::{ExecutorId, FrameworkId, TaskId};
use podex_proto::{
    Acknowledged, Call, Event, KillPolicy, Subscribe, Subscribed, TaskGroupInfo, TaskInfo,
    TaskState, TaskStatus, Update,
};
use podex_reconcile::{BackoffPolicy, RetryDeadline};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::metrics::MetricsSink;

pub mod transport;

pub use transport::{EventStream, HttpTransport, MockTransport, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    NotStarted,
    Running,
    Stopped,
    Aborted,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver is not running ({0:?})")]
    NotRunning(DriverStatus),

    #[error("{0} updates are never sent by an executor")]
    InvalidState(&'static str),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("driver aborted")]
    Aborted,
}

/// The driver as seen by the executor.
#[async_trait]
pub trait ExecutorDriver: Send + Sync {
    /// Stamps and sends a status update; it stays pending until acknowledged.
    async fn send_status_update(&self, status: TaskStatus) -> Result<(), DriverError>;

    async fn send_framework_message(&self, data: Vec<u8>) -> Result<(), DriverError>;

    /// Waits a bounded time for pending acknowledgements, then stops.
    async fn stop(&self) -> DriverStatus;

    async fn abort(&self) -> DriverStatus;

    fn status(&self) -> DriverStatus;
}

/// Callbacks for inbound events. Called from the event loop, so
/// long-running work must be spawned.
#[async_trait]
pub trait ExecutorHandler: Send + Sync {
    async fn registered(&self, driver: Arc<dyn ExecutorDriver>, subscribed: Subscribed);

    async fn disconnected(&self, driver: Arc<dyn ExecutorDriver>);

    /// A single task is launched as a group of one.
    async fn launch_task(&self, driver: Arc<dyn ExecutorDriver>, task: TaskInfo) {
        self.launch_task_group(driver, TaskGroupInfo { tasks: vec![task] })
            .await;
    }

    async fn launch_task_group(&self, driver: Arc<dyn ExecutorDriver>, group: TaskGroupInfo);

    async fn kill_task(
        &self,
        driver: Arc<dyn ExecutorDriver>,
        task_id: TaskId,
        kill_policy: Option<KillPolicy>,
    );

    async fn framework_message(&self, driver: Arc<dyn ExecutorDriver>, data: Vec<u8>);

    async fn shutdown(&self, driver: Arc<dyn ExecutorDriver>);

    async fn error(&self, driver: Arc<dyn ExecutorDriver>, message: String);
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    /// How long `stop` waits for outstanding acknowledgements.
    pub ack_wait: Duration,
    /// First reconnect delay.
    pub backoff_base: Duration,
    /// Reconnect delay cap.
    pub backoff_max: Duration,
    /// Give-up bound for one disconnected period.
    pub recovery_timeout: Duration,
}

impl DriverConfig {
    pub fn new(framework_id: FrameworkId, executor_id: ExecutorId) -> Self {
        Self {
            framework_id,
            executor_id,
            ack_wait: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(2),
            recovery_timeout: Duration::from_secs(900),
        }
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.backoff_base,
            max: self.backoff_max.max(self.backoff_base),
        }
    }
}

#[derive(Debug, Default)]
struct Pending {
    /// Keyed by uuid; v7 uuids sort in send order.
    updates: BTreeMap<String, Update>,
    /// Launched tasks the agent has not acknowledged an update for.
    tasks: BTreeMap<TaskId, TaskInfo>,
    connected: bool,
}

struct Shared {
    config: DriverConfig,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn ExecutorHandler>,
    metrics: Arc<dyn MetricsSink>,
    pending: Mutex<Pending>,
    acked: Notify,
    control: watch::Sender<DriverStatus>,
}

/// Concrete [`ExecutorDriver`]; cheap to clone.
#[derive(Clone)]
pub struct DriverHandle {
    shared: Arc<Shared>,
}

impl DriverHandle {
    pub fn new(
        config: DriverConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn ExecutorHandler>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (control, _) = watch::channel(DriverStatus::NotStarted);
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                handler,
                metrics,
                pending: Mutex::new(Pending::default()),
                acked: Notify::new(),
                control,
            }),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.pending().connected
    }

    /// Updates sent but not yet acknowledged, oldest first.
    pub fn unacknowledged_updates(&self) -> Vec<Update> {
        self.pending().updates.values().cloned().collect()
    }

    fn subscribe_call(&self) -> Call {
        let pending = self.pending();
        Call::subscribe(
            self.shared.config.framework_id.clone(),
            self.shared.config.executor_id.clone(),
            Subscribe {
                unacknowledged_tasks: pending.tasks.values().cloned().collect(),
                unacknowledged_updates: pending.updates.values().cloned().collect(),
            },
        )
    }

    fn finished(&self) -> Option<Result<DriverStatus, DriverError>> {
        match *self.shared.control.borrow() {
            DriverStatus::Stopped => Some(Ok(DriverStatus::Stopped)),
            DriverStatus::Aborted => Some(Err(DriverError::Aborted)),
            _ => None,
        }
    }

    fn ensure_running(&self) -> Result<(), DriverError> {
        match self.status() {
            DriverStatus::Running => Ok(()),
            other => Err(DriverError::NotRunning(other)),
        }
    }

    fn set_terminal(&self, status: DriverStatus) -> DriverStatus {
        let mut previous = status;
        self.shared.control.send_if_modified(|current| {
            previous = *current;
            if matches!(*current, DriverStatus::Stopped | DriverStatus::Aborted) {
                return false;
            }
            *current = status;
            true
        });
        if matches!(previous, DriverStatus::Stopped | DriverStatus::Aborted) {
            previous
        } else {
            status
        }
    }

    /// Runs the session until stopped or aborted.
    pub async fn run(&self) -> Result<DriverStatus, DriverError> {
        let started = self.shared.control.send_if_modified(|status| {
            if *status == DriverStatus::NotStarted {
                *status = DriverStatus::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return self.finished().unwrap_or(Err(DriverError::NotRunning(self.status())));
        }

        let mut control = self.shared.control.subscribe();
        let driver: Arc<dyn ExecutorDriver> = Arc::new(self.clone());
        let policy = self.shared.config.backoff();
        let mut attempt: u32 = 0;
        let mut deadline: Option<RetryDeadline> = None;

        loop {
            if let Some(result) = self.finished() {
                return result;
            }

            match self.shared.transport.subscribe(&self.subscribe_call()).await {
                Ok(mut events) => {
                    loop {
                        tokio::select! {
                            _ = control.changed() => {
                                if let Some(result) = self.finished() {
                                    return result;
                                }
                            }
                            next = events.next() => match next {
                                Some(Ok(event)) => {
                                    if matches!(event, Event::Subscribed { .. }) {
                                        attempt = 0;
                                        deadline = None;
                                    }
                                    self.dispatch(&driver, event).await;
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "Subscription stream failed");
                                    break;
                                }
                                None => break,
                            },
                        }
                    }

                    if let Some(result) = self.finished() {
                        return result;
                    }
                    self.pending().connected = false;
                    warn!("Disconnected from agent");
                    self.shared.handler.disconnected(driver.clone()).await;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Subscribe failed");
                }
            }

            let bound = *deadline
                .get_or_insert_with(|| RetryDeadline::new(self.shared.config.recovery_timeout));
            if bound.is_expired() {
                error!(
                    recovery_timeout_secs = self.shared.config.recovery_timeout.as_secs(),
                    "Agent unreachable past the recovery timeout, aborting"
                );
                self.abort().await;
                return Err(DriverError::Aborted);
            }

            let delay = policy.delay(attempt).min(bound.remaining());
            attempt = attempt.saturating_add(1);
            self.shared
                .metrics
                .incr_counter("driver_reconnect_attempts_total", &[]);
            debug!(delay_ms = delay.as_millis() as u64, attempt, "Reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = control.changed() => {}
            }
        }
    }

    async fn dispatch(&self, driver: &Arc<dyn ExecutorDriver>, event: Event) {
        let kind = event.kind();
        self.shared
            .metrics
            .incr_counter("driver_events_total", &[("type", kind)]);
        let handler = &self.shared.handler;

        match event {
            Event::Subscribed { subscribed } => {
                self.pending().connected = true;
                info!(
                    executor_id = %subscribed.executor_info.executor_id,
                    agent_id = ?subscribed.agent_id.as_ref().map(|a| a.to_string()),
                    "Subscribed"
                );
                handler.registered(driver.clone(), subscribed).await;
            }
            Event::Launch { launch } => {
                self.track(std::slice::from_ref(&launch.task));
                handler.launch_task(driver.clone(), launch.task).await;
            }
            Event::LaunchGroup { launch_group } => {
                self.track(&launch_group.task_group.tasks);
                handler
                    .launch_task_group(driver.clone(), launch_group.task_group)
                    .await;
            }
            Event::Kill { kill } => {
                handler
                    .kill_task(driver.clone(), kill.task_id, kill.kill_policy)
                    .await;
            }
            Event::Acknowledged { acknowledged } => self.acknowledge(&acknowledged),
            Event::Message { message } => {
                handler.framework_message(driver.clone(), message.data).await;
            }
            Event::Shutdown => handler.shutdown(driver.clone()).await,
            Event::Error { error } => {
                error!(message = %error.message, "Agent reported an error");
                handler.error(driver.clone(), error.message).await;
            }
            Event::Heartbeat => trace!("Heartbeat"),
            Event::Unknown => debug!("Ignoring unknown event"),
        }
    }

    fn track(&self, tasks: &[TaskInfo]) {
        let mut pending = self.pending();
        for task in tasks {
            pending.tasks.insert(task.task_id.clone(), task.clone());
        }
    }

    fn acknowledge(&self, ack: &Acknowledged) {
        let removed = {
            let mut pending = self.pending();
            pending.tasks.remove(&ack.task_id);
            pending.updates.remove(&ack.uuid)
        };
        match removed {
            Some(update) => {
                debug!(
                    task_id = %ack.task_id,
                    state = update.status.state.as_str(),
                    "Update acknowledged"
                );
                self.shared.acked.notify_waiters();
            }
            None => debug!(task_id = %ack.task_id, uuid = %ack.uuid, "Unknown acknowledgement"),
        }
    }

    async fn wait_for_acks(&self) -> bool {
        let wait = async {
            loop {
                let notified = self.shared.acked.notified();
                if self.pending().updates.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(self.shared.config.ack_wait, wait)
            .await
            .is_ok()
    }
}

#[async_trait]
impl ExecutorDriver for DriverHandle {
    async fn send_status_update(&self, mut status: TaskStatus) -> Result<(), DriverError> {
        self.ensure_running()?;
        if status.state == TaskState::Staging {
            return Err(DriverError::InvalidState(status.state.as_str()));
        }

        let uuid = Uuid::now_v7().to_string();
        status.uuid = Some(uuid.clone());
        status.timestamp = Some(Utc::now().timestamp_micros() as f64 / 1_000_000.0);
        status.executor_id = Some(self.shared.config.executor_id.clone());
        self.pending().updates.insert(
            uuid.clone(),
            Update {
                status: status.clone(),
            },
        );

        self.shared.metrics.incr_counter(
            "driver_status_updates_total",
            &[("state", status.state.as_str())],
        );
        info!(
            task_id = %status.task_id,
            state = status.state.as_str(),
            uuid = %uuid,
            healthy = ?status.healthy,
            "Sending status update"
        );

        let call = Call::update(
            self.shared.config.framework_id.clone(),
            self.shared.config.executor_id.clone(),
            status,
        );
        // Unsent updates stay pending and go out with the next subscribe.
        self.shared.transport.send(&call).await.map_err(|e| {
            warn!(error = %e, uuid = %uuid, "Status update not delivered");
            DriverError::from(e)
        })
    }

    async fn send_framework_message(&self, data: Vec<u8>) -> Result<(), DriverError> {
        self.ensure_running()?;
        let call = Call::message(
            self.shared.config.framework_id.clone(),
            self.shared.config.executor_id.clone(),
            data,
        );
        self.shared.transport.send(&call).await?;
        Ok(())
    }

    async fn stop(&self) -> DriverStatus {
        if self.status() != DriverStatus::Running {
            return self.status();
        }
        // Acks only arrive over a live subscription.
        if !self.is_connected() {
            let pending = self.pending().updates.len();
            if pending > 0 {
                warn!(pending, "Stopping while disconnected with unacknowledged updates");
            }
        } else if !self.wait_for_acks().await {
            warn!(
                pending = self.pending().updates.len(),
                "Stopping with unacknowledged updates"
            );
        }
        let status = self.set_terminal(DriverStatus::Stopped);
        self.shared.transport.close().await;
        info!(status = ?status, "Driver stopped");
        status
    }

    async fn abort(&self) -> DriverStatus {
        let status = self.set_terminal(DriverStatus::Aborted);
        self.shared.transport.close().await;
        warn!(status = ?status, "Driver aborted");
        status
    }

    fn status(&self) -> DriverStatus {
        *self.shared.control.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use podex_proto::{CallKind, Kill, LaunchGroup};
    use podex_testing::{executor_id, framework_id, single_task_group};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: &str) {
            self.events.lock().unwrap().push(event.to_string());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExecutorHandler for Recorder {
        async fn registered(&self, _driver: Arc<dyn ExecutorDriver>, _subscribed: Subscribed) {
            self.push("registered");
        }

        async fn disconnected(&self, _driver: Arc<dyn ExecutorDriver>) {
            self.push("disconnected");
        }

        async fn launch_task_group(&self, _driver: Arc<dyn ExecutorDriver>, group: TaskGroupInfo) {
            self.push(&format!("launch:{}", group.tasks.len()));
        }

        async fn kill_task(
            &self,
            _driver: Arc<dyn ExecutorDriver>,
            task_id: TaskId,
            _kill_policy: Option<KillPolicy>,
        ) {
            self.push(&format!("kill:{task_id}"));
        }

        async fn framework_message(&self, _driver: Arc<dyn ExecutorDriver>, _data: Vec<u8>) {
            self.push("message");
        }

        async fn shutdown(&self, driver: Arc<dyn ExecutorDriver>) {
            self.push("shutdown");
            driver.stop().await;
        }

        async fn error(&self, driver: Arc<dyn ExecutorDriver>, _message: String) {
            self.push("error");
            driver.abort().await;
        }
    }

    fn config() -> DriverConfig {
        DriverConfig {
            ack_wait: Duration::from_millis(200),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(20),
            recovery_timeout: Duration::from_secs(5),
            ..DriverConfig::new(framework_id(), executor_id())
        }
    }

    fn driver(transport: &Arc<MockTransport>, handler: &Arc<Recorder>, config: DriverConfig) -> DriverHandle {
        DriverHandle::new(
            config,
            transport.clone(),
            handler.clone(),
            Arc::new(NoopMetrics),
        )
    }

    async fn wait_until(pred: impl Fn() -> bool) {
        for _ in 0..200 {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_dispatch_and_shutdown() {
        let transport = Arc::new(MockTransport::new());
        let handler = Arc::new(Recorder::default());
        let driver = driver(&transport, &handler, config());

        transport.push_event(Event::LaunchGroup {
            launch_group: LaunchGroup {
                executor: None,
                task_group: single_task_group("web", "nginx"),
            },
        });
        transport.push_event(Event::Kill {
            kill: Kill {
                task_id: TaskId::parse("web.task").unwrap(),
                kill_policy: None,
            },
        });
        transport.push_event(Event::Heartbeat);
        transport.push_event(Event::Shutdown);

        let result = tokio::time::timeout(Duration::from_secs(5), driver.run())
            .await
            .unwrap();
        assert_eq!(result.unwrap(), DriverStatus::Stopped);
        assert_eq!(
            handler.events(),
            vec!["registered", "launch:1", "kill:web.task", "shutdown"]
        );
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_updates_are_stamped_and_acknowledged() {
        let transport = Arc::new(MockTransport::new());
        transport.auto_ack(true);
        let handler = Arc::new(Recorder::default());
        let driver = driver(&transport, &handler, config());

        let runner = tokio::spawn({
            let driver = driver.clone();
            async move { driver.run().await }
        });
        wait_until(|| driver.is_connected()).await;

        let task_id = TaskId::parse("web.task").unwrap();
        driver
            .send_status_update(TaskStatus::new(task_id.clone(), TaskState::Running))
            .await
            .unwrap();
        let err = driver
            .send_status_update(TaskStatus::new(task_id.clone(), TaskState::Staging))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidState(_)));

        wait_until(|| driver.unacknowledged_updates().is_empty()).await;
        let sent = transport.updates();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].uuid.is_some());
        assert!(sent[0].timestamp.is_some());
        assert_eq!(sent[0].executor_id, Some(executor_id()));

        assert_eq!(driver.stop().await, DriverStatus::Stopped);
        assert_eq!(runner.await.unwrap().unwrap(), DriverStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_waits_bounded_for_acks() {
        let transport = Arc::new(MockTransport::new());
        let handler = Arc::new(Recorder::default());
        let driver = driver(&transport, &handler, config());

        let runner = tokio::spawn({
            let driver = driver.clone();
            async move { driver.run().await }
        });
        wait_until(|| driver.is_connected()).await;

        driver
            .send_status_update(TaskStatus::new(
                TaskId::parse("web.task").unwrap(),
                TaskState::Running,
            ))
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(driver.stop().await, DriverStatus::Stopped);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(driver.unacknowledged_updates().len(), 1);
        assert_eq!(runner.await.unwrap().unwrap(), DriverStatus::Stopped);
    }

    #[tokio::test]
    async fn test_reconnect_carries_unacknowledged_updates() {
        let transport = Arc::new(MockTransport::new());
        let handler = Arc::new(Recorder::default());
        let driver = driver(&transport, &handler, config());

        let runner = tokio::spawn({
            let driver = driver.clone();
            async move { driver.run().await }
        });
        wait_until(|| driver.is_connected()).await;

        driver
            .send_status_update(TaskStatus::new(
                TaskId::parse("web.task").unwrap(),
                TaskState::Running,
            ))
            .await
            .unwrap();

        transport.fail_subscribes(2);
        transport.drop_connection();
        wait_until(|| transport.subscribe_count() >= 4 && driver.is_connected()).await;

        assert_eq!(last_subscribe(&transport).unacknowledged_updates.len(), 1);
        assert!(handler.events().contains(&"disconnected".to_string()));

        driver.abort().await;
        assert!(matches!(runner.await.unwrap(), Err(DriverError::Aborted)));
    }

    fn last_subscribe(transport: &MockTransport) -> Subscribe {
        transport
            .calls()
            .into_iter()
            .filter_map(|c| match c.kind {
                CallKind::Subscribe { subscribe } => Some(subscribe),
                _ => None,
            })
            .last()
            .unwrap()
    }

    #[tokio::test]
    async fn test_tasks_stay_unacknowledged_until_ack() {
        let transport = Arc::new(MockTransport::new());
        let handler = Arc::new(Recorder::default());
        let driver = driver(&transport, &handler, config());
        transport.push_event(Event::LaunchGroup {
            launch_group: LaunchGroup {
                executor: None,
                task_group: single_task_group("web", "nginx"),
            },
        });

        let runner = tokio::spawn({
            let driver = driver.clone();
            async move { driver.run().await }
        });
        wait_until(|| handler.events().contains(&"launch:1".to_string())).await;

        let task_id = TaskId::parse("web.task").unwrap();
        driver
            .send_status_update(TaskStatus::new(task_id.clone(), TaskState::Starting))
            .await
            .unwrap();

        // Sent but unacknowledged: both the task and the update are replayed.
        transport.drop_connection();
        wait_until(|| transport.subscribe_count() >= 2 && driver.is_connected()).await;
        let resubscribe = last_subscribe(&transport);
        assert_eq!(resubscribe.unacknowledged_tasks.len(), 1);
        assert_eq!(resubscribe.unacknowledged_tasks[0].task_id, task_id);
        assert_eq!(resubscribe.unacknowledged_updates.len(), 1);

        let uuid = resubscribe.unacknowledged_updates[0]
            .status
            .uuid
            .clone()
            .unwrap();
        transport.push_event(Event::Acknowledged {
            acknowledged: Acknowledged {
                task_id: task_id.clone(),
                uuid,
            },
        });
        wait_until(|| driver.unacknowledged_updates().is_empty()).await;

        transport.drop_connection();
        wait_until(|| transport.subscribe_count() >= 3 && driver.is_connected()).await;
        let resubscribe = last_subscribe(&transport);
        assert!(resubscribe.unacknowledged_tasks.is_empty());
        assert!(resubscribe.unacknowledged_updates.is_empty());

        driver.abort().await;
        assert!(matches!(runner.await.unwrap(), Err(DriverError::Aborted)));
    }

    #[tokio::test]
    async fn test_stop_while_disconnected_skips_ack_wait() {
        let transport = Arc::new(MockTransport::new());
        let handler = Arc::new(Recorder::default());
        let driver = driver(
            &transport,
            &handler,
            DriverConfig {
                ack_wait: Duration::from_secs(2),
                ..config()
            },
        );

        let runner = tokio::spawn({
            let driver = driver.clone();
            async move { driver.run().await }
        });
        wait_until(|| driver.is_connected()).await;

        driver
            .send_status_update(TaskStatus::new(
                TaskId::parse("web.task").unwrap(),
                TaskState::Running,
            ))
            .await
            .unwrap();

        transport.fail_subscribes(u32::MAX);
        transport.drop_connection();
        wait_until(|| !driver.is_connected()).await;

        let started = tokio::time::Instant::now();
        assert_eq!(driver.stop().await, DriverStatus::Stopped);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(driver.unacknowledged_updates().len(), 1);
        assert_eq!(runner.await.unwrap().unwrap(), DriverStatus::Stopped);
    }

    #[tokio::test]
    async fn test_recovery_timeout_aborts() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_subscribes(u32::MAX);
        let handler = Arc::new(Recorder::default());
        let driver = driver(
            &transport,
            &handler,
            DriverConfig {
                recovery_timeout: Duration::from_millis(100),
                ..config()
            },
        );

        let result = tokio::time::timeout(Duration::from_secs(5), driver.run())
            .await
            .unwrap();
        assert!(matches!(result, Err(DriverError::Aborted)));
        assert_eq!(driver.status(), DriverStatus::Aborted);
        assert!(transport.subscribe_count() > 1);
    }

    #[tokio::test]
    async fn test_error_event_aborts() {
        let transport = Arc::new(MockTransport::new());
        let handler = Arc::new(Recorder::default());
        let driver = driver(&transport, &handler, config());
        transport.push_event(Event::Error {
            error: podex_proto::ErrorEvent {
                message: "framework removed".to_string(),
            },
        });

        let result = tokio::time::timeout(Duration::from_secs(5), driver.run())
            .await
            .unwrap();
        assert!(matches!(result, Err(DriverError::Aborted)));
        assert_eq!(handler.events(), vec!["registered", "error"]);
    }

    #[tokio::test]
    async fn test_send_before_run_is_rejected() {
        let transport = Arc::new(MockTransport::new());
        let handler = Arc::new(Recorder::default());
        let driver = driver(&transport, &handler, config());
        let err = driver
            .send_framework_message(b"hi".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::NotRunning(DriverStatus::NotStarted)));
    }
}
