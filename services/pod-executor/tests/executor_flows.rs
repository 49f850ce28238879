//! End-to-end executor flows: driver, executor and pod wired together over
//! the mock transport, runtime and network backend.

use std::sync::Arc;
use std::time::Duration;

use podex_executor::driver::{DriverConfig, DriverError, DriverHandle, DriverStatus, MockTransport};
use podex_executor::executor::{Executor, ExecutorConfig, ExecutorState};
use podex_executor::metrics::NoopMetrics;
use podex_executor::runtime::{ContainerStatus, MockRuntime, RuntimeCall};
use podex_messages::MessageAck;
use podex_networking::{MockNetworkBackend, NetworkManager, MODE_CNI, MODE_CNM};
use podex_proto::{
    Event, FrameworkMessage, Kill, LaunchGroup, TaskGroupInfo, TaskState, TaskStatus,
};
use podex_testing::{executor_id, framework_id, TaskBuilder, TaskGroupBuilder};
use rstest::rstest;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(3);

struct Harness {
    runtime: Arc<MockRuntime>,
    backend: Arc<MockNetworkBackend>,
    transport: Arc<MockTransport>,
    executor: Executor,
    session: JoinHandle<Result<DriverStatus, DriverError>>,
}

impl Harness {
    fn start(mode: &str) -> Self {
        let runtime = Arc::new(MockRuntime::new());
        let backend = Arc::new(MockNetworkBackend::new(mode));
        let network = NetworkManager::new().with_backend(backend.clone());

        let mut config = ExecutorConfig::new(executor_id());
        config.network_mode = mode.to_string();
        config.watch_interval = Duration::from_millis(20);
        config.default_kill_timeout = Duration::from_secs(2);
        let executor = Executor::new(config, runtime.clone(), network, Arc::new(NoopMetrics));

        let transport = Arc::new(MockTransport::new());
        transport.auto_ack(true);
        let mut driver_config = DriverConfig::new(framework_id(), executor_id());
        driver_config.ack_wait = Duration::from_millis(500);
        driver_config.backoff_base = Duration::from_millis(10);
        driver_config.backoff_max = Duration::from_millis(20);
        let driver = DriverHandle::new(
            driver_config,
            transport.clone(),
            Arc::new(executor.clone()),
            Arc::new(NoopMetrics),
        );
        let session = tokio::spawn(async move { driver.run().await });

        Self {
            runtime,
            backend,
            transport,
            executor,
            session,
        }
    }

    fn launch(&self, task_group: TaskGroupInfo) {
        self.transport.push_event(Event::LaunchGroup {
            launch_group: LaunchGroup {
                executor: None,
                task_group,
            },
        });
    }

    async fn wait_for(&self, pred: impl Fn(&[TaskStatus]) -> bool) -> Vec<TaskStatus> {
        let updates = self.transport.wait_for_updates(WAIT, &pred).await;
        assert!(pred(&updates), "condition not reached; updates: {:#?}", states(&updates));
        updates
    }

    async fn wait_for_state(&self, state: ExecutorState) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.executor.state() != state {
            assert!(
                tokio::time::Instant::now() < deadline,
                "executor stuck in {:?}",
                self.executor.state()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn finished(self) -> Result<DriverStatus, DriverError> {
        tokio::time::timeout(WAIT, self.session)
            .await
            .expect("driver did not finish")
            .expect("driver task panicked")
    }
}

fn two_tasks() -> TaskGroupInfo {
    TaskGroupBuilder::new()
        .task(TaskBuilder::new("web"))
        .task(TaskBuilder::new("sidecar"))
        .build()
}

fn states(updates: &[TaskStatus]) -> Vec<(String, &'static str)> {
    updates
        .iter()
        .map(|u| (u.task_id.to_string(), u.state.as_str()))
        .collect()
}

fn count(updates: &[TaskStatus], state: TaskState) -> usize {
    updates.iter().filter(|u| u.state == state).count()
}

fn position(updates: &[TaskStatus], task: &str, state: TaskState) -> Option<usize> {
    updates
        .iter()
        .position(|u| u.task_id.as_str() == task && u.state == state)
}

#[rstest]
#[case::cni(MODE_CNI)]
#[case::cnm(MODE_CNM)]
#[tokio::test]
async fn test_launch_reports_starting_then_running(#[case] mode: &str) {
    let h = Harness::start(mode);
    h.launch(two_tasks());

    let updates = h.wait_for(|u| count(u, TaskState::Running) == 2).await;
    for task in ["web.task", "sidecar.task"] {
        let starting = position(&updates, task, TaskState::Starting).unwrap();
        let running = position(&updates, task, TaskState::Running).unwrap();
        assert!(starting < running, "{task}: {:?}", states(&updates));
    }

    let running = updates.iter().find(|u| u.state == TaskState::Running).unwrap();
    let data: serde_json::Value = serde_json::from_slice(running.data.as_ref().unwrap()).unwrap();
    assert_eq!(data["status"], "running");
    assert!(running.uuid.is_some());

    h.wait_for_state(ExecutorState::Running).await;
    assert_eq!(h.backend.set_up_calls().len(), 1);
    assert!(h.transport.updates().iter().all(|u| u.state != TaskState::Failed));
}

#[tokio::test]
async fn test_create_failure_fails_every_task() {
    let h = Harness::start(MODE_CNM);
    h.runtime.fail_create("-1-sidecar");
    h.launch(two_tasks());

    let updates = h.wait_for(|u| count(u, TaskState::Failed) == 2).await;
    assert_eq!(count(&updates, TaskState::Starting), 2);
    assert_eq!(count(&updates, TaskState::Running), 0);
    for failed in updates.iter().filter(|u| u.state == TaskState::Failed) {
        assert_eq!(failed.reason.as_deref(), Some("REASON_CONTAINER_LAUNCH_FAILED"));
        assert!(failed.message.as_deref().unwrap_or("").contains("sidecar"));
    }

    h.wait_for_state(ExecutorState::Shutdown).await;
    assert_eq!(h.backend.tear_down_calls().len(), 1);
    assert_eq!(h.runtime.live_containers(), 0);
    assert!(matches!(h.finished().await, Ok(DriverStatus::Stopped)));
}

#[tokio::test]
async fn test_task_without_image_is_an_error() {
    let h = Harness::start(MODE_CNM);
    h.launch(
        TaskGroupBuilder::new()
            .task(TaskBuilder::new("web").no_container())
            .build(),
    );

    let updates = h.wait_for(|u| count(u, TaskState::Error) == 1).await;
    assert_eq!(count(&updates, TaskState::Starting), 0);
    assert_eq!(h.runtime.call_count(|c| matches!(c, RuntimeCall::Create { .. })), 0);
    assert!(matches!(h.finished().await, Ok(DriverStatus::Stopped)));
}

#[rstest]
#[case::empty_group(TaskGroupBuilder::new().build())]
#[case::duplicate_task_id(
    TaskGroupBuilder::new()
        .task(TaskBuilder::new("web"))
        .task(TaskBuilder::new("web"))
        .build()
)]
#[tokio::test]
async fn test_malformed_group_aborts_driver(#[case] task_group: TaskGroupInfo) {
    let h = Harness::start(MODE_CNM);
    h.launch(task_group);

    let runtime = h.runtime.clone();
    let transport = h.transport.clone();
    assert!(matches!(h.finished().await, Err(DriverError::Aborted)));
    assert!(runtime.calls().is_empty());
    assert!(transport.updates().is_empty());
    assert!(transport.is_closed());
}

#[tokio::test]
async fn test_unknown_kill_reports_lost() {
    let h = Harness::start(MODE_CNM);
    h.transport.push_event(Event::Kill {
        kill: Kill {
            task_id: podex_id::TaskId::parse("ghost.task").unwrap(),
            kill_policy: None,
        },
    });

    let updates = h.wait_for(|u| count(u, TaskState::Lost) == 1).await;
    assert_eq!(updates[0].task_id.as_str(), "ghost.task");
    assert_eq!(h.executor.state(), ExecutorState::NotRunning);

    h.transport.push_event(Event::Shutdown);
    assert!(matches!(h.finished().await, Ok(DriverStatus::Stopped)));
}

#[rstest]
#[case::cni(MODE_CNI)]
#[case::cnm(MODE_CNM)]
#[tokio::test]
async fn test_member_exit_fails_group(#[case] mode: &str) {
    let h = Harness::start(mode);
    h.launch(two_tasks());
    h.wait_for(|u| count(u, TaskState::Running) == 2).await;

    h.runtime.set_status("-0-web", ContainerStatus::Exited, Some(3));
    let updates = h.wait_for(|u| count(u, TaskState::Failed) == 2).await;
    for failed in updates.iter().filter(|u| u.state == TaskState::Failed) {
        assert_eq!(failed.reason.as_deref(), Some("REASON_CONTAINER_TERMINATED"));
        assert!(failed.message.as_deref().unwrap_or("").contains("exited with code 3"));
    }
    assert_eq!(count(&updates, TaskState::Killed), 0);

    h.wait_for_state(ExecutorState::Shutdown).await;
    assert_eq!(h.backend.tear_down_calls().len(), 1);
    assert_eq!(h.runtime.live_containers(), 0);
    assert!(h.executor.xref().task_ids().is_empty());
    assert!(matches!(h.finished().await, Ok(DriverStatus::Stopped)));
}

#[tokio::test]
async fn test_clean_exit_finishes_group() {
    let h = Harness::start(MODE_CNM);
    h.launch(two_tasks());
    h.wait_for(|u| count(u, TaskState::Running) == 2).await;

    h.runtime.set_status("podex-", ContainerStatus::Exited, Some(0));
    let updates = h.wait_for(|u| count(u, TaskState::Finished) == 2).await;
    assert_eq!(count(&updates, TaskState::Failed), 0);
    assert!(matches!(h.finished().await, Ok(DriverStatus::Stopped)));
}

#[tokio::test]
async fn test_kill_stops_group_with_grace() {
    let h = Harness::start(MODE_CNM);
    h.launch(
        TaskGroupBuilder::new()
            .task(TaskBuilder::new("web"))
            .task(TaskBuilder::new("sidecar"))
            .build(),
    );
    h.wait_for(|u| count(u, TaskState::Running) == 2).await;

    h.transport.push_event(Event::Kill {
        kill: Kill {
            task_id: podex_id::TaskId::parse("web.task").unwrap(),
            kill_policy: TaskBuilder::new("x").kill_grace_secs(1).build().kill_policy,
        },
    });

    let updates = h.wait_for(|u| count(u, TaskState::Killed) == 2).await;
    assert_eq!(count(&updates, TaskState::Killing), 2);
    for task in ["web.task", "sidecar.task"] {
        let killing = position(&updates, task, TaskState::Killing).unwrap();
        let killed = position(&updates, task, TaskState::Killed).unwrap();
        assert!(killing < killed);
    }
    assert!(updates
        .iter()
        .filter(|u| u.state == TaskState::Killed)
        .all(|u| u.reason.as_deref() == Some("REASON_TASK_KILLED")));

    let stops: Vec<Duration> = h
        .runtime
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            RuntimeCall::Stop { timeout, .. } => Some(timeout),
            _ => None,
        })
        .collect();
    assert_eq!(stops, vec![Duration::from_secs(1); 2]);
    assert!(matches!(h.finished().await, Ok(DriverStatus::Stopped)));
}

#[tokio::test]
async fn test_second_group_is_dropped() {
    let h = Harness::start(MODE_CNM);
    h.launch(two_tasks());
    h.wait_for(|u| count(u, TaskState::Running) == 2).await;

    h.launch(
        TaskGroupBuilder::new()
            .task(TaskBuilder::new("late"))
            .build(),
    );
    let updates = h.wait_for(|u| count(u, TaskState::Dropped) == 1).await;
    let dropped = updates.iter().find(|u| u.state == TaskState::Dropped).unwrap();
    assert_eq!(dropped.task_id.as_str(), "late.task");
    assert_eq!(h.executor.state(), ExecutorState::Running);
    assert_eq!(h.runtime.live_containers(), 2);
}

#[tokio::test]
async fn test_framework_message_is_acknowledged() {
    let h = Harness::start(MODE_CNM);
    h.launch(two_tasks());
    h.wait_for(|u| count(u, TaskState::Running) == 2).await;
    h.wait_for_state(ExecutorState::Running).await;

    let data = br#"{"id":"m1","task_id":"web.task","kind":"local_file","dest":"/etc/motd","data":"aGk="}"#;
    h.transport.push_event(Event::Message {
        message: FrameworkMessage {
            data: data.to_vec(),
        },
    });

    let messages = h.transport.wait_for_messages(WAIT, |m| !m.is_empty()).await;
    assert_eq!(messages.len(), 1);
    let ack: MessageAck = serde_json::from_slice(&messages[0]).unwrap();
    assert_eq!(ack.id, "m1");
    assert!(ack.success, "{ack:?}");

    let uploads = h.runtime.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].1.dest, "/etc/motd");
    assert_eq!(uploads[0].1.data, b"hi");
}

#[tokio::test]
async fn test_disconnect_resubscribes_with_pending_updates() {
    let h = Harness::start(MODE_CNM);
    h.transport.auto_ack(false);
    h.launch(two_tasks());
    h.wait_for(|u| count(u, TaskState::Running) == 2).await;

    h.transport.drop_connection();
    let deadline = tokio::time::Instant::now() + WAIT;
    while h.transport.subscribe_count() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "no resubscribe");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let resubscribe = h
        .transport
        .calls()
        .into_iter()
        .filter_map(|c| match c.kind {
            podex_proto::CallKind::Subscribe { subscribe } => Some(subscribe),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(resubscribe.unacknowledged_updates.len(), 4);
    assert_eq!(h.executor.state(), ExecutorState::Running);
}
