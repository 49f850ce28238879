//! Fixture builders shared by the workspace's tests.
//!
//! ```ignore
//! let group = TaskGroupBuilder::new()
//!     .task(TaskBuilder::new("web").image("nginx").port(80))
//!     .build();
//! ```

use podex_id::{ExecutorId, FrameworkId, TaskId};
use podex_messages::{Message, ResourceLimits, TaskData};
use podex_proto::{
    CommandInfo, ContainerInfo, DockerInfo, HealthCheck, HealthCheckType, KillPolicy,
    DurationInfo, PortMapping, Range, Resource, TaskGroupInfo, TaskInfo, TcpCheckInfo,
};

/// Framework id used by fixtures.
pub fn framework_id() -> FrameworkId {
    FrameworkId::parse("framework-test").unwrap_or_else(|e| panic!("fixture id: {e}"))
}

/// Executor id used by fixtures.
pub fn executor_id() -> ExecutorId {
    ExecutorId::parse("executor-test").unwrap_or_else(|e| panic!("fixture id: {e}"))
}

/// Builds a `TaskInfo` with sensible defaults (image `busybox`, 0.1 cpus, 32 MB).
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    task: TaskInfo,
    data: Option<TaskData>,
}

impl TaskBuilder {
    pub fn new(name: &str) -> Self {
        let task_id = TaskId::parse(&format!("{name}.task"))
            .unwrap_or_else(|e| panic!("fixture task id: {e}"));
        Self {
            task: TaskInfo {
                name: name.to_string(),
                task_id,
                agent_id: None,
                resources: vec![Resource::scalar("cpus", 0.1), Resource::scalar("mem", 32.0)],
                command: None,
                container: Some(ContainerInfo {
                    docker: Some(DockerInfo {
                        image: "busybox".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                health_check: None,
                kill_policy: None,
                data: None,
                labels: vec![],
            },
            data: None,
        }
    }

    pub fn task_id(mut self, id: &str) -> Self {
        self.task.task_id = TaskId::parse(id).unwrap_or_else(|e| panic!("fixture task id: {e}"));
        self
    }

    pub fn image(mut self, image: &str) -> Self {
        self.docker_mut().image = image.to_string();
        self
    }

    /// Drops the container section entirely.
    pub fn no_container(mut self) -> Self {
        self.task.container = None;
        self
    }

    pub fn shell(mut self, cmd: &str) -> Self {
        self.task.command = Some(CommandInfo {
            shell: Some(true),
            value: Some(cmd.to_string()),
            ..Default::default()
        });
        self
    }

    pub fn argv(mut self, value: &str, args: &[&str]) -> Self {
        self.task.command = Some(CommandInfo {
            shell: Some(false),
            value: Some(value.to_string()),
            arguments: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        });
        self
    }

    /// Adds a port mapping with `host_port` 0 (taken from offered ports).
    pub fn port(mut self, container_port: u32) -> Self {
        self.docker_mut().port_mappings.push(PortMapping {
            host_port: 0,
            container_port,
            protocol: Some("tcp".to_string()),
        });
        self
    }

    pub fn offered_ports(mut self, begin: u64, end: u64) -> Self {
        self.task
            .resources
            .push(Resource::ranges("ports", vec![Range { begin, end }]));
        self
    }

    pub fn tcp_check(mut self, port: u32) -> Self {
        self.task.health_check = Some(HealthCheck {
            kind: HealthCheckType::Tcp,
            delay_seconds: 0.0,
            interval_seconds: 1.0,
            timeout_seconds: 0.5,
            consecutive_failures: 3,
            grace_period_seconds: 0.0,
            http: None,
            tcp: Some(TcpCheckInfo { port }),
            command: None,
        });
        self
    }

    pub fn kill_grace_secs(mut self, secs: i64) -> Self {
        self.task.kill_policy = Some(KillPolicy {
            grace_period: Some(DurationInfo {
                nanoseconds: secs.saturating_mul(1_000_000_000),
            }),
        });
        self
    }

    pub fn message(mut self, message: Message) -> Self {
        self.data.get_or_insert_with(TaskData::default).messages.push(message);
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.data.get_or_insert_with(TaskData::default).resources = limits;
        self
    }

    /// Raw custom data, bypassing `TaskData` encoding.
    pub fn raw_data(mut self, data: &[u8]) -> Self {
        self.data = None;
        self.task.data = Some(data.to_vec());
        self
    }

    pub fn build(mut self) -> TaskInfo {
        if let Some(data) = self.data.take() {
            self.task.data =
                Some(serde_json::to_vec(&data).unwrap_or_else(|e| panic!("fixture data: {e}")));
        }
        self.task
    }

    fn docker_mut(&mut self) -> &mut DockerInfo {
        self.task
            .container
            .get_or_insert_with(ContainerInfo::default)
            .docker
            .get_or_insert_with(DockerInfo::default)
    }
}

/// Builds a `TaskGroupInfo`.
#[derive(Debug, Clone, Default)]
pub struct TaskGroupBuilder {
    tasks: Vec<TaskInfo>,
}

impl TaskGroupBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(mut self, task: TaskBuilder) -> Self {
        self.tasks.push(task.build());
        self
    }

    pub fn build(self) -> TaskGroupInfo {
        TaskGroupInfo { tasks: self.tasks }
    }
}

/// A one-task group running `image`.
pub fn single_task_group(name: &str, image: &str) -> TaskGroupInfo {
    TaskGroupBuilder::new()
        .task(TaskBuilder::new(name).image(image))
        .build()
}
