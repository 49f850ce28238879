//! Task descriptor -> container task spec.
//!
//! Translation is pure: anything that needs I/O (remote files, remote env,
//! extended resources) is collected into the [`LaunchPlan`] and resolved by
//! the executor before the pod is built.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use podex_id::{ExecutorId, PodId};
use podex_messages::{
    ExtendedResourceRequest, Message, RemoteFile, SecretTarget, TaskData,
};
use podex_proto::{KillPolicy, TaskInfo, VolumeMode};
use tracing::debug;

use super::error::ExecutorError;
use crate::health::{command_argv, HealthCheckConfig};
use crate::runtime::{PortBinding, ResourceSpec, UploadFile};
use crate::task::ContainerTaskSpec;

pub const LABEL_POD_ID: &str = "podex.pod_id";
pub const LABEL_TASK_ID: &str = "podex.task_id";
pub const LABEL_EXECUTOR_ID: &str = "podex.executor_id";

/// Secret files default to owner-read-only.
const SECRET_FILE_MODE: u32 = 0o400;

/// Pod-wide inputs to translation.
#[derive(Debug, Clone)]
pub struct TranslateContext {
    pub pod_id: PodId,
    pub executor_id: ExecutorId,
    pub default_kill_timeout: Duration,
}

/// A container spec plus the side effects still to resolve.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub spec: ContainerTaskSpec,
    pub remote_files: Vec<RemoteFile>,
    pub remote_env: Vec<String>,
    pub extended: Vec<ExtendedResourceRequest>,
    /// Command env overlaid with inline env.
    base_env: BTreeMap<String, String>,
    secret_env: BTreeMap<String, String>,
}

impl LaunchPlan {
    /// Layers the environment: command/inline env, then remote env, then
    /// secrets, then extended-resource env. Later layers win.
    pub fn finalize(
        &mut self,
        remote_env: BTreeMap<String, String>,
        allocation_env: &BTreeMap<String, String>,
        devices: &[String],
    ) {
        let mut env = std::mem::take(&mut self.base_env);
        env.extend(remote_env);
        env.extend(std::mem::take(&mut self.secret_env));
        env.extend(allocation_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.spec.env = env;
        self.spec.devices.extend(devices.iter().cloned());
    }
}

/// `podex-{pod}-{index}-{task}` restricted to `[a-zA-Z0-9_.-]`.
pub fn container_name(pod_id: &PodId, index: usize, task_name: &str) -> String {
    let task: String = task_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let task = if task.is_empty() { "task".to_string() } else { task };
    format!("podex-{pod_id}-{index}-{task}")
}

pub fn translate(
    ctx: &TranslateContext,
    index: usize,
    task: &TaskInfo,
) -> Result<LaunchPlan, ExecutorError> {
    let task_id = &task.task_id;
    let image = task
        .image()
        .ok_or_else(|| ExecutorError::invalid(task_id, "no container image"))?;

    let data = match &task.data {
        Some(raw) => TaskData::decode(raw).map_err(|source| ExecutorError::TaskData {
            task_id: task_id.to_string(),
            source,
        })?,
        None => TaskData::default(),
    };

    let name = container_name(&ctx.pod_id, index, &task.name);
    let mut spec = ContainerTaskSpec::new(task_id.clone(), &task.name, &name, image)
        .with_resources(resources(task, &data));

    if let Some(command) = &task.command {
        spec.command = command_argv(command);
    }

    let container = task.container.as_ref();
    if let Some(docker) = container.and_then(|c| c.docker.as_ref()) {
        spec.privileged = docker.privileged;
        spec.force_pull = docker.force_pull_image;
        spec.port_mappings = port_bindings(task)?;
        for param in &docker.parameters {
            debug!(task_id = %task_id, key = %param.key, "Ignoring runtime parameter");
        }
    }
    if let Some(container) = container {
        spec.hostname = container.hostname.clone();
        spec.volumes = container
            .volumes
            .iter()
            .map(|v| {
                let ro = if v.mode == VolumeMode::Ro { ":ro" } else { "" };
                match &v.host_path {
                    Some(host) => format!("{host}:{}{ro}", v.container_path),
                    None => v.container_path.clone(),
                }
            })
            .collect();
    }

    spec.kill_timeout = task
        .kill_policy
        .as_ref()
        .and_then(KillPolicy::grace)
        .unwrap_or(ctx.default_kill_timeout);

    if let Some(check) = &task.health_check {
        let config =
            HealthCheckConfig::from_proto(check).map_err(|source| ExecutorError::HealthCheck {
                task_id: task_id.to_string(),
                source,
            })?;
        spec.health_check = Some(config);
    }

    for label in &task.labels {
        spec.labels
            .insert(label.key.clone(), label.value.clone().unwrap_or_default());
    }
    spec.labels
        .insert(LABEL_POD_ID.to_string(), ctx.pod_id.to_string());
    spec.labels
        .insert(LABEL_TASK_ID.to_string(), task_id.to_string());
    spec.labels
        .insert(LABEL_EXECUTOR_ID.to_string(), ctx.executor_id.to_string());

    let mut base_env: BTreeMap<String, String> = task
        .command
        .as_ref()
        .and_then(|c| c.environment.as_ref())
        .map(|e| {
            e.variables
                .iter()
                .map(|v| (v.name.clone(), v.value.clone()))
                .collect()
        })
        .unwrap_or_default();

    let mut plan_remote_files = Vec::new();
    let mut remote_env = Vec::new();
    let mut extended = Vec::new();
    let mut secret_env = BTreeMap::new();
    let data_err = |source| ExecutorError::TaskData {
        task_id: task_id.to_string(),
        source,
    };

    for message in data.messages {
        match message {
            Message::LocalFile(file) => spec.files.push(UploadFile {
                data: file.decode().map_err(data_err)?,
                mode: file.file_mode(),
                dest: file.dest,
                user: file.user,
            }),
            Message::RemoteFile(file) => plan_remote_files.push(file),
            Message::RemoteEnv(env) => remote_env.push(env.url),
            Message::InlineSecret(secret) => match &secret.target {
                SecretTarget::Env { name } => {
                    secret_env.insert(name.clone(), secret.decode_string().map_err(data_err)?);
                }
                SecretTarget::File { dest, mode } => spec.files.push(UploadFile {
                    dest: dest.clone(),
                    data: secret.decode().map_err(data_err)?,
                    mode: mode.unwrap_or(SECRET_FILE_MODE) & 0o7777,
                    user: None,
                }),
            },
            Message::InlineEnv(env) => base_env.extend(env.vars),
            Message::ExtendedResource(request) => extended.push(request),
            // Runtime-only kinds are rejected by `TaskData::decode`.
            other => {
                return Err(ExecutorError::invalid(
                    task_id,
                    format!("{} is not allowed at launch", other.kind()),
                ))
            }
        }
    }

    Ok(LaunchPlan {
        spec,
        remote_files: plan_remote_files,
        remote_env,
        extended,
        base_env,
        secret_env,
    })
}

/// `cpus`/`mem` scalars, overridden by the custom data limits.
fn resources(task: &TaskInfo, data: &TaskData) -> ResourceSpec {
    let limits = data.resources;
    ResourceSpec {
        cpus: limits.cpus.or_else(|| task.scalar("cpus")),
        memory_mb: limits
            .memory_mb
            .or_else(|| task.scalar("mem").map(|mb| mb.max(0.0).round() as u64)),
        cpu_shares: limits.cpu_shares,
    }
}

/// Docker port mappings, with `host_port` 0 filled from the offered ports.
fn port_bindings(task: &TaskInfo) -> Result<Vec<PortBinding>, ExecutorError> {
    let Some(docker) = task.container.as_ref().and_then(|c| c.docker.as_ref()) else {
        return Ok(Vec::new());
    };

    let explicit: BTreeSet<u32> = docker
        .port_mappings
        .iter()
        .map(|m| m.host_port)
        .filter(|p| *p != 0)
        .collect();
    let mut free = task
        .offered_ports()
        .into_iter()
        .filter(|p| !explicit.contains(p));

    docker
        .port_mappings
        .iter()
        .map(|m| {
            let host_port = if m.host_port == 0 {
                free.next().ok_or_else(|| {
                    ExecutorError::invalid(
                        &task.task_id,
                        format!("no offered port left for container port {}", m.container_port),
                    )
                })?
            } else {
                m.host_port
            };
            Ok(PortBinding {
                host_port,
                container_port: m.container_port,
                protocol: m
                    .protocol
                    .clone()
                    .unwrap_or_else(|| "tcp".to_string())
                    .to_ascii_lowercase(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use podex_messages::{
        ExtendedResourceRequest, InlineEnv, InlineSecret, LocalFile, RemoteEnv, ResourceLimits,
    };
    use podex_proto::{Environment, Variable, Volume};
    use podex_testing::{executor_id, TaskBuilder};

    fn ctx() -> TranslateContext {
        TranslateContext {
            pod_id: PodId::new(),
            executor_id: executor_id(),
            default_kill_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_container_name_is_sanitized() {
        let pod = PodId::new();
        assert_eq!(
            container_name(&pod, 1, "web server/v2"),
            format!("podex-{pod}-1-web-server-v2")
        );
    }

    #[test]
    fn test_basic_translation() {
        let ctx = ctx();
        let task = TaskBuilder::new("web")
            .image("nginx:1.25")
            .shell("nginx -g 'daemon off;'")
            .kill_grace_secs(3)
            .build();

        let plan = translate(&ctx, 0, &task).unwrap();
        let spec = &plan.spec;
        assert_eq!(spec.image, "nginx:1.25");
        assert_eq!(spec.command, vec!["/bin/sh", "-c", "nginx -g 'daemon off;'"]);
        assert_eq!(spec.kill_timeout, Duration::from_secs(3));
        assert_eq!(spec.resources.cpus, Some(0.1));
        assert_eq!(spec.resources.memory_mb, Some(32));
        assert_eq!(spec.labels[LABEL_TASK_ID], "web.task");
        assert_eq!(spec.labels[LABEL_POD_ID], ctx.pod_id.to_string());
        assert_eq!(spec.name, container_name(&ctx.pod_id, 0, "web"));
    }

    #[test]
    fn test_missing_image_is_rejected() {
        let task = TaskBuilder::new("web").no_container().build();
        let err = translate(&ctx(), 0, &task).unwrap_err();
        assert!(err.to_string().contains("no container image"));
    }

    #[test]
    fn test_ports_come_from_offers() {
        let task = TaskBuilder::new("web")
            .port(80)
            .port(443)
            .offered_ports(31000, 31001)
            .build();
        let plan = translate(&ctx(), 0, &task).unwrap();
        let hosts: Vec<u32> = plan.spec.port_mappings.iter().map(|p| p.host_port).collect();
        assert_eq!(hosts, vec![31000, 31001]);

        let starved = TaskBuilder::new("web").port(80).port(443).offered_ports(31000, 31000).build();
        assert!(translate(&ctx(), 0, &starved).is_err());
    }

    #[test]
    fn test_env_layering() {
        let mut task = TaskBuilder::new("web")
            .message(Message::InlineEnv(InlineEnv {
                vars: [("A".to_string(), "inline".to_string()), ("B".to_string(), "inline".to_string())]
                    .into_iter()
                    .collect(),
            }))
            .message(Message::InlineSecret(InlineSecret {
                target: SecretTarget::Env {
                    name: "B".to_string(),
                },
                value: STANDARD.encode("secret"),
            }))
            .message(Message::RemoteEnv(RemoteEnv {
                url: "http://config/app.env".to_string(),
            }))
            .build();
        task.command = Some(podex_proto::CommandInfo {
            value: Some("run".to_string()),
            environment: Some(Environment {
                variables: vec![
                    Variable {
                        name: "A".to_string(),
                        value: "command".to_string(),
                    },
                    Variable {
                        name: "C".to_string(),
                        value: "command".to_string(),
                    },
                ],
            }),
            ..Default::default()
        });

        let mut plan = translate(&ctx(), 0, &task).unwrap();
        assert_eq!(plan.remote_env, vec!["http://config/app.env"]);

        let remote: BTreeMap<String, String> = [
            ("B".to_string(), "remote".to_string()),
            ("C".to_string(), "remote".to_string()),
        ]
        .into_iter()
        .collect();
        let alloc: BTreeMap<String, String> =
            [("C".to_string(), "device".to_string())].into_iter().collect();
        plan.finalize(remote, &alloc, &["/dev/nvidia0".to_string()]);

        assert_eq!(plan.spec.env["A"], "inline");
        assert_eq!(plan.spec.env["B"], "secret");
        assert_eq!(plan.spec.env["C"], "device");
        assert_eq!(plan.spec.devices, vec!["/dev/nvidia0"]);
    }

    #[test]
    fn test_files_and_requests_are_collected() {
        let task = TaskBuilder::new("web")
            .message(Message::LocalFile(LocalFile {
                dest: "/etc/app.conf".to_string(),
                user: Some("1000".to_string()),
                mode: None,
                executable: true,
                data: STANDARD.encode("x=1"),
            }))
            .message(Message::InlineSecret(InlineSecret {
                target: SecretTarget::File {
                    dest: "/run/secrets/token".to_string(),
                    mode: None,
                },
                value: STANDARD.encode("t0k3n"),
            }))
            .message(Message::ExtendedResource(ExtendedResourceRequest {
                name: "gpu".to_string(),
                count: 1,
            }))
            .limits(ResourceLimits {
                cpus: Some(2.0),
                memory_mb: None,
                cpu_shares: Some(512),
            })
            .build();

        let plan = translate(&ctx(), 0, &task).unwrap();
        assert_eq!(plan.spec.files.len(), 2);
        assert_eq!(plan.spec.files[0].mode, 0o755);
        assert_eq!(plan.spec.files[0].data, b"x=1");
        assert_eq!(plan.spec.files[1].mode, 0o400);
        assert_eq!(plan.extended.len(), 1);
        assert_eq!(plan.spec.resources.cpus, Some(2.0));
        assert_eq!(plan.spec.resources.memory_mb, Some(32));
        assert_eq!(plan.spec.resources.cpu_shares, Some(512));
    }

    #[test]
    fn test_volumes() {
        let mut task = TaskBuilder::new("web").build();
        if let Some(container) = task.container.as_mut() {
            container.volumes = vec![
                Volume {
                    container_path: "/data".to_string(),
                    host_path: Some("/srv/data".to_string()),
                    mode: VolumeMode::Ro,
                },
                Volume {
                    container_path: "/scratch".to_string(),
                    host_path: None,
                    mode: VolumeMode::Rw,
                },
            ];
        }
        let plan = translate(&ctx(), 0, &task).unwrap();
        assert_eq!(plan.spec.volumes, vec!["/srv/data:/data:ro", "/scratch"]);
    }

    #[test]
    fn test_bad_custom_data_is_reported() {
        let task = TaskBuilder::new("web").raw_data(b"not base64 !!").build();
        let err = translate(&ctx(), 0, &task).unwrap_err();
        assert!(matches!(err, ExecutorError::TaskData { .. }));
    }
}
