//! Configuration for the pod executor.
//!
//! The control-plane agent launches the executor with its settings in the
//! environment (`MESOS_*`); node-local settings use `PODEX_*`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use podex_id::{ExecutorId, FrameworkId};
use podex_networking::{CniConfig, MODE_CNI, MODE_CNM};

use crate::driver::DriverConfig;
use crate::executor::ExecutorConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Pod executor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane agent `host:port`.
    pub agent_endpoint: String,

    pub framework_id: FrameworkId,

    pub executor_id: ExecutorId,

    /// Sandbox directory.
    pub directory: PathBuf,

    /// Give-up bound for the reconnect loop.
    pub recovery_timeout: Duration,

    /// Reconnect delay cap.
    pub subscription_backoff_max: Duration,

    pub docker_socket: PathBuf,

    /// `cni` or `cnm`.
    pub network_mode: String,

    pub network_name: String,

    pub cni_bin_dir: PathBuf,

    pub cni_conf_dir: PathBuf,

    pub infra_image: String,

    pub watch_interval: Duration,

    pub inspect_failure_limit: u32,

    pub stop_grace: Duration,

    pub ack_wait: Duration,

    pub remove_containers: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let framework_id = lookup("MESOS_FRAMEWORK_ID").context("MESOS_FRAMEWORK_ID is not set")?;
        let framework_id =
            FrameworkId::parse(&framework_id).context("MESOS_FRAMEWORK_ID is invalid")?;
        let executor_id = lookup("MESOS_EXECUTOR_ID").context("MESOS_EXECUTOR_ID is not set")?;
        let executor_id = ExecutorId::parse(&executor_id).context("MESOS_EXECUTOR_ID is invalid")?;

        let network_mode = string("PODEX_NETWORK_MODE", MODE_CNM).to_ascii_lowercase();
        if network_mode != MODE_CNI && network_mode != MODE_CNM {
            anyhow::bail!("PODEX_NETWORK_MODE must be {MODE_CNI} or {MODE_CNM}, got {network_mode}");
        }

        let cni = CniConfig::default();
        let remove_containers = lookup("PODEX_REMOVE_CONTAINERS")
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no"))
            .unwrap_or(true);
        let log_format = match lookup("PODEX_LOG_FORMAT").as_deref() {
            Some("text") => LogFormat::Text,
            _ => LogFormat::Json,
        };

        Ok(Self {
            agent_endpoint: string("MESOS_AGENT_ENDPOINT", "127.0.0.1:5051"),
            framework_id,
            executor_id,
            directory: PathBuf::from(string("MESOS_DIRECTORY", ".")),
            recovery_timeout: Duration::from_secs(number("MESOS_RECOVERY_TIMEOUT_SECS", 900)),
            subscription_backoff_max: Duration::from_secs(number(
                "MESOS_SUBSCRIPTION_BACKOFF_MAX_SECS",
                2,
            )),
            docker_socket: PathBuf::from(string("PODEX_DOCKER_SOCKET", "/var/run/docker.sock")),
            network_mode,
            network_name: string("PODEX_NETWORK_NAME", "bridge"),
            cni_bin_dir: lookup("PODEX_CNI_BIN_DIR")
                .map(PathBuf::from)
                .unwrap_or(cni.bin_dir),
            cni_conf_dir: lookup("PODEX_CNI_CONF_DIR")
                .map(PathBuf::from)
                .unwrap_or(cni.conf_dir),
            infra_image: string("PODEX_INFRA_IMAGE", "registry.k8s.io/pause:3.9"),
            watch_interval: Duration::from_millis(number("PODEX_WATCH_INTERVAL_MS", 1000).max(10)),
            inspect_failure_limit: number(
                "PODEX_INSPECT_FAILURE_LIMIT",
                u64::from(podex_reconcile::DEFAULT_FAILURE_LIMIT),
            )
            .min(u64::from(u32::MAX)) as u32,
            stop_grace: Duration::from_secs(number("PODEX_STOP_GRACE_SECS", 10)),
            ack_wait: Duration::from_secs(number("PODEX_ACK_WAIT_SECS", 5)),
            remove_containers,
            log_level: string("PODEX_LOG_LEVEL", "info"),
            log_format,
        })
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            ack_wait: self.ack_wait,
            backoff_max: self.subscription_backoff_max,
            recovery_timeout: self.recovery_timeout,
            ..DriverConfig::new(self.framework_id.clone(), self.executor_id.clone())
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            network_mode: self.network_mode.clone(),
            network_name: self.network_name.clone(),
            infra_image: self.infra_image.clone(),
            watch_interval: self.watch_interval,
            inspect_failure_limit: self.inspect_failure_limit,
            remove_containers: self.remove_containers,
            default_kill_timeout: self.stop_grace,
            ..ExecutorConfig::new(self.executor_id.clone())
        }
    }

    pub fn cni_config(&self) -> CniConfig {
        CniConfig {
            bin_dir: self.cni_bin_dir.clone(),
            conf_dir: self.cni_conf_dir.clone(),
            ..CniConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("MESOS_FRAMEWORK_ID", "fw-1"),
        ("MESOS_EXECUTOR_ID", "exec-1"),
    ];

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.agent_endpoint, "127.0.0.1:5051");
        assert_eq!(config.network_mode, "cnm");
        assert_eq!(config.recovery_timeout, Duration::from_secs(900));
        assert_eq!(config.subscription_backoff_max, Duration::from_secs(2));
        assert_eq!(config.watch_interval, Duration::from_millis(1000));
        assert_eq!(config.inspect_failure_limit, 5);
        assert!(config.remove_containers);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.executor_id.as_str(), "exec-1");
    }

    #[test]
    fn test_overrides_and_bad_numbers() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("PODEX_NETWORK_MODE", "CNI"),
            ("PODEX_WATCH_INTERVAL_MS", "250"),
            ("PODEX_ACK_WAIT_SECS", "soon"),
            ("PODEX_REMOVE_CONTAINERS", "false"),
            ("PODEX_LOG_FORMAT", "text"),
            ("PODEX_CNI_CONF_DIR", "/tmp/cni"),
        ]);
        let config = Config::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.network_mode, "cni");
        assert_eq!(config.watch_interval, Duration::from_millis(250));
        assert_eq!(config.ack_wait, Duration::from_secs(5));
        assert!(!config.remove_containers);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.cni_config().conf_dir, PathBuf::from("/tmp/cni"));

        let executor = config.executor_config();
        assert_eq!(executor.network_mode, "cni");
        assert!(!executor.remove_containers);
    }

    #[test]
    fn test_missing_ids_fail() {
        let err = Config::from_lookup(lookup(&[("MESOS_FRAMEWORK_ID", "fw-1")])).unwrap_err();
        assert!(err.to_string().contains("MESOS_EXECUTOR_ID"));
    }

    #[test]
    fn test_unknown_network_mode_fails() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("PODEX_NETWORK_MODE", "overlay"));
        assert!(Config::from_lookup(lookup(&vars)).is_err());
    }
}
