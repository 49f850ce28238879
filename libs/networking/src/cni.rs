//! CNI plugin chain invocation.
//!
//! Network configurations are read from the config directory:
//! - `*.conflist`: `{"cniVersion", "name", "plugins": [...]}`
//! - `*.conf` / `*.json`: a single plugin config with `name` and `type`
//!
//! `ADD` runs the chain in order, feeding each plugin the previous result;
//! `DEL` runs it in reverse. Plugins are executed from the binary directory
//! with the standard `CNI_*` environment and the config on stdin.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::identity::PodNetwork;
use crate::manager::NetworkBackend;
use crate::MODE_CNI;

/// Default CNI spec version when a config omits it.
const DEFAULT_CNI_VERSION: &str = "0.4.0";

/// CNI backend configuration.
#[derive(Debug, Clone)]
pub struct CniConfig {
    /// Directory holding plugin binaries.
    pub bin_dir: PathBuf,
    /// Directory holding network configurations.
    pub conf_dir: PathBuf,
    /// Interface name created inside the namespace.
    pub if_name: String,
}

impl Default for CniConfig {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from("/opt/cni/bin"),
            conf_dir: PathBuf::from("/etc/cni/net.d"),
            if_name: "eth0".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct NetworkConfList {
    name: String,
    cni_version: String,
    plugins: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawConfList {
    name: String,
    #[serde(rename = "cniVersion", default)]
    cni_version: Option<String>,
    #[serde(default)]
    plugins: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CniCommand {
    Add,
    Del,
}

impl CniCommand {
    fn as_str(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Del => "DEL",
        }
    }
}

/// Namespace-owning backend driven by CNI plugins.
#[derive(Debug, Clone)]
pub struct CniBackend {
    config: CniConfig,
}

impl CniBackend {
    pub fn new(config: CniConfig) -> Self {
        Self { config }
    }

    /// Every parsable network config in the config directory, sorted by file name.
    async fn load_all(&self) -> Result<Vec<NetworkConfList>, NetworkError> {
        let mut entries = tokio::fs::read_dir(&self.config.conf_dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if matches!(ext, "conf" | "conflist" | "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut lists = Vec::new();
        for path in paths {
            match load_file(&path).await {
                Ok(list) => lists.push(list),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping CNI config"),
            }
        }
        Ok(lists)
    }

    async fn load_network(&self, name: &str) -> Result<NetworkConfList, NetworkError> {
        self.load_all()
            .await?
            .into_iter()
            .find(|list| list.name == name)
            .ok_or_else(|| {
                NetworkError::Config(format!(
                    "no CNI network {name:?} in {}",
                    self.config.conf_dir.display()
                ))
            })
    }

    fn plugin_path(&self, plugin: &Value) -> Result<(String, PathBuf), NetworkError> {
        let kind = plugin
            .get("type")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty() && !t.contains('/'))
            .ok_or_else(|| NetworkError::Config("plugin config without valid type".to_string()))?;
        Ok((kind.to_string(), self.config.bin_dir.join(kind)))
    }

    async fn exec_plugin(
        &self,
        command: CniCommand,
        plugin: &Value,
        pod: &dyn PodNetwork,
        container_id: &str,
        netns: &str,
    ) -> Result<Option<Value>, NetworkError> {
        let (kind, path) = self.plugin_path(plugin)?;
        let stdin_bytes = serde_json::to_vec(plugin)?;

        let args = pod
            .net_args()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";");

        debug!(
            plugin = %kind,
            command = command.as_str(),
            container_id = %container_id,
            netns = %netns,
            "Invoking CNI plugin"
        );

        let mut child = Command::new(&path)
            .env("CNI_COMMAND", command.as_str())
            .env("CNI_CONTAINERID", container_id)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", &self.config.if_name)
            .env("CNI_PATH", &self.config.bin_dir)
            .env("CNI_ARGS", args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&stdin_bytes).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let (code, msg) = match serde_json::from_slice::<PluginError>(&output.stdout) {
                Ok(err) => (err.code, err.msg),
                Err(_) => (
                    output.status.code().map_or(0, |c| c.unsigned_abs()),
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ),
            };
            return Err(NetworkError::Plugin {
                plugin: kind,
                code,
                msg,
            });
        }

        if command == CniCommand::Del || output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&output.stdout)?))
    }

    fn prepare(list: &NetworkConfList, plugin: &Value, prev: Option<&Value>) -> Value {
        let mut conf = plugin.clone();
        if let Some(obj) = conf.as_object_mut() {
            obj.insert("name".to_string(), Value::String(list.name.clone()));
            obj.insert(
                "cniVersion".to_string(),
                Value::String(list.cni_version.clone()),
            );
            if let Some(prev) = prev {
                obj.insert("prevResult".to_string(), prev.clone());
            }
        }
        conf
    }

    fn identity(pod: &dyn PodNetwork) -> Result<(String, String), NetworkError> {
        let container_id = pod.container_id().ok_or_else(|| NetworkError::MissingIdentity {
            pod: pod.pod_id(),
            what: "infrastructure container",
        })?;
        let netns = pod.netns().ok_or_else(|| NetworkError::MissingIdentity {
            pod: pod.pod_id(),
            what: "network namespace",
        })?;
        Ok((container_id, netns))
    }
}

async fn load_file(path: &Path) -> Result<NetworkConfList, NetworkError> {
    let bytes = tokio::fs::read(path).await?;
    let is_list = path.extension().and_then(|e| e.to_str()) == Some("conflist");

    if is_list {
        let raw: RawConfList = serde_json::from_slice(&bytes)?;
        if raw.plugins.is_empty() {
            return Err(NetworkError::Config(format!(
                "{} has no plugins",
                path.display()
            )));
        }
        return Ok(NetworkConfList {
            name: raw.name,
            cni_version: raw
                .cni_version
                .unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string()),
            plugins: raw.plugins,
        });
    }

    let plugin: Value = serde_json::from_slice(&bytes)?;
    let name = plugin
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| NetworkError::Config(format!("{} has no name", path.display())))?
        .to_string();
    let cni_version = plugin
        .get("cniVersion")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_CNI_VERSION)
        .to_string();
    Ok(NetworkConfList {
        name,
        cni_version,
        plugins: vec![plugin],
    })
}

/// Extracts the first address from a CNI result, without prefix length.
fn first_ip(result: &Value) -> Result<String, NetworkError> {
    let address = result
        .get("ips")
        .and_then(Value::as_array)
        .and_then(|ips| ips.first())
        .and_then(|ip| ip.get("address"))
        .and_then(Value::as_str)
        .ok_or_else(|| NetworkError::InvalidResult("result has no ips[0].address".to_string()))?;

    let ip = address.split('/').next().unwrap_or(address);
    ip.parse::<std::net::IpAddr>()
        .map_err(|_| NetworkError::InvalidResult(format!("bad address {address:?}")))?;
    Ok(ip.to_string())
}

#[async_trait]
impl NetworkBackend for CniBackend {
    fn mode(&self) -> &str {
        MODE_CNI
    }

    async fn init(&self) -> Result<(), NetworkError> {
        if !self.config.bin_dir.is_dir() {
            return Err(NetworkError::Config(format!(
                "CNI bin dir {} does not exist",
                self.config.bin_dir.display()
            )));
        }
        let lists = self.load_all().await?;
        if lists.is_empty() {
            return Err(NetworkError::Config(format!(
                "no CNI network configs in {}",
                self.config.conf_dir.display()
            )));
        }
        info!(
            networks = ?lists.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
            "CNI networks discovered"
        );
        Ok(())
    }

    async fn set_up_pod(&self, pod: &dyn PodNetwork) -> Result<(), NetworkError> {
        let (container_id, netns) = Self::identity(pod)?;
        let list = self.load_network(&pod.network_name()).await?;

        let mut prev: Option<Value> = None;
        for plugin in &list.plugins {
            let conf = Self::prepare(&list, plugin, prev.as_ref());
            if let Some(result) = self
                .exec_plugin(CniCommand::Add, &conf, pod, &container_id, &netns)
                .await?
            {
                prev = Some(result);
            }
        }

        let result = prev.ok_or_else(|| {
            NetworkError::InvalidResult("plugin chain produced no result".to_string())
        })?;
        pod.set_ip_addr(Some(first_ip(&result)?));
        Ok(())
    }

    async fn tear_down_pod(&self, pod: &dyn PodNetwork) -> Result<(), NetworkError> {
        let Ok((container_id, netns)) = Self::identity(pod) else {
            debug!(pod_id = %pod.pod_id(), "Nothing to tear down");
            return Ok(());
        };
        let list = self.load_network(&pod.network_name()).await?;

        let mut first_err = None;
        for plugin in list.plugins.iter().rev() {
            let conf = Self::prepare(&list, plugin, None);
            if let Err(e) = self
                .exec_plugin(CniCommand::Del, &conf, pod, &container_id, &netns)
                .await
            {
                warn!(pod_id = %pod.pod_id(), error = %e, "CNI DEL failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NetworkIdentity;
    use std::os::unix::fs::PermissionsExt;

    fn write_plugin(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn backend(bin: &Path, conf: &Path) -> CniBackend {
        CniBackend::new(CniConfig {
            bin_dir: bin.to_path_buf(),
            conf_dir: conf.to_path_buf(),
            if_name: "eth0".to_string(),
        })
    }

    #[test]
    fn test_first_ip() {
        let result = serde_json::json!({"ips": [{"address": "10.22.0.9/16"}]});
        assert_eq!(first_ip(&result).unwrap(), "10.22.0.9");
        assert!(first_ip(&serde_json::json!({"ips": []})).is_err());
        assert!(first_ip(&serde_json::json!({"ips": [{"address": "nope/8"}]})).is_err());
    }

    #[tokio::test]
    async fn test_add_runs_chain_and_records_ip() {
        let bin = tempfile::tempdir().unwrap();
        let conf = tempfile::tempdir().unwrap();
        write_plugin(
            bin.path(),
            "fakebridge",
            r#"cat >/dev/null; echo '{"cniVersion":"0.4.0","ips":[{"address":"10.22.0.5/16"}]}'"#,
        );
        std::fs::write(
            conf.path().join("10-podnet.conflist"),
            r#"{"cniVersion":"0.4.0","name":"podnet","plugins":[{"type":"fakebridge"}]}"#,
        )
        .unwrap();

        let backend = backend(bin.path(), conf.path());
        backend.init().await.unwrap();

        let pod = NetworkIdentity::new("pod_e", MODE_CNI, "podnet");
        pod.attach("infra-1", Some(1), None);
        backend.set_up_pod(&pod).await.unwrap();
        assert_eq!(pod.ip_addr().as_deref(), Some("10.22.0.5"));

        backend.tear_down_pod(&pod).await.unwrap();
    }

    #[tokio::test]
    async fn test_plugin_error_is_reported() {
        let bin = tempfile::tempdir().unwrap();
        let conf = tempfile::tempdir().unwrap();
        write_plugin(
            bin.path(),
            "broken",
            r#"cat >/dev/null; echo '{"code":11,"msg":"no addresses left"}'; exit 1"#,
        );
        std::fs::write(
            conf.path().join("podnet.conf"),
            r#"{"name":"podnet","type":"broken"}"#,
        )
        .unwrap();

        let pod = NetworkIdentity::new("pod_f", MODE_CNI, "podnet");
        pod.attach("infra-2", Some(1), None);
        let err = backend(bin.path(), conf.path())
            .set_up_pod(&pod)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Plugin { code: 11, .. }));
    }

    #[tokio::test]
    async fn test_set_up_requires_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let pod = NetworkIdentity::new("pod_g", MODE_CNI, "podnet");
        let err = backend(dir.path(), dir.path())
            .set_up_pod(&pod)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::MissingIdentity { .. }));
    }

    #[tokio::test]
    async fn test_init_rejects_empty_conf_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = backend(dir.path(), dir.path()).init().await.unwrap_err();
        assert!(matches!(err, NetworkError::Config(_)));
    }
}
