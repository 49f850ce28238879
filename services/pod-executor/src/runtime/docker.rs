//! Docker Engine API client.
//!
//! Talks to the engine over its unix socket. Only the handful of endpoints
//! the pod engine needs are covered:
//!
//! - `POST /containers/create`, `/start`, `/stop`, `/kill`, `/update`
//! - `DELETE /containers/{id}`, `GET /containers/{id}/json`
//! - `PUT /containers/{id}/archive` for file injection
//! - `POST /containers/{id}/exec` + `/exec/{id}/start` for commands
//! - `POST /images/create` (pull) and `POST /commit`
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{
    ContainerConfig, ContainerInfo, ContainerRuntime, ContainerStatus, ExecOutput, ResourceSpec,
    RuntimeError, UploadFile,
};

/// Docker runtime over the engine's unix socket.
pub struct DockerRuntime {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl DockerRuntime {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        Self {
            socket_path,
            client: Client::unix(),
        }
    }

    /// Check if the engine socket exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<(Vec<u8>, &'static str)>,
    ) -> Result<(StatusCode, Bytes), RuntimeError> {
        let uri = Uri::new(&self.socket_path, path);
        debug!(method = %method, path = path, "Docker API request");

        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let request = match body {
            Some((bytes, content_type)) => builder
                .header("Content-Type", content_type)
                .body(Body::from(bytes))?,
            None => builder.body(Body::empty())?,
        };

        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;
        Ok((status, body))
    }

    async fn post_json<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<(StatusCode, Bytes), RuntimeError> {
        let bytes = serde_json::to_vec(body)?;
        self.request(Method::POST, path, Some((bytes, "application/json")))
            .await
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let (from_image, tag) = split_image_ref(image);
        let mut params = vec![("fromImage", from_image)];
        if let Some(tag) = tag {
            params.push(("tag", tag));
        }
        let path = with_query("/images/create", &params);

        info!(image = image, "Pulling image");
        let (status, body) = self.request(Method::POST, &path, None).await?;
        if !status.is_success() {
            return Err(RuntimeError::ImagePull {
                image: image.to_string(),
                message: error_message(&body),
            });
        }

        // Pull progress is a stream of JSON objects; failures arrive in-band.
        for line in body.split(|b| *b == b'\n') {
            if let Ok(progress) = serde_json::from_slice::<PullProgress>(line) {
                if let Some(message) = progress.error {
                    return Err(RuntimeError::ImagePull {
                        image: image.to_string(),
                        message,
                    });
                }
            }
        }
        Ok(())
    }

    async fn create_raw(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
        let path = with_query("/containers/create", &[("name", config.name.as_str())]);
        let (status, body) = self.post_json(&path, &create_body(config)).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(config.image.clone()));
        }
        let body = check(status, body)?;
        let created: IdResponse = serde_json::from_slice(&body)?;
        for warning in created.warnings.unwrap_or_default() {
            warn!(container = %config.name, warning = %warning, "Docker create warning");
        }
        Ok(created.id)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(
        &self,
        config: &ContainerConfig,
    ) -> Result<ContainerInfo, RuntimeError> {
        if config.force_pull {
            self.pull_image(&config.image).await?;
        }

        let id = match self.create_raw(config).await {
            Ok(id) => id,
            // 404 from create means the image is not present locally.
            Err(RuntimeError::NotFound(_)) if !config.force_pull => {
                self.pull_image(&config.image).await?;
                self.create_raw(config).await?
            }
            Err(e) => return Err(e),
        };

        info!(container = %config.name, container_id = %id, image = %config.image, "Container created");
        self.inspect_container(&id).await
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let path = format!("/containers/{id}/start");
        let (status, body) = self.request(Method::POST, &path, None).await?;
        match status {
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED => Ok(()),
            StatusCode::NOT_FOUND => Err(RuntimeError::NotFound(id.to_string())),
            _ => check(status, body).map(|_| ()),
        }
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let secs = timeout.as_secs().to_string();
        let path = with_query(&format!("/containers/{id}/stop"), &[("t", secs.as_str())]);
        let (status, body) = self.request(Method::POST, &path, None).await?;
        match status {
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED => Ok(()),
            StatusCode::NOT_FOUND => Err(RuntimeError::NotFound(id.to_string())),
            _ => check(status, body).map(|_| ()),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let force = if force { "true" } else { "false" };
        let path = with_query(&format!("/containers/{id}"), &[("force", force), ("v", "true")]);
        let (status, body) = self.request(Method::DELETE, &path, None).await?;
        match status {
            // Already gone.
            StatusCode::NOT_FOUND => Ok(()),
            _ => check(status, body).map(|_| ()),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let path = format!("/containers/{id}/json");
        let (status, body) = self.request(Method::GET, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        let body = check(status, body)?;
        let inspect: InspectResponse = serde_json::from_slice(&body)?;
        Ok(inspect.into_info())
    }

    async fn upload_to_container(&self, id: &str, file: &UploadFile) -> Result<(), RuntimeError> {
        let dest = Path::new(&file.dest);
        let dir = dest
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());
        let archive = tar_single_file(file)?;

        let path = with_query(&format!("/containers/{id}/archive"), &[("path", dir.as_str())]);
        let (status, body) = self
            .request(Method::PUT, &path, Some((archive, "application/x-tar")))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        check(status, body)?;
        debug!(container_id = id, dest = %file.dest, bytes = file.data.len(), "File uploaded");
        Ok(())
    }

    async fn run_command(&self, id: &str, argv: &[String]) -> Result<ExecOutput, RuntimeError> {
        if argv.is_empty() {
            return Err(RuntimeError::Invalid("empty command".to_string()));
        }

        let create = json!({
            "AttachStdout": true,
            "AttachStderr": true,
            "Tty": false,
            "Cmd": argv,
        });
        let (status, body) = self
            .post_json(&format!("/containers/{id}/exec"), &create)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        let exec: IdResponse = serde_json::from_slice(&check(status, body)?)?;

        let (status, body) = self
            .post_json(
                &format!("/exec/{}/start", exec.id),
                &json!({ "Detach": false, "Tty": false }),
            )
            .await?;
        let raw = check(status, body)?;
        let output = demux_stream(&raw);

        let (status, body) = self
            .request(Method::GET, &format!("/exec/{}/json", exec.id), None)
            .await?;
        let inspect: ExecInspect = serde_json::from_slice(&check(status, body)?)?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    async fn update_resources(
        &self,
        id: &str,
        resources: &ResourceSpec,
    ) -> Result<(), RuntimeError> {
        let mut body = serde_json::Map::new();
        if let Some(cpus) = resources.cpus {
            body.insert("NanoCpus".into(), json!(nano_cpus(cpus)));
        }
        if let Some(mb) = resources.memory_mb {
            let bytes = mb.saturating_mul(1024 * 1024);
            body.insert("Memory".into(), json!(bytes));
            body.insert("MemorySwap".into(), json!(bytes));
        }
        if let Some(shares) = resources.cpu_shares {
            body.insert("CpuShares".into(), json!(shares));
        }

        let (status, resp) = self
            .post_json(&format!("/containers/{id}/update"), &body)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        check(status, resp).map(|_| ())
    }

    async fn commit_image(
        &self,
        id: &str,
        repository: &str,
        tag: Option<&str>,
    ) -> Result<String, RuntimeError> {
        let mut params = vec![("container", id), ("repo", repository)];
        if let Some(tag) = tag {
            params.push(("tag", tag));
        }
        let path = with_query("/commit", &params);
        let (status, body) = self.post_json(&path, &json!({})).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        let committed: IdResponse = serde_json::from_slice(&check(status, body)?)?;
        info!(container_id = id, image_id = %committed.id, repository = repository, "Image committed");
        Ok(committed.id)
    }

    async fn kill_container(&self, id: &str, signal: &str) -> Result<(), RuntimeError> {
        let path = with_query(&format!("/containers/{id}/kill"), &[("signal", signal)]);
        let (status, body) = self.request(Method::POST, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        check(status, body).map(|_| ())
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct IdResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Warnings", default)]
    warnings: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug, Deserialize)]
struct PullProgress {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecInspect {
    #[serde(rename = "ExitCode", default)]
    exit_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State", default)]
    state: InspectState,
    #[serde(rename = "NetworkSettings", default)]
    network: InspectNetwork,
}

#[derive(Debug, Default, Deserialize)]
struct InspectState {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "ExitCode", default)]
    exit_code: Option<i64>,
    #[serde(rename = "Pid", default)]
    pid: Option<u32>,
    #[serde(rename = "Error", default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: Option<String>,
    #[serde(rename = "Networks", default)]
    networks: BTreeMap<String, EndpointSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointSettings {
    #[serde(rename = "IPAddress", default)]
    ip_address: Option<String>,
}

impl InspectResponse {
    fn into_info(self) -> ContainerInfo {
        let status = ContainerStatus::parse(&self.state.status);
        let ip_address = self
            .network
            .ip_address
            .filter(|ip| !ip.is_empty())
            .or_else(|| {
                self.network
                    .networks
                    .into_values()
                    .filter_map(|n| n.ip_address)
                    .find(|ip| !ip.is_empty())
            });
        ContainerInfo {
            id: self.id,
            name: self.name.trim_start_matches('/').to_string(),
            // Docker reports 0 for containers that never ran.
            exit_code: if status.is_down() { self.state.exit_code } else { None },
            pid: self.state.pid.filter(|pid| *pid > 0),
            ip_address,
            error: self.state.error.filter(|e| !e.is_empty()),
            status,
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn check(status: StatusCode, body: Bytes) -> Result<Bytes, RuntimeError> {
    if status.is_success() {
        Ok(body)
    } else {
        Err(RuntimeError::Api {
            status: status.as_u16(),
            message: error_message(&body),
        })
    }
}

fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<ErrorResponse>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}

fn with_query(path: &str, params: &[(&str, &str)]) -> String {
    // Url is only used for its query encoder; the host is never contacted.
    let Ok(mut url) = Url::parse("http://docker") else {
        return path.to_string();
    };
    url.set_path(path);
    url.query_pairs_mut().extend_pairs(params);
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Splits `repo[:tag]` into the pull parameters. Digests are passed whole.
fn split_image_ref(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (&image[..split], Some(&image[split + 1..]))
        }
        None => (image, Some("latest")),
    }
}

fn nano_cpus(cpus: f64) -> i64 {
    (cpus * 1_000_000_000.0).round() as i64
}

fn create_body(config: &ContainerConfig) -> serde_json::Value {
    let env: Vec<String> = config.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let mut exposed = serde_json::Map::new();
    let mut bindings = serde_json::Map::new();
    for binding in &config.port_bindings {
        let key = format!("{}/{}", binding.container_port, binding.protocol);
        exposed.insert(key.clone(), json!({}));
        bindings.insert(key, json!([{ "HostPort": binding.host_port.to_string() }]));
    }

    let devices: Vec<serde_json::Value> = config
        .devices
        .iter()
        .map(|d| json!({ "PathOnHost": d, "PathInContainer": d, "CgroupPermissions": "rwm" }))
        .collect();

    // Entries without a host side are anonymous volumes.
    let (binds, anonymous): (Vec<&String>, Vec<&String>) =
        config.binds.iter().partition(|b| b.contains(':'));
    let volumes: serde_json::Map<String, serde_json::Value> = anonymous
        .into_iter()
        .map(|path| (path.clone(), json!({})))
        .collect();

    let mut host_config = json!({
        "Binds": binds,
        "NetworkMode": config.network_mode,
        "PortBindings": bindings,
        "Privileged": config.privileged,
        "Devices": devices,
    });
    if let Some(cpus) = config.resources.cpus {
        host_config["NanoCpus"] = json!(nano_cpus(cpus));
    }
    if let Some(mb) = config.resources.memory_mb {
        host_config["Memory"] = json!(mb.saturating_mul(1024 * 1024));
    }
    if let Some(shares) = config.resources.cpu_shares {
        host_config["CpuShares"] = json!(shares);
    }

    let mut body = json!({
        "Image": config.image,
        "Env": env,
        "Labels": config.labels,
        "ExposedPorts": exposed,
        "Volumes": volumes,
        "HostConfig": host_config,
    });
    if !config.cmd.is_empty() {
        body["Cmd"] = json!(config.cmd);
    }
    // Containers joining another's namespace may not set a hostname.
    if let Some(hostname) = &config.hostname {
        if !config.network_mode.starts_with("container:") {
            body["Hostname"] = json!(hostname);
        }
    }
    body
}

fn tar_single_file(file: &UploadFile) -> Result<Vec<u8>, RuntimeError> {
    let name = Path::new(&file.dest)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| RuntimeError::Invalid(format!("no file name in {}", file.dest)))?;

    let mut header = tar::Header::new_gnu();
    header.set_size(file.data.len() as u64);
    header.set_mode(file.mode);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    if let Some(user) = &file.user {
        let (uid, gid) = parse_owner(user)?;
        header.set_uid(uid);
        header.set_gid(gid);
    }

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, file.data.as_slice())?;
    Ok(builder.into_inner()?)
}

/// Parses `uid` or `uid:gid`. A bare uid doubles as the gid.
fn parse_owner(user: &str) -> Result<(u64, u64), RuntimeError> {
    let invalid = || RuntimeError::Invalid(format!("file owner must be numeric uid[:gid]: {user}"));
    match user.split_once(':') {
        Some((uid, gid)) => Ok((
            uid.parse().map_err(|_| invalid())?,
            gid.parse().map_err(|_| invalid())?,
        )),
        None => {
            let uid = user.parse().map_err(|_| invalid())?;
            Ok((uid, uid))
        }
    }
}

/// Joins stdout and stderr frames of a non-TTY attach stream.
///
/// Each frame is an 8-byte header (stream type, 3 padding bytes, big-endian
/// length) followed by the payload.
fn demux_stream(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while rest.len() >= 8 {
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + len).min(rest.len());
        out.extend_from_slice(&rest[8..end]);
        rest = &rest[end..];
    }
    String::from_utf8_lossy(&out).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::PortBinding;
    use rstest::rstest;

    #[rstest]
    #[case("busybox", "busybox", Some("latest"))]
    #[case("nginx:1.25", "nginx", Some("1.25"))]
    #[case("registry:5000/team/app", "registry:5000/team/app", Some("latest"))]
    #[case("registry:5000/team/app:v2", "registry:5000/team/app", Some("v2"))]
    #[case("app@sha256:abcd", "app@sha256:abcd", None)]
    fn test_split_image_ref(#[case] image: &str, #[case] repo: &str, #[case] tag: Option<&str>) {
        assert_eq!(split_image_ref(image), (repo, tag));
    }

    #[test]
    fn test_query_is_encoded() {
        let path = with_query("/containers/create", &[("name", "podex a/b")]);
        assert_eq!(path, "/containers/create?name=podex+a%2Fb");
    }

    #[test]
    fn test_create_body_maps_config() {
        let mut config = ContainerConfig {
            name: "podex-x-0-web".to_string(),
            image: "nginx".to_string(),
            cmd: vec!["sh".into(), "-c".into(), "true".into()],
            network_mode: "bridge".to_string(),
            hostname: Some("web".to_string()),
            port_bindings: vec![PortBinding {
                host_port: 31000,
                container_port: 80,
                protocol: "tcp".to_string(),
            }],
            resources: ResourceSpec {
                cpus: Some(0.5),
                memory_mb: Some(64),
                cpu_shares: None,
            },
            ..Default::default()
        };
        config.env.insert("A".into(), "1".into());
        config.binds = vec!["/srv:/data:ro".into(), "/scratch".into()];

        let body = create_body(&config);
        assert_eq!(body["HostConfig"]["Binds"], json!(["/srv:/data:ro"]));
        assert!(body["Volumes"].get("/scratch").is_some());
        assert_eq!(body["Env"], json!(["A=1"]));
        assert_eq!(body["Hostname"], "web");
        assert_eq!(body["HostConfig"]["NanoCpus"], 500_000_000);
        assert_eq!(body["HostConfig"]["Memory"], 64 * 1024 * 1024);
        assert_eq!(
            body["HostConfig"]["PortBindings"]["80/tcp"][0]["HostPort"],
            "31000"
        );
        assert!(body["ExposedPorts"].get("80/tcp").is_some());
    }

    #[test]
    fn test_shared_namespace_drops_hostname() {
        let config = ContainerConfig {
            image: "busybox".into(),
            network_mode: "container:abc".into(),
            hostname: Some("web".into()),
            ..Default::default()
        };
        let body = create_body(&config);
        assert!(body.get("Hostname").is_none());
        assert!(body.get("Cmd").is_none());
    }

    #[test]
    fn test_demux_stream() {
        let mut raw = vec![1, 0, 0, 0, 0, 0, 0, 3];
        raw.extend_from_slice(b"out");
        raw.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 4]);
        raw.extend_from_slice(b"err\n");
        assert_eq!(demux_stream(&raw), "outerr\n");
    }

    #[test]
    fn test_tar_single_file() {
        let file = UploadFile {
            dest: "/etc/app/config.json".to_string(),
            data: b"{}".to_vec(),
            mode: 0o600,
            user: Some("1000:1001".to_string()),
        };
        let archive = tar_single_file(&file).unwrap();

        let mut reader = tar::Archive::new(archive.as_slice());
        let entry = reader.entries().unwrap().next().unwrap().unwrap();
        let header = entry.header();
        assert_eq!(entry.path().unwrap().to_string_lossy(), "config.json");
        assert_eq!(header.mode().unwrap(), 0o600);
        assert_eq!(header.uid().unwrap(), 1000);
        assert_eq!(header.gid().unwrap(), 1001);
    }

    #[test]
    fn test_parse_owner_rejects_names() {
        assert_eq!(parse_owner("33").unwrap(), (33, 33));
        assert!(parse_owner("www-data").is_err());
    }

    #[test]
    fn test_inspect_into_info() {
        let raw = json!({
            "Id": "abc",
            "Name": "/podex-x-0-web",
            "State": { "Status": "exited", "ExitCode": 2, "Pid": 0, "Error": "" },
            "NetworkSettings": {
                "IPAddress": "",
                "Networks": { "bridge": { "IPAddress": "172.17.0.9" } }
            }
        });
        let info = serde_json::from_value::<InspectResponse>(raw)
            .unwrap()
            .into_info();
        assert_eq!(info.name, "podex-x-0-web");
        assert_eq!(info.status, ContainerStatus::Exited);
        assert_eq!(info.exit_code, Some(2));
        assert_eq!(info.pid, None);
        assert_eq!(info.error, None);
        assert_eq!(info.ip_address.as_deref(), Some("172.17.0.9"));
    }
}
