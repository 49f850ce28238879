//! Message union, task custom data and acknowledgements.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dotenv::validate_key;
use crate::error::MessageError;

/// When a message is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Embedded in the task descriptor, applied before containers start.
    Launch,
    /// Delivered as a framework message against a running pod.
    Runtime,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Runtime => "runtime",
        }
    }
}

// =============================================================================
// Message union
// =============================================================================

/// A typed side-effect request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    LocalFile(LocalFile),
    RemoteFile(RemoteFile),
    RemoteEnv(RemoteEnv),
    InlineSecret(InlineSecret),
    InlineEnv(InlineEnv),
    ExtendedResource(ExtendedResourceRequest),
    ResourceUpdate(ResourceUpdate),
    ImageCommit(ImageCommit),
    AdHocCommand(AdHocCommand),
    Signal(SignalRequest),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LocalFile(_) => "local_file",
            Self::RemoteFile(_) => "remote_file",
            Self::RemoteEnv(_) => "remote_env",
            Self::InlineSecret(_) => "inline_secret",
            Self::InlineEnv(_) => "inline_env",
            Self::ExtendedResource(_) => "extended_resource",
            Self::ResourceUpdate(_) => "resource_update",
            Self::ImageCommit(_) => "image_commit",
            Self::AdHocCommand(_) => "ad_hoc_command",
            Self::Signal(_) => "signal",
        }
    }

    /// Whether this kind may be applied in `phase`.
    pub fn allowed_in(&self, phase: Phase) -> bool {
        match self {
            Self::LocalFile(_) | Self::RemoteFile(_) => true,
            Self::RemoteEnv(_)
            | Self::InlineSecret(_)
            | Self::InlineEnv(_)
            | Self::ExtendedResource(_) => phase == Phase::Launch,
            Self::ResourceUpdate(_)
            | Self::ImageCommit(_)
            | Self::AdHocCommand(_)
            | Self::Signal(_) => phase == Phase::Runtime,
        }
    }

    /// Checks required fields and that the kind fits `phase`.
    pub fn validate(&self, phase: Phase) -> Result<(), MessageError> {
        if !self.allowed_in(phase) {
            return Err(MessageError::NotAllowed {
                kind: self.kind(),
                phase: phase.as_str(),
            });
        }

        let kind = self.kind();
        let invalid = |reason: &str| MessageError::InvalidField {
            kind,
            reason: reason.to_string(),
        };

        match self {
            Self::LocalFile(m) => {
                check_dest(&m.dest).map_err(|r| invalid(&r))?;
                m.decode()?;
            }
            Self::RemoteFile(m) => {
                check_dest(&m.dest).map_err(|r| invalid(&r))?;
                check_url(&m.url).map_err(|r| invalid(&r))?;
            }
            Self::RemoteEnv(m) => check_url(&m.url).map_err(|r| invalid(&r))?,
            Self::InlineSecret(m) => {
                match &m.target {
                    SecretTarget::Env { name } => validate_key(name)?,
                    SecretTarget::File { dest, .. } => {
                        check_dest(dest).map_err(|r| invalid(&r))?
                    }
                }
                m.decode()?;
            }
            Self::InlineEnv(m) => {
                for key in m.vars.keys() {
                    validate_key(key)?;
                }
            }
            Self::ExtendedResource(m) => {
                if m.name.is_empty() {
                    return Err(invalid("name is empty"));
                }
                if m.count == 0 {
                    return Err(invalid("count must be positive"));
                }
            }
            Self::ResourceUpdate(m) => {
                if m.cpus.is_none() && m.memory_mb.is_none() {
                    return Err(invalid("nothing to update"));
                }
                if m.cpus.is_some_and(|c| c <= 0.0) {
                    return Err(invalid("cpus must be positive"));
                }
            }
            Self::ImageCommit(m) => {
                if m.repository.is_empty() {
                    return Err(invalid("repository is empty"));
                }
            }
            Self::AdHocCommand(m) => {
                if m.argv.is_empty() || m.argv[0].is_empty() {
                    return Err(invalid("argv is empty"));
                }
            }
            Self::Signal(m) => {
                if m.signal.is_empty() {
                    return Err(invalid("signal is empty"));
                }
            }
        }

        Ok(())
    }
}

fn check_dest(dest: &str) -> Result<(), String> {
    if !dest.starts_with('/') {
        return Err(format!("destination {dest:?} must be absolute"));
    }
    if dest.split('/').any(|seg| seg == "..") {
        return Err(format!("destination {dest:?} must not contain '..'"));
    }
    if dest.ends_with('/') {
        return Err(format!("destination {dest:?} must name a file"));
    }
    Ok(())
}

fn check_url(url: &str) -> Result<(), String> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(format!("url {url:?} must be http or https"))
    }
}

fn decode_b64(field: &'static str, value: &str) -> Result<Vec<u8>, MessageError> {
    STANDARD
        .decode(value.as_bytes())
        .map_err(|e| MessageError::Base64 {
            field,
            reason: e.to_string(),
        })
}

/// `sha256:<hex>` digest of a payload, used in logs and acknowledgements.
pub fn content_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

// =============================================================================
// Message kinds
// =============================================================================

/// A file shipped inline with the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFile {
    /// Absolute path inside the container.
    pub dest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Octal permission bits; defaults to 0644 (0755 when executable).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(default)]
    pub executable: bool,
    /// Base64 payload.
    pub data: String,
}

impl LocalFile {
    pub fn decode(&self) -> Result<Vec<u8>, MessageError> {
        decode_b64("local_file.data", &self.data)
    }

    pub fn file_mode(&self) -> u32 {
        file_mode(self.mode, self.executable)
    }
}

/// A file fetched over HTTP before upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub url: String,
    pub dest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(default)]
    pub executable: bool,
}

impl RemoteFile {
    pub fn file_mode(&self) -> u32 {
        file_mode(self.mode, self.executable)
    }
}

fn file_mode(mode: Option<u32>, executable: bool) -> u32 {
    match (mode, executable) {
        (Some(mode), _) => mode & 0o7777,
        (None, true) => 0o755,
        (None, false) => 0o644,
    }
}

/// A dotenv file fetched over HTTP and merged into the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEnv {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecretTarget {
    Env {
        name: String,
    },
    File {
        dest: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
}

/// A secret value delivered as an environment variable or a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineSecret {
    pub target: SecretTarget,
    /// Base64 secret value.
    pub value: String,
}

impl InlineSecret {
    pub fn decode(&self) -> Result<Vec<u8>, MessageError> {
        decode_b64("inline_secret.value", &self.value)
    }

    /// Secret as a UTF-8 string, for environment targets.
    pub fn decode_string(&self) -> Result<String, MessageError> {
        String::from_utf8(self.decode()?).map_err(|_| MessageError::InvalidField {
            kind: "inline_secret",
            reason: "value is not valid UTF-8".to_string(),
        })
    }
}

impl std::fmt::Display for InlineSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.target {
            SecretTarget::Env { name } => write!(f, "env {name}=[REDACTED]"),
            SecretTarget::File { dest, .. } => write!(f, "file {dest} [REDACTED]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InlineEnv {
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// A request for node-local devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedResourceRequest {
    pub name: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCommit {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdHocCommand {
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRequest {
    /// Signal name (`SIGHUP`) or number (`1`).
    pub signal: String,
}

// =============================================================================
// Task custom data
// =============================================================================

/// Resource overrides carried in the task custom data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,
}

/// The decoded `TaskInfo.data` blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskData {
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl TaskData {
    /// Decodes the blob. Accepts raw JSON or base64-wrapped JSON, and
    /// validates every message for the launch phase.
    pub fn decode(raw: &[u8]) -> Result<Self, MessageError> {
        let trimmed = trim_ascii(raw);
        if trimmed.is_empty() {
            return Ok(Self::default());
        }

        let data: Self = if trimmed.first() == Some(&b'{') {
            serde_json::from_slice(trimmed)?
        } else {
            let json = STANDARD
                .decode(trimmed)
                .map_err(|e| MessageError::Base64 {
                    field: "task data",
                    reason: e.to_string(),
                })?;
            serde_json::from_slice(&json)?
        };

        for message in &data.messages {
            message.validate(Phase::Launch)?;
        }
        Ok(data)
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn trim_ascii(raw: &[u8]) -> &[u8] {
    let start = raw
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(raw.len());
    let end = raw
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &raw[start..end]
}

// =============================================================================
// Framework message envelope
// =============================================================================

/// A runtime message addressed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn decode(raw: &[u8]) -> Result<Self, MessageError> {
        let envelope: Self = serde_json::from_slice(raw)?;
        envelope.message.validate(Phase::Runtime)?;
        Ok(envelope)
    }
}

/// Reply sent for every framework message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    pub id: String,
    pub kind: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl MessageAck {
    pub fn ok(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            success: true,
            message: None,
            output: None,
        }
    }

    pub fn failed(id: impl Into<String>, kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            success: false,
            message: Some(reason.into()),
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }
}
