//! Framework messages applied to a running pod.
//!
//! Every envelope gets exactly one [`MessageAck`], success or not. Handler
//! failures never touch pod health.

use futures_util::future::try_join_all;
use podex_id::TaskId;
use podex_messages::{content_digest, Envelope, Message, MessageAck};
use tracing::{info, warn};

use super::fetch;
use crate::runtime::{ContainerRuntime, ResourceSpec, UploadFile};

/// A member a message can be applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTarget {
    pub task_id: TaskId,
    pub container_id: String,
}

pub struct MessageHandler<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub http: &'a reqwest::Client,
}

impl MessageHandler<'_> {
    /// Decodes and applies one framework message.
    pub async fn handle(&self, raw: &[u8], targets: &[MessageTarget]) -> MessageAck {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Rejected malformed framework message");
                return MessageAck::failed("", "unknown", e.to_string());
            }
        };

        let id = envelope.id.clone();
        let kind = envelope.message.kind();
        let selected: Vec<&MessageTarget> = match &envelope.task_id {
            Some(task_id) => targets
                .iter()
                .filter(|t| t.task_id.as_str() == task_id)
                .collect(),
            None => targets.iter().collect(),
        };
        if selected.is_empty() {
            let reason = match &envelope.task_id {
                Some(task_id) => format!("no running container for task {task_id}"),
                None => "no running containers".to_string(),
            };
            return MessageAck::failed(id, kind, reason);
        }

        match self.apply(&envelope.message, &selected).await {
            Ok(ack) => {
                info!(message_id = %id, kind, targets = selected.len(), "Framework message applied");
                MessageAck { id, ..ack }
            }
            Err(reason) => {
                warn!(message_id = %id, kind, reason = %reason, "Framework message failed");
                MessageAck::failed(id, kind, reason)
            }
        }
    }

    async fn apply(&self, message: &Message, targets: &[&MessageTarget]) -> Result<MessageAck, String> {
        let kind = message.kind();
        match message {
            Message::LocalFile(file) => {
                let data = file.decode().map_err(|e| e.to_string())?;
                let digest = content_digest(&data);
                let upload = UploadFile {
                    dest: file.dest.clone(),
                    data,
                    mode: file.file_mode(),
                    user: file.user.clone(),
                };
                self.upload_all(targets, &upload).await?;
                Ok(MessageAck::ok("", kind).with_message(digest))
            }
            Message::RemoteFile(file) => {
                let data = fetch::fetch_bytes(self.http, &file.url)
                    .await
                    .map_err(|e| e.to_string())?;
                let digest = content_digest(&data);
                let upload = UploadFile {
                    dest: file.dest.clone(),
                    data,
                    mode: file.file_mode(),
                    user: file.user.clone(),
                };
                self.upload_all(targets, &upload).await?;
                Ok(MessageAck::ok("", kind).with_message(digest))
            }
            Message::ResourceUpdate(update) => {
                let resources = ResourceSpec {
                    cpus: update.cpus,
                    memory_mb: update.memory_mb,
                    cpu_shares: None,
                };
                try_join_all(targets.iter().map(|t| async move {
                    self.runtime
                        .update_resources(&t.container_id, &resources)
                        .await
                        .map_err(|e| format!("{}: {e}", t.task_id))
                }))
                .await?;
                Ok(MessageAck::ok("", kind))
            }
            Message::Signal(request) => {
                try_join_all(targets.iter().map(|t| async move {
                    self.runtime
                        .kill_container(&t.container_id, &request.signal)
                        .await
                        .map_err(|e| format!("{}: {e}", t.task_id))
                }))
                .await?;
                Ok(MessageAck::ok("", kind))
            }
            Message::ImageCommit(commit) => {
                let target = single(targets, kind)?;
                let image = self
                    .runtime
                    .commit_image(&target.container_id, &commit.repository, commit.tag.as_deref())
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(MessageAck::ok("", kind).with_output(image))
            }
            Message::AdHocCommand(command) => {
                let target = single(targets, kind)?;
                let output = self
                    .runtime
                    .run_command(&target.container_id, &command.argv)
                    .await
                    .map_err(|e| e.to_string())?;
                if output.exit_code == 0 {
                    Ok(MessageAck::ok("", kind).with_output(output.output))
                } else {
                    Ok(MessageAck::failed("", kind, format!("exit code {}", output.exit_code))
                        .with_output(output.output))
                }
            }
            other => Err(format!("{} is not allowed at runtime", other.kind())),
        }
    }

    async fn upload_all(&self, targets: &[&MessageTarget], file: &UploadFile) -> Result<(), String> {
        for target in targets {
            self.runtime
                .upload_to_container(&target.container_id, file)
                .await
                .map_err(|e| format!("{}: {e}", target.task_id))?;
        }
        Ok(())
    }
}

/// Messages producing one result need one container.
fn single<'a>(targets: &[&'a MessageTarget], kind: &str) -> Result<&'a MessageTarget, String> {
    match targets {
        [one] => Ok(one),
        _ => Err(format!(
            "{kind} needs a task_id when the pod has {} containers",
            targets.len()
        )),
    }
}
