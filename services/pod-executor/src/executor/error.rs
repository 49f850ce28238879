use podex_messages::MessageError;
use thiserror::Error;

use crate::health::HealthError;
use crate::pod::PodError;

/// Errors turning task descriptors into a running pod.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("task {task_id}: {reason}")]
    InvalidTask { task_id: String, reason: String },

    #[error("task {task_id}: invalid custom data: {source}")]
    TaskData {
        task_id: String,
        #[source]
        source: MessageError,
    },

    #[error("task {task_id}: invalid health check: {source}")]
    HealthCheck {
        task_id: String,
        #[source]
        source: HealthError,
    },

    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("extended resource allocation failed: {0}")]
    Allocation(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Pod(#[from] PodError),
}

impl ExecutorError {
    pub(crate) fn invalid(task_id: &impl ToString, reason: impl Into<String>) -> Self {
        ExecutorError::InvalidTask {
            task_id: task_id.to_string(),
            reason: reason.into(),
        }
    }
}
