//! Task states and status updates.

use podex_id::{AgentId, ExecutorId, TaskId};
use serde::{Deserialize, Serialize};

use crate::codec::base64_opt;

/// Lifecycle state of a task as reported to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    #[serde(rename = "TASK_STAGING")]
    Staging,
    #[serde(rename = "TASK_STARTING")]
    Starting,
    #[serde(rename = "TASK_RUNNING")]
    Running,
    #[serde(rename = "TASK_KILLING")]
    Killing,
    #[serde(rename = "TASK_FINISHED")]
    Finished,
    #[serde(rename = "TASK_FAILED")]
    Failed,
    #[serde(rename = "TASK_KILLED")]
    Killed,
    #[serde(rename = "TASK_ERROR")]
    Error,
    #[serde(rename = "TASK_LOST")]
    Lost,
    #[serde(rename = "TASK_DROPPED")]
    Dropped,
}

impl TaskState {
    /// Whether no further updates follow this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished
                | Self::Failed
                | Self::Killed
                | Self::Error
                | Self::Lost
                | Self::Dropped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "TASK_STAGING",
            Self::Starting => "TASK_STARTING",
            Self::Running => "TASK_RUNNING",
            Self::Killing => "TASK_KILLING",
            Self::Finished => "TASK_FINISHED",
            Self::Failed => "TASK_FAILED",
            Self::Killed => "TASK_KILLED",
            Self::Error => "TASK_ERROR",
            Self::Lost => "TASK_LOST",
            Self::Dropped => "TASK_DROPPED",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusSource {
    SourceMaster,
    SourceAgent,
    #[default]
    SourceExecutor,
}

/// A status update for a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,

    pub state: TaskState,

    #[serde(default)]
    pub source: StatusSource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Opaque payload (base64 on the wire).
    #[serde(
        default,
        with = "base64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,

    /// Seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,

    /// Update identifier echoed back in the acknowledgement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
}

impl TaskStatus {
    pub fn new(task_id: TaskId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            source: StatusSource::SourceExecutor,
            message: None,
            reason: None,
            data: None,
            agent_id: None,
            executor_id: None,
            timestamp: None,
            uuid: None,
            healthy: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_healthy(mut self, healthy: bool) -> Self {
        self.healthy = Some(healthy);
        self
    }

    pub fn with_executor_id(mut self, executor_id: ExecutorId) -> Self {
        self.executor_id = Some(executor_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskState::Staging, false)]
    #[case(TaskState::Starting, false)]
    #[case(TaskState::Running, false)]
    #[case(TaskState::Killing, false)]
    #[case(TaskState::Finished, true)]
    #[case(TaskState::Failed, true)]
    #[case(TaskState::Killed, true)]
    #[case(TaskState::Error, true)]
    #[case(TaskState::Lost, true)]
    #[case(TaskState::Dropped, true)]
    fn test_terminal_states(#[case] state: TaskState, #[case] terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
    }

    #[test]
    fn test_state_wire_names() {
        let json = serde_json::to_string(&TaskState::Running).unwrap();
        assert_eq!(json, "\"TASK_RUNNING\"");
        let state: TaskState = serde_json::from_str("\"TASK_LOST\"").unwrap();
        assert_eq!(state, TaskState::Lost);
        assert_eq!(TaskState::Dropped.to_string(), "TASK_DROPPED");
    }

    #[test]
    fn test_status_builder_serializes_sparse() {
        let status = TaskStatus::new(TaskId::parse("t1").unwrap(), TaskState::Failed)
            .with_message("boom")
            .with_data(b"{}".to_vec());
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "TASK_FAILED");
        assert_eq!(value["message"], "boom");
        assert_eq!(value["data"], "e30=");
        assert_eq!(value["source"], "SOURCE_EXECUTOR");
        assert!(value.get("uuid").is_none());
    }
}
