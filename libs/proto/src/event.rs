//! Inbound events streamed on the subscription connection.

use podex_id::{AgentId, TaskId};
use serde::{Deserialize, Serialize};

use crate::codec::base64_bytes;
use crate::task::{ExecutorInfo, FrameworkInfo, KillPolicy, TaskGroupInfo, TaskInfo};

/// An event received from the control-plane agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Subscribed {
        subscribed: Subscribed,
    },
    Launch {
        launch: Launch,
    },
    LaunchGroup {
        launch_group: LaunchGroup,
    },
    Kill {
        kill: Kill,
    },
    Acknowledged {
        acknowledged: Acknowledged,
    },
    Message {
        message: FrameworkMessage,
    },
    Shutdown,
    Error {
        error: ErrorEvent,
    },
    Heartbeat,
    /// Any event type this agent does not understand.
    #[serde(other)]
    Unknown,
}

impl Event {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribed { .. } => "SUBSCRIBED",
            Self::Launch { .. } => "LAUNCH",
            Self::LaunchGroup { .. } => "LAUNCH_GROUP",
            Self::Kill { .. } => "KILL",
            Self::Acknowledged { .. } => "ACKNOWLEDGED",
            Self::Message { .. } => "MESSAGE",
            Self::Shutdown => "SHUTDOWN",
            Self::Error { .. } => "ERROR",
            Self::Heartbeat => "HEARTBEAT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribed {
    pub executor_info: ExecutorInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_info: Option<FrameworkInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Launch {
    pub task: TaskInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorInfo>,
    pub task_group: TaskGroupInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kill {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_policy: Option<KillPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledged {
    pub task_id: TaskId,
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkMessage {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}
