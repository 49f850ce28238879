//! Outbound calls sent to the control-plane agent.

use podex_id::{ExecutorId, FrameworkId};
use serde::{Deserialize, Serialize};

use crate::codec::base64_bytes;
use crate::status::TaskStatus;
use crate::task::TaskInfo;

/// A call addressed to the control-plane agent on behalf of this executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    #[serde(flatten)]
    pub kind: CallKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallKind {
    Subscribe { subscribe: Subscribe },
    Update { update: Update },
    Message { message: Message },
}

impl Call {
    pub fn subscribe(
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        subscribe: Subscribe,
    ) -> Self {
        Self {
            framework_id,
            executor_id,
            kind: CallKind::Subscribe { subscribe },
        }
    }

    pub fn update(framework_id: FrameworkId, executor_id: ExecutorId, status: TaskStatus) -> Self {
        Self {
            framework_id,
            executor_id,
            kind: CallKind::Update {
                update: Update { status },
            },
        }
    }

    pub fn message(framework_id: FrameworkId, executor_id: ExecutorId, data: Vec<u8>) -> Self {
        Self {
            framework_id,
            executor_id,
            kind: CallKind::Message {
                message: Message { data },
            },
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self.kind {
            CallKind::Subscribe { .. } => "SUBSCRIBE",
            CallKind::Update { .. } => "UPDATE",
            CallKind::Message { .. } => "MESSAGE",
        }
    }
}

/// Subscription request; carries everything not yet acknowledged so the
/// agent can resynchronize after a reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Subscribe {
    #[serde(default)]
    pub unacknowledged_tasks: Vec<TaskInfo>,
    #[serde(default)]
    pub unacknowledged_updates: Vec<Update>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::TaskState;
    use podex_id::TaskId;

    fn ids() -> (FrameworkId, ExecutorId) {
        (
            FrameworkId::parse("fw-1").unwrap(),
            ExecutorId::parse("exec-1").unwrap(),
        )
    }

    #[test]
    fn test_update_call_shape() {
        let (fw, ex) = ids();
        let status = TaskStatus::new(TaskId::parse("t1").unwrap(), TaskState::Running);
        let call = Call::update(fw, ex, status);
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["type"], "UPDATE");
        assert_eq!(value["framework_id"], "fw-1");
        assert_eq!(value["executor_id"], "exec-1");
        assert_eq!(value["update"]["status"]["state"], "TASK_RUNNING");
        assert_eq!(call.kind(), "UPDATE");
    }

    #[test]
    fn test_subscribe_call_parses_back() {
        let (fw, ex) = ids();
        let call = Call::subscribe(fw, ex, Subscribe::default());
        let json = serde_json::to_string(&call).unwrap();
        let parsed: Call = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, call);
    }

    #[test]
    fn test_message_call_encodes_base64() {
        let (fw, ex) = ids();
        let call = Call::message(fw, ex, b"ok".to_vec());
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["message"]["data"], "b2s=");
    }
}
