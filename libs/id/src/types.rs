//! Typed ID definitions.

use crate::macros::MAX_EXTERNAL_ID_LEN;
use crate::{define_external_id, define_id, IdError};

// =============================================================================
// Control-plane issued
// =============================================================================

define_external_id!(TaskId);
define_external_id!(ExecutorId);
define_external_id!(FrameworkId);
define_external_id!(AgentId);

// =============================================================================
// Agent generated
// =============================================================================

define_id!(PodId, "pod");

/// Validation shared by all control-plane issued IDs.
#[doc(hidden)]
pub fn validate_external(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.len() > MAX_EXTERNAL_ID_LEN {
        return Err(IdError::TooLong {
            len: s.len(),
            max: MAX_EXTERNAL_ID_LEN,
        });
    }
    if let Some((idx, _)) = s.char_indices().find(|(_, c)| c.is_control()) {
        return Err(IdError::ControlCharacter(idx));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_accepts_opaque_values() {
        let id = TaskId::parse("web.1f2e-3d4c:task").unwrap();
        assert_eq!(id.as_str(), "web.1f2e-3d4c:task");
        assert_eq!(id.to_string(), "web.1f2e-3d4c:task");
    }

    #[test]
    fn test_task_id_rejects_empty() {
        assert!(TaskId::parse("").unwrap_err().is_empty());
    }

    #[test]
    fn test_task_id_rejects_control_chars() {
        assert_eq!(
            TaskId::parse("ab\ncd").unwrap_err(),
            IdError::ControlCharacter(2)
        );
    }

    #[test]
    fn test_task_id_rejects_too_long() {
        let long = "x".repeat(MAX_EXTERNAL_ID_LEN + 1);
        assert!(matches!(
            TaskId::parse(&long),
            Err(IdError::TooLong { .. })
        ));
    }

    #[test]
    fn test_pod_id_format() {
        let id = PodId::new();
        let s = id.to_string();
        assert!(s.starts_with("pod_"));
        assert_eq!(s.parse::<PodId>().unwrap(), id);
    }

    #[test]
    fn test_pod_id_wrong_prefix() {
        let err = PodId::parse("task_01HV4Z2WQXKJNM8GPQY6VBKC3D").unwrap_err();
        assert!(matches!(err, IdError::InvalidPrefix { expected: "pod", .. }));
    }

    #[test]
    fn test_pod_id_short_is_lowercase() {
        let id = PodId::new();
        let short = id.short();
        assert_eq!(short.len(), 26);
        assert_eq!(short, short.to_ascii_lowercase());
    }

    #[test]
    fn test_external_id_serde_is_bare_string() {
        let id = ExecutorId::parse("exec-1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"exec-1\"");
        let back: ExecutorId = serde_json::from_str("\"exec-1\"").unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<ExecutorId>("\"\"").is_err());
    }
}
