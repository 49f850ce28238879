use thiserror::Error;

/// Errors raised while decoding or validating messages.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Payload is not valid JSON for the expected shape.
    #[error("invalid message JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A base64 field failed to decode.
    #[error("invalid base64 in {field}: {reason}")]
    Base64 { field: &'static str, reason: String },

    /// A message field is missing or malformed.
    #[error("invalid {kind} message: {reason}")]
    InvalidField { kind: &'static str, reason: String },

    /// The message kind is not accepted in this phase.
    #[error("{kind} message not allowed at {phase}")]
    NotAllowed {
        kind: &'static str,
        phase: &'static str,
    },

    /// Invalid environment variable name.
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Invalid environment variable value.
    #[error("invalid value for key '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// Malformed dotenv line.
    #[error("parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },
}
