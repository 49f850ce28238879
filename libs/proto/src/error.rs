//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Errors that can occur when handling protocol payloads.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The JSON payload is malformed.
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A RecordIO length header could not be parsed.
    #[error("invalid record length header: {0:?}")]
    InvalidLength(String),

    /// A record exceeds the configured maximum size.
    #[error("record too large: {len} bytes (max {max})")]
    RecordTooLarge { len: usize, max: usize },

    /// The stream ended in the middle of a record.
    #[error("stream ended with {0} bytes of incomplete record")]
    Truncated(usize),
}
