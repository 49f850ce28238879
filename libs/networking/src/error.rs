use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// No backend registered for the pod's network mode.
    #[error("no network backend for mode {0:?}")]
    UnknownMode(String),

    /// The pod has not exposed a piece of identity the backend needs.
    #[error("pod {pod} has no {what}")]
    MissingIdentity { pod: String, what: &'static str },

    /// Backend configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// A CNI plugin reported failure.
    #[error("plugin {plugin} failed (code {code}): {msg}")]
    Plugin { plugin: String, code: u32, msg: String },

    /// A plugin result could not be interpreted.
    #[error("invalid plugin result: {0}")]
    InvalidResult(String),

    /// Setup was refused (used by test backends).
    #[error("network setup failed: {0}")]
    SetupFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
