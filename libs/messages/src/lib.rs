//! Side-effect messages embedded in task descriptors.
//!
//! A task's opaque `data` field carries a JSON [`TaskData`] blob with
//! resource limits and a list of typed [`Message`]s. The same message union
//! is used at runtime: framework messages arrive as an [`Envelope`] and are
//! answered with a [`MessageAck`].
//!
//! # Format
//!
//! ```text
//! {"resources": {"cpus": 0.5, "memory_mb": 256},
//!  "messages": [{"kind": "inline_env", "vars": {"MODE": "prod"}}]}
//! ```
//!
//! Remote environment files use the dotenv format parsed by [`EnvFile`].

mod dotenv;
mod error;
mod message;

pub use dotenv::{EnvFile, MAX_KEY_LENGTH, MAX_VALUE_LENGTH};
pub use error::MessageError;
pub use message::*;
