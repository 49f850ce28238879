//! # podex-proto
//!
//! Wire model for the executor control-plane protocol.
//!
//! The agent speaks JSON over a long-lived HTTP connection:
//!
//! - Outbound `Call`s (`SUBSCRIBE`, `UPDATE`, `MESSAGE`) are POSTed to the
//!   control-plane agent.
//! - The `SUBSCRIBE` response stays open and carries inbound `Event`s,
//!   framed with RecordIO (`<length>\n<json>`).
//!
//! ## Modules
//!
//! - `task`: task descriptors, container/health-check/kill-policy specs
//! - `status`: task states and status updates
//! - `event`: inbound events
//! - `call`: outbound calls
//! - `recordio`: stream framing

mod call;
mod codec;
mod error;
mod event;
pub mod recordio;
mod status;
mod task;

pub use call::*;
pub use error::ProtoError;
pub use event::*;
pub use status::*;
pub use task::*;
