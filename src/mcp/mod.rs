//! Model Context Protocol session runtime.
//!
//! Layers, leaves first: [`endpoint`] describes where a server lives,
//! [`transport`] moves encoded frames, [`codec`] speaks JSON-RPC 2.0,
//! [`client`] correlates calls and runs the session, and [`protocol_log`]
//! records everything that crossed the wire.

pub mod capabilities;
pub mod client;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod protocol_log;
pub mod transport;

pub use capabilities::{Capability, CapabilitySet};
pub use client::{McpSession, ServerDetails, SessionOptions, SessionState};
pub use endpoint::{EndpointDescriptor, TransportKind};
pub use error::{ErrorCategory, ErrorKind, McpError};
pub use protocol_log::{Direction, LogEntry, LogSummary, ProtocolLog};
