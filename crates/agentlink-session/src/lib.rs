//! Connection and session management for agent processes.
//!
//! Provides:
//! - `Connection` - One agent process: start/stop, restart, handshake and request routing
//! - `Session` - A conversation: send, wait, abort, event history and subscriptions
//! - `SessionRegistry` - Routes agent notifications to the session they belong to

pub mod connection;
pub mod registry;
pub mod session;
pub mod types;

#[cfg(test)]
mod testing;

pub use connection::Connection;
pub use registry::SessionRegistry;
pub use session::Session;
pub use types::{
    ConnectionEvent, ConnectionState, GetStatusResponse, LifecycleEvent, ModelInfo, PingResponse,
    SendOutcome, SessionMetadata, TurnState,
};
