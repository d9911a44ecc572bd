//! Error taxonomy shared by the transport, session and plugin layers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Error payload reported by the agent for a single call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Agent-defined code for an id missing from its persisted store.
    pub const SESSION_NOT_FOUND: i64 = -32001;

    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// Whether the agent reported that a session id is unknown to it.
    ///
    /// Older agents report this with a generic code, so a message of the
    /// form "session ... not found" is accepted too.
    #[must_use]
    pub fn is_session_not_found(&self) -> bool {
        if self.code == Self::SESSION_NOT_FOUND {
            return true;
        }
        let message = self.message.to_ascii_lowercase();
        match (message.find("session"), message.find("not found")) {
            (Some(subject), Some(missing)) => subject < missing,
            _ => false,
        }
    }
}

/// Errors surfaced by connections, sessions and calls.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Agent executable not found: {0}")]
    ProcessNotFound(String),
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Not connected")]
    NotConnected,
    #[error("Remote error: {0}")]
    Remote(#[from] RpcError),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Prompt rejected by plugin '{plugin}': {reason}")]
    PromptRejected { plugin: String, reason: String },
    #[error("Session {0} is already processing a turn")]
    TurnInProgress(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Protocol version mismatch: expected {expected}, agent reported {actual:?}")]
    ProtocolMismatch { expected: u32, actual: Option<u32> },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Transport failures are fatal to the connection until it restarts.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ProcessNotFound(_)
                | Self::ConnectionRefused(_)
                | Self::ConnectionClosed
                | Self::NotConnected
                | Self::Io(_)
        )
    }

    /// Local timeouts can always be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}
