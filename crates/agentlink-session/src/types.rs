//! Wire and state types shared by connections and sessions.

use std::fmt;

use agentlink_plugins::CommandOutcome;
use agentlink_transport::ProcessExit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The link dropped unexpectedly and has not been re-established.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// `session.lifecycle` notification from the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Connection-scoped event.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// The agent was restarted after an unexpected exit. Remote session
    /// state may be stale; sessions should be resumed.
    Restarted { attempt: u32 },
    /// The link dropped. `exit` is set when we spawned the agent and it exited.
    AgentExited { exit: Option<ProcessExit> },
    Lifecycle(LifecycleEvent),
    /// Any other session-less notification, verbatim.
    Notification { method: String, params: Value },
}

/// Persisted session as listed by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub session_id: String,
    pub modified_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub protocol_version: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetStatusResponse {
    pub version: String,
    pub protocol_version: u32,
}

/// A model the agent can use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of [`Session::send`](crate::Session::send).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The agent accepted the message.
    Accepted { message_id: Option<String> },
    /// The text was a `/plugins` command and was handled locally.
    Command(CommandOutcome),
}

/// Whether a session is processing a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnState {
    Idle,
    Active,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_metadata_from_wire() {
        let meta: SessionMetadata = serde_json::from_value(json!({
            "sessionId": "s1",
            "modifiedTime": "2026-03-01T10:00:00Z",
            "summary": "refactor parser",
            "isRemote": false
        }))
        .unwrap();
        assert_eq!(meta.session_id, "s1");
        assert_eq!(meta.summary.as_deref(), Some("refactor parser"));
        assert!(meta.start_time.is_none());
    }

    #[test]
    fn test_lifecycle_event_shape() {
        let event: LifecycleEvent = serde_json::from_value(json!({
            "type": "session.created",
            "sessionId": "abc"
        }))
        .unwrap();
        assert_eq!(event.kind, "session.created");
        assert_eq!(ConnectionState::Error.to_string(), "error");
    }
}
