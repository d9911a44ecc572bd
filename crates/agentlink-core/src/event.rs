//! Session events produced by the agent.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Fixed event vocabulary.
///
/// Types the client does not know about deserialize to `Unknown`, which
/// keeps the wire name so the event is forwarded and re-serialized as the
/// agent sent it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionEventType {
    SessionStart,
    SessionResume,
    SessionIdle,
    SessionError,
    SessionInfo,
    SessionModelChange,
    UserMessage,
    AssistantTurnStart,
    AssistantMessage,
    AssistantMessageDelta,
    AssistantTurnEnd,
    ToolExecutionStart,
    ToolExecutionComplete,
    Abort,
    Unknown(String),
}

impl SessionEventType {
    /// Wire name of the event type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::SessionStart => "session.start",
            Self::SessionResume => "session.resume",
            Self::SessionIdle => "session.idle",
            Self::SessionError => "session.error",
            Self::SessionInfo => "session.info",
            Self::SessionModelChange => "session.model_change",
            Self::UserMessage => "user.message",
            Self::AssistantTurnStart => "assistant.turn_start",
            Self::AssistantMessage => "assistant.message",
            Self::AssistantMessageDelta => "assistant.message_delta",
            Self::AssistantTurnEnd => "assistant.turn_end",
            Self::ToolExecutionStart => "tool.execution_start",
            Self::ToolExecutionComplete => "tool.execution_complete",
            Self::Abort => "abort",
            Self::Unknown(name) => name,
        }
    }

    #[must_use]
    pub fn from_wire(name: String) -> Self {
        match name.as_str() {
            "session.start" => Self::SessionStart,
            "session.resume" => Self::SessionResume,
            "session.idle" => Self::SessionIdle,
            "session.error" => Self::SessionError,
            "session.info" => Self::SessionInfo,
            "session.model_change" => Self::SessionModelChange,
            "user.message" => Self::UserMessage,
            "assistant.turn_start" => Self::AssistantTurnStart,
            "assistant.message" => Self::AssistantMessage,
            "assistant.message_delta" => Self::AssistantMessageDelta,
            "assistant.turn_end" => Self::AssistantTurnEnd,
            "tool.execution_start" => Self::ToolExecutionStart,
            "tool.execution_complete" => Self::ToolExecutionComplete,
            "abort" => Self::Abort,
            _ => Self::Unknown(name),
        }
    }

    /// Events that end an active turn.
    #[must_use]
    pub const fn ends_turn(&self) -> bool {
        matches!(self, Self::SessionIdle | Self::SessionError | Self::Abort)
    }

    #[must_use]
    pub const fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl Serialize for SessionEventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SessionEventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from_wire)
    }
}

impl fmt::Display for SessionEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific payload. Commonly used fields are typed; everything else
/// is preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One event in a session's stream. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<bool>,
    #[serde(rename = "type")]
    pub r#type: SessionEventType,
    #[serde(default)]
    pub data: EventData,
}

impl SessionEvent {
    /// Build a locally synthesized event.
    #[must_use]
    pub fn new(r#type: SessionEventType, data: EventData) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            parent_id: None,
            ephemeral: None,
            r#type,
            data,
        }
    }

    /// Assistant message content, if this is an assistant message.
    #[must_use]
    pub fn assistant_content(&self) -> Option<&str> {
        match self.r#type {
            SessionEventType::AssistantMessage => self.data.content.as_deref(),
            _ => None,
        }
    }

    /// Error message carried by a `session.error` event.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self.r#type {
            SessionEventType::SessionError => self.data.message.as_deref(),
            _ => None,
        }
    }
}
