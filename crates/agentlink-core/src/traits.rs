//! Seams implemented by the host application.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::SessionEvent;

/// Read-only view of a session handed to plugins.
pub trait SessionHandle: Send + Sync {
    /// Agent-assigned session id.
    fn session_id(&self) -> &str;

    /// History snapshot at call time.
    fn messages(&self) -> Vec<SessionEvent>;

    /// Workspace directory reported by the agent, if any.
    fn workspace_path(&self) -> Option<&str> {
        None
    }
}

/// A tool call requested by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Outcome of a tool call, as reported back to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub text_result_for_llm: String,
    /// `"success"` or `"failure"`.
    pub result_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_log: Option<String>,
}

impl ToolResult {
    #[must_use]
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text_result_for_llm: text.into(),
            result_type: "success".to_string(),
            error: None,
            session_log: None,
        }
    }

    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            text_result_for_llm: "Invoking this tool produced an error.".to_string(),
            result_type: "failure".to_string(),
            error: Some(error.into()),
            session_log: None,
        }
    }

    /// Result for a tool the session never registered.
    #[must_use]
    pub fn unsupported(tool_name: &str) -> Self {
        Self {
            text_result_for_llm: format!("Tool '{tool_name}' is not supported by this client."),
            result_type: "failure".to_string(),
            error: Some(format!("tool '{tool_name}' not supported")),
            session_log: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result_type == "success"
    }
}

/// Handler behind a caller-defined tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool. Errors are reported to the agent as a failure result.
    async fn call(&self, invocation: ToolInvocation) -> crate::Result<ToolResult>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(ToolInvocation) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = crate::Result<ToolResult>> + Send,
{
    async fn call(&self, invocation: ToolInvocation) -> crate::Result<ToolResult> {
        (self)(invocation).await
    }
}

/// Permission request raised by the agent before a sensitive operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Operation category, e.g. `shell`, `write`, `url`.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Decision returned for a [`PermissionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResult {
    /// `approved` or one of the `denied-*` kinds.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<Value>>,
}

impl PermissionResult {
    #[must_use]
    pub fn approved() -> Self {
        Self {
            kind: "approved".to_string(),
            rules: None,
        }
    }

    #[must_use]
    pub fn denied() -> Self {
        Self {
            kind: "denied-interactively-by-user".to_string(),
            rules: None,
        }
    }

    #[must_use]
    pub fn is_approved(&self) -> bool {
        self.kind == "approved"
    }
}

/// Trait for handling permission requests.
///
/// Implement this trait to integrate with your approval UI. Sessions without
/// a handler approve everything.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn request_permission(
        &self,
        session_id: &str,
        request: PermissionRequest,
    ) -> PermissionResult;
}

/// Approves every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl PermissionHandler for AutoApprove {
    async fn request_permission(
        &self,
        _session_id: &str,
        _request: PermissionRequest,
    ) -> PermissionResult {
        PermissionResult::approved()
    }
}

/// Question the agent wants the user to answer mid-turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputRequest {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_freeform: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputResponse {
    pub answer: String,
    #[serde(default)]
    pub was_freeform: bool,
}

impl UserInputResponse {
    #[must_use]
    pub fn freeform(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            was_freeform: true,
        }
    }

    #[must_use]
    pub fn choice(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            was_freeform: false,
        }
    }
}

/// Answers [`UserInputRequest`]s. Sessions without one refuse such requests.
#[async_trait]
pub trait UserInputHandler: Send + Sync {
    async fn request_user_input(
        &self,
        session_id: &str,
        request: UserInputRequest,
    ) -> crate::Result<UserInputResponse>;
}
