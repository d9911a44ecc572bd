//! Hook kinds and their input/output contracts.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The fixed set of hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookKind {
    Load,
    SessionCreated,
    UserPromptSubmitted,
    PreToolUse,
    PostToolUse,
    ErrorOccurred,
    SessionEvent,
    SessionEnd,
    Unload,
}

impl HookKind {
    pub const ALL: [Self; 9] = [
        Self::Load,
        Self::SessionCreated,
        Self::UserPromptSubmitted,
        Self::PreToolUse,
        Self::PostToolUse,
        Self::ErrorOccurred,
        Self::SessionEvent,
        Self::SessionEnd,
        Self::Unload,
    ];

    /// Handler name, e.g. `onPreToolUse`.
    #[must_use]
    pub const fn handler_name(self) -> &'static str {
        match self {
            Self::Load => "onLoad",
            Self::SessionCreated => "onSessionCreated",
            Self::UserPromptSubmitted => "onUserPromptSubmitted",
            Self::PreToolUse => "onPreToolUse",
            Self::PostToolUse => "onPostToolUse",
            Self::ErrorOccurred => "onErrorOccurred",
            Self::SessionEvent => "onSessionEvent",
            Self::SessionEnd => "onSessionEnd",
            Self::Unload => "onUnload",
        }
    }

    /// Hook types the agent may ask us to run through `hooks.invoke`.
    #[must_use]
    pub fn from_remote(hook_type: &str) -> Option<Self> {
        match hook_type {
            "preToolUse" => Some(Self::PreToolUse),
            "postToolUse" => Some(Self::PostToolUse),
            "errorOccurred" => Some(Self::ErrorOccurred),
            _ => None,
        }
    }

    const fn bit(self) -> u16 {
        1 << self as u16
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.handler_name())
    }
}

/// Hooks a plugin implements. Fixed when the plugin is registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookSet(u16);

impl HookSet {
    #[must_use]
    pub const fn contains(self, kind: HookKind) -> bool {
        self.0 & kind.bit() != 0
    }

    #[must_use]
    pub const fn with(self, kind: HookKind) -> Self {
        Self(self.0 | kind.bit())
    }

    #[must_use]
    pub fn kinds(self) -> Vec<HookKind> {
        HookKind::ALL.into_iter().filter(|k| self.contains(*k)).collect()
    }
}

impl FromIterator<HookKind> for HookSet {
    fn from_iter<I: IntoIterator<Item = HookKind>>(iter: I) -> Self {
        iter.into_iter().fold(Self::default(), Self::with)
    }
}

/// Failure reported by a hook handler. Never propagates past the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HookError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

pub type HookResult<T> = std::result::Result<T, HookError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPromptInput {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub prompt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPromptOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<String>,
    /// Set to stop the prompt from being sent. Later plugins do not run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject: Option<String>,
}

impl UserPromptOutput {
    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            reject: Some(reason.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn rewrite(prompt: impl Into<String>) -> Self {
        Self {
            modified_prompt: Some(prompt.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreToolUseInput {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Filled from the request envelope when the agent leaves it out.
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub tool_args: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
    Ask,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreToolUseOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_decision: Option<PermissionDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_decision_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppress_output: Option<bool>,
}

impl PreToolUseOutput {
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            permission_decision: Some(PermissionDecision::Deny),
            permission_decision_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn allow() -> Self {
        Self {
            permission_decision: Some(PermissionDecision::Allow),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_denied(&self) -> bool {
        self.permission_decision == Some(PermissionDecision::Deny)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostToolUseInput {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub tool_args: Value,
    #[serde(default)]
    pub tool_result: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostToolUseOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppress_output: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOccurredInput {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub error: String,
    /// Where the error happened, e.g. `model_call` or `tool_execution`.
    #[serde(default)]
    pub error_context: String,
    #[serde(default)]
    pub recoverable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorHandling {
    Retry,
    Skip,
    Abort,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOccurredOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppress_output: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_notification: Option<String>,
}

impl ErrorOccurredOutput {
    /// Overlay the fields `later` sets.
    #[must_use]
    pub fn merge(self, later: Self) -> Self {
        Self {
            suppress_output: later.suppress_output.or(self.suppress_output),
            error_handling: later.error_handling.or(self.error_handling),
            retry_count: later.retry_count.or(self.retry_count),
            user_notification: later.user_notification.or(self.user_notification),
        }
    }
}
