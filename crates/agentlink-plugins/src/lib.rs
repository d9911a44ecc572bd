//! Plugin pipeline for agent sessions.
//!
//! Plugins are named bundles of hooks run in registration order at fixed
//! points of a session: prompt submission, tool use, errors, events and the
//! session lifecycle. The [`PluginManager`] owns the ordered pipeline, the
//! enable/disable state, the `/plugins` management commands and every
//! plugin's per-session data.

mod error;

pub mod commands;
pub mod hooks;
pub mod manager;
pub mod plugin;
pub mod registry;
pub mod store;

pub use commands::{CommandOutcome, PluginCommand, PluginSummary, COMMAND_PREFIX};
pub use error::PluginError;
pub use hooks::{
    ErrorHandling, ErrorOccurredInput, ErrorOccurredOutput, HookError, HookKind, HookResult,
    HookSet, PermissionDecision, PostToolUseInput, PostToolUseOutput, PreToolUseInput,
    PreToolUseOutput, UserPromptInput, UserPromptOutput,
};
pub use manager::{HookFault, PluginManager, PromptOutcome};
pub use plugin::{Plugin, PluginContext};
pub use registry::PluginRegistry;
pub use store::{PluginData, PluginDataStore};
