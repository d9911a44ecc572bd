//! The plugin trait.

use std::sync::Arc;

use async_trait::async_trait;

use agentlink_core::{SessionEvent, SessionHandle};

use crate::{
    hooks::{
        ErrorOccurredInput, ErrorOccurredOutput, HookKind, HookResult, PostToolUseInput,
        PostToolUseOutput, PreToolUseInput, PreToolUseOutput, UserPromptInput, UserPromptOutput,
    },
    store::PluginData,
};

/// What a hook handler sees of the session it runs for.
#[derive(Clone)]
pub struct PluginContext {
    pub session: Arc<dyn SessionHandle>,
    /// This plugin's private data for this session.
    pub data: PluginData,
}

impl PluginContext {
    #[must_use]
    pub fn session_id(&self) -> &str {
        self.session.session_id()
    }
}

/// A named bundle of hook handlers.
///
/// Only the hooks listed by [`Plugin::hooks`] are ever invoked; the set is
/// read once at registration. Every handler defaults to a pass-through, so
/// implementors override just what they declare.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique name.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Hooks this plugin implements.
    fn hooks(&self) -> &[HookKind];

    async fn on_load(&self) -> HookResult<()> {
        Ok(())
    }

    async fn on_session_created(&self, _ctx: &PluginContext) -> HookResult<()> {
        Ok(())
    }

    /// May rewrite the prompt, add context, or reject the send.
    async fn on_user_prompt_submitted(
        &self,
        _ctx: &PluginContext,
        _input: &UserPromptInput,
    ) -> HookResult<Option<UserPromptOutput>> {
        Ok(None)
    }

    async fn on_pre_tool_use(
        &self,
        _ctx: &PluginContext,
        _input: &PreToolUseInput,
    ) -> HookResult<Option<PreToolUseOutput>> {
        Ok(None)
    }

    async fn on_post_tool_use(
        &self,
        _ctx: &PluginContext,
        _input: &PostToolUseInput,
    ) -> HookResult<Option<PostToolUseOutput>> {
        Ok(None)
    }

    async fn on_error_occurred(
        &self,
        _ctx: &PluginContext,
        _input: &ErrorOccurredInput,
    ) -> HookResult<Option<ErrorOccurredOutput>> {
        Ok(None)
    }

    /// Returning `Some` replaces the event for later plugins and subscribers.
    async fn on_session_event(
        &self,
        _ctx: &PluginContext,
        _event: &SessionEvent,
    ) -> HookResult<Option<SessionEvent>> {
        Ok(None)
    }

    async fn on_session_end(&self, _ctx: &PluginContext) -> HookResult<()> {
        Ok(())
    }

    async fn on_unload(&self) -> HookResult<()> {
        Ok(())
    }
}
