//! Ordered hook pipeline over registered plugins.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::FutureExt;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::broadcast;

use agentlink_core::{Error, SessionEvent, SessionHandle, panic_message};

use crate::{
    Plugin, PluginContext, PluginError,
    commands::{AvailablePlugin, CommandOutcome, PluginCommand, PluginSummary},
    hooks::{
        ErrorOccurredInput, ErrorOccurredOutput, HookKind, HookSet, PermissionDecision,
        PostToolUseInput, PostToolUseOutput, PreToolUseInput, PreToolUseOutput, UserPromptInput,
    },
    registry::PluginRegistry,
    store::PluginDataStore,
};

const FAULT_CAPACITY: usize = 64;

/// A hook handler that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFault {
    pub plugin: String,
    pub hook: HookKind,
    pub message: String,
}

/// Net effect of the `onUserPromptSubmitted` chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOutcome {
    pub prompt: String,
    pub additional_context: Vec<String>,
}

impl PromptOutcome {
    /// Text to send: the final prompt followed by any injected context.
    #[must_use]
    pub fn into_message(self) -> String {
        if self.additional_context.is_empty() {
            return self.prompt;
        }
        let mut message = self.prompt;
        message.push_str("\n\n");
        message.push_str(&self.additional_context.join("\n"));
        message
    }
}

struct Registered {
    name: String,
    plugin: Arc<dyn Plugin>,
    hooks: HookSet,
    enabled: AtomicBool,
}

impl Registered {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

/// Runs plugin hooks in registration order.
///
/// One manager belongs to one connection. Chains iterate over a snapshot of
/// the plugin list, so registration changes never disturb a chain that is
/// already running; the enabled flag is rechecked before every handler.
pub struct PluginManager {
    plugins: RwLock<Vec<Arc<Registered>>>,
    store: Arc<PluginDataStore>,
    registry: Arc<PluginRegistry>,
    faults: broadcast::Sender<HookFault>,
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(Arc::new(PluginRegistry::new()))
    }

    #[must_use]
    pub fn with_registry(registry: Arc<PluginRegistry>) -> Self {
        let (faults, _) = broadcast::channel(FAULT_CAPACITY);
        Self {
            plugins: RwLock::new(Vec::new()),
            store: Arc::new(PluginDataStore::new()),
            registry,
            faults,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<PluginDataStore> {
        &self.store
    }

    /// Receiver for hook failures.
    #[must_use]
    pub fn faults(&self) -> broadcast::Receiver<HookFault> {
        self.faults.subscribe()
    }

    /// Append a plugin to the pipeline, enabled, and run its `onLoad`.
    ///
    /// # Errors
    /// Returns `AlreadyRegistered` if the name is taken.
    pub async fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let name = plugin.name().to_string();
        let entry = Arc::new(Registered {
            hooks: plugin.hooks().iter().copied().collect(),
            name: name.clone(),
            plugin,
            enabled: AtomicBool::new(true),
        });
        {
            let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
            if plugins.iter().any(|p| p.name == name) {
                return Err(PluginError::AlreadyRegistered(name));
            }
            plugins.push(Arc::clone(&entry));
        }
        tracing::debug!(plugin = %name, hooks = ?entry.hooks.kinds(), "Registered plugin");

        if entry.hooks.contains(HookKind::Load) {
            self.guarded(&entry, HookKind::Load, entry.plugin.on_load()).await;
        }
        Ok(())
    }

    /// Run the plugin's `onUnload`, then remove it and its data.
    ///
    /// # Errors
    /// Returns `NotRegistered` for an unknown name.
    pub async fn unregister(&self, name: &str) -> Result<(), PluginError> {
        let entry = self
            .find(name)
            .ok_or_else(|| PluginError::NotRegistered(name.to_string()))?;

        if entry.hooks.contains(HookKind::Unload) {
            self.guarded(&entry, HookKind::Unload, entry.plugin.on_unload()).await;
        }
        self.plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|p| !Arc::ptr_eq(p, &entry));
        self.store.remove_plugin(name);
        tracing::debug!(plugin = %name, "Unregistered plugin");
        Ok(())
    }

    /// Enable a plugin in place. Returns `false` if it already was.
    ///
    /// # Errors
    /// Returns `NotRegistered` for an unknown name.
    pub fn enable(&self, name: &str) -> Result<bool, PluginError> {
        self.set_enabled(name, true)
    }

    /// Disable a plugin. Returns `false` if it already was.
    ///
    /// # Errors
    /// Returns `NotRegistered` for an unknown name.
    pub fn disable(&self, name: &str) -> Result<bool, PluginError> {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool, PluginError> {
        let entry = self
            .find(name)
            .ok_or_else(|| PluginError::NotRegistered(name.to_string()))?;
        let changed = entry.enabled.swap(enabled, Ordering::AcqRel) != enabled;
        if changed {
            tracing::info!(plugin = %name, enabled, "Plugin state changed");
        }
        Ok(changed)
    }

    #[must_use]
    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.find(name).map(|p| p.is_enabled())
    }

    /// Registered names in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.all().iter().map(|p| p.name.clone()).collect()
    }

    #[must_use]
    pub fn summaries(&self) -> Vec<PluginSummary> {
        self.all()
            .iter()
            .map(|p| PluginSummary {
                name: p.name.clone(),
                description: p.plugin.description().to_string(),
                enabled: p.is_enabled(),
            })
            .collect()
    }

    fn all(&self) -> Vec<Arc<Registered>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn find(&self, name: &str) -> Option<Arc<Registered>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    fn snapshot(&self, kind: HookKind) -> Vec<Arc<Registered>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|p| p.hooks.contains(kind))
            .cloned()
            .collect()
    }

    fn context(&self, entry: &Registered, session: &Arc<dyn SessionHandle>) -> PluginContext {
        PluginContext {
            session: Arc::clone(session),
            data: self.store.scope(&entry.name, session.session_id()),
        }
    }

    /// Await one handler, converting an error or panic into a fault.
    async fn guarded<T, F>(&self, entry: &Registered, hook: HookKind, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, crate::HookError>>,
    {
        let message = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };
        tracing::warn!(plugin = %entry.name, %hook, "Hook failed: {message}");
        let _ = self.faults.send(HookFault {
            plugin: entry.name.clone(),
            hook,
            message,
        });
        None
    }

    /// Fan out `onSessionCreated`.
    pub async fn session_created(&self, session: &Arc<dyn SessionHandle>) {
        for entry in self.snapshot(HookKind::SessionCreated) {
            if !entry.is_enabled() {
                continue;
            }
            let ctx = self.context(&entry, session);
            self.guarded(&entry, HookKind::SessionCreated, entry.plugin.on_session_created(&ctx))
                .await;
        }
    }

    /// Fan out `onSessionEnd`, then discard the session's plugin data.
    pub async fn session_end(&self, session: &Arc<dyn SessionHandle>) {
        for entry in self.snapshot(HookKind::SessionEnd) {
            if !entry.is_enabled() {
                continue;
            }
            let ctx = self.context(&entry, session);
            self.guarded(&entry, HookKind::SessionEnd, entry.plugin.on_session_end(&ctx))
                .await;
        }
        self.store.close_session(session.session_id());
    }

    /// Run the `onUserPromptSubmitted` chain.
    ///
    /// # Errors
    /// Returns `PromptRejected` when a plugin rejects the prompt; later
    /// plugins are not consulted.
    pub async fn user_prompt_submitted(
        &self,
        session: &Arc<dyn SessionHandle>,
        prompt: &str,
    ) -> agentlink_core::Result<PromptOutcome> {
        let mut outcome = PromptOutcome {
            prompt: prompt.to_string(),
            additional_context: Vec::new(),
        };

        for entry in self.snapshot(HookKind::UserPromptSubmitted) {
            if !entry.is_enabled() {
                continue;
            }
            let ctx = self.context(&entry, session);
            let input = UserPromptInput {
                timestamp: chrono_now_millis(),
                cwd: session.workspace_path().map(str::to_string),
                prompt: outcome.prompt.clone(),
            };
            let Some(Some(out)) = self
                .guarded(
                    &entry,
                    HookKind::UserPromptSubmitted,
                    entry.plugin.on_user_prompt_submitted(&ctx, &input),
                )
                .await
            else {
                continue;
            };

            if let Some(reason) = out.reject {
                tracing::info!(plugin = %entry.name, session_id = %session.session_id(), "Prompt rejected: {reason}");
                return Err(Error::PromptRejected {
                    plugin: entry.name.clone(),
                    reason,
                });
            }
            if let Some(prompt) = out.modified_prompt {
                outcome.prompt = prompt;
            }
            if let Some(context) = out.additional_context {
                outcome.additional_context.push(context);
            }
        }
        Ok(outcome)
    }

    /// Run the `onPreToolUse` chain.
    ///
    /// Every enabled plugin runs, even after a denial, so observers still see
    /// the call. The first denial wins. `None` when no plugin had an opinion.
    pub async fn pre_tool_use(
        &self,
        session: &Arc<dyn SessionHandle>,
        input: PreToolUseInput,
    ) -> Option<PreToolUseOutput> {
        let mut current = input;
        let mut merged = PreToolUseOutput::default();
        let mut contributed = false;
        let mut contexts = Vec::new();

        for entry in self.snapshot(HookKind::PreToolUse) {
            if !entry.is_enabled() {
                continue;
            }
            let ctx = self.context(&entry, session);
            let Some(Some(out)) = self
                .guarded(&entry, HookKind::PreToolUse, entry.plugin.on_pre_tool_use(&ctx, &current))
                .await
            else {
                continue;
            };
            contributed = true;

            let denied = merged.is_denied();
            match out.permission_decision {
                Some(PermissionDecision::Deny) if !denied => {
                    merged.permission_decision = Some(PermissionDecision::Deny);
                    merged.permission_decision_reason = Some(
                        out.permission_decision_reason
                            .unwrap_or_else(|| format!("Denied by plugin '{}'", entry.name)),
                    );
                }
                Some(PermissionDecision::Ask) if !denied => {
                    merged.permission_decision = Some(PermissionDecision::Ask);
                    merged.permission_decision_reason = out.permission_decision_reason;
                }
                Some(PermissionDecision::Allow) if merged.permission_decision.is_none() => {
                    merged.permission_decision = Some(PermissionDecision::Allow);
                }
                _ => {}
            }
            if let Some(args) = out.modified_args {
                if !denied {
                    current.tool_args = args.clone();
                    merged.modified_args = Some(args);
                }
            }
            if let Some(context) = out.additional_context {
                contexts.push(context);
            }
            if out.suppress_output == Some(true) {
                merged.suppress_output = Some(true);
            }
        }

        if !contexts.is_empty() {
            merged.additional_context = Some(contexts.join("\n"));
        }
        contributed.then_some(merged)
    }

    /// Run the `onPostToolUse` chain. A modified result is what later
    /// plugins see.
    pub async fn post_tool_use(
        &self,
        session: &Arc<dyn SessionHandle>,
        input: PostToolUseInput,
    ) -> Option<PostToolUseOutput> {
        let mut current = input;
        let mut merged = PostToolUseOutput::default();
        let mut contributed = false;
        let mut contexts = Vec::new();

        for entry in self.snapshot(HookKind::PostToolUse) {
            if !entry.is_enabled() {
                continue;
            }
            let ctx = self.context(&entry, session);
            let Some(Some(out)) = self
                .guarded(&entry, HookKind::PostToolUse, entry.plugin.on_post_tool_use(&ctx, &current))
                .await
            else {
                continue;
            };
            contributed = true;

            if let Some(result) = out.modified_result {
                current.tool_result = result.clone();
                merged.modified_result = Some(result);
            }
            if let Some(context) = out.additional_context {
                contexts.push(context);
            }
            if out.suppress_output == Some(true) {
                merged.suppress_output = Some(true);
            }
        }

        if !contexts.is_empty() {
            merged.additional_context = Some(contexts.join("\n"));
        }
        contributed.then_some(merged)
    }

    /// Run the `onErrorOccurred` chain; later plugins override earlier fields.
    pub async fn error_occurred(
        &self,
        session: &Arc<dyn SessionHandle>,
        input: ErrorOccurredInput,
    ) -> Option<ErrorOccurredOutput> {
        let mut merged: Option<ErrorOccurredOutput> = None;
        for entry in self.snapshot(HookKind::ErrorOccurred) {
            if !entry.is_enabled() {
                continue;
            }
            let ctx = self.context(&entry, session);
            if let Some(Some(out)) = self
                .guarded(&entry, HookKind::ErrorOccurred, entry.plugin.on_error_occurred(&ctx, &input))
                .await
            {
                merged = Some(merged.unwrap_or_default().merge(out));
            }
        }
        merged
    }

    /// Run the `onSessionEvent` chain. Each plugin sees the event as left by
    /// the previous one.
    pub async fn session_event(
        &self,
        session: &Arc<dyn SessionHandle>,
        event: SessionEvent,
    ) -> SessionEvent {
        let mut current = event;
        for entry in self.snapshot(HookKind::SessionEvent) {
            if !entry.is_enabled() {
                continue;
            }
            let ctx = self.context(&entry, session);
            if let Some(Some(replacement)) = self
                .guarded(&entry, HookKind::SessionEvent, entry.plugin.on_session_event(&ctx, &current))
                .await
            {
                current = replacement;
            }
        }
        current
    }

    /// Answer an agent-side `hooks.invoke`. Returns the hook output, or
    /// `Null` for pass-through and for hook types handled elsewhere.
    pub async fn invoke_remote(
        &self,
        session: &Arc<dyn SessionHandle>,
        hook_type: &str,
        input: Value,
    ) -> Value {
        match HookKind::from_remote(hook_type) {
            Some(HookKind::PreToolUse) => match parse_input::<PreToolUseInput>(hook_type, input) {
                Some(mut input) => {
                    if input.session_id.is_empty() {
                        input.session_id = session.session_id().to_string();
                    }
                    to_output(self.pre_tool_use(session, input).await)
                }
                None => Value::Null,
            },
            Some(HookKind::PostToolUse) => match parse_input::<PostToolUseInput>(hook_type, input) {
                Some(mut input) => {
                    if input.session_id.is_empty() {
                        input.session_id = session.session_id().to_string();
                    }
                    to_output(self.post_tool_use(session, input).await)
                }
                None => Value::Null,
            },
            Some(HookKind::ErrorOccurred) => {
                match parse_input::<ErrorOccurredInput>(hook_type, input) {
                    Some(input) => to_output(self.error_occurred(session, input).await),
                    None => Value::Null,
                }
            }
            _ => {
                tracing::trace!(hook_type, "No client-side handling for hook type");
                Value::Null
            }
        }
    }

    /// Execute a `/plugins` command. `None` when `text` is not one.
    pub async fn handle_command(&self, text: &str) -> Option<CommandOutcome> {
        let command = match PluginCommand::parse(text)? {
            Ok(command) => command,
            Err(message) => return Some(CommandOutcome::Malformed(message)),
        };
        tracing::debug!(?command, "Handling plugin command");

        let outcome = match command {
            PluginCommand::List => CommandOutcome::List(self.summaries()),
            PluginCommand::Help => CommandOutcome::Help,
            PluginCommand::Available => {
                let installed = self.names();
                CommandOutcome::Available(
                    self.registry
                        .available()
                        .into_iter()
                        .map(|(name, description)| AvailablePlugin {
                            installed: installed.contains(&name),
                            name,
                            description,
                        })
                        .collect(),
                )
            }
            PluginCommand::Install(name) => self.install(name).await,
            PluginCommand::Enable(name) => match self.enable(&name) {
                Ok(true) => CommandOutcome::Enabled(name),
                Ok(false) => CommandOutcome::AlreadyEnabled(name),
                Err(_) => CommandOutcome::NotInstalled(name),
            },
            PluginCommand::Disable(name) => match self.disable(&name) {
                Ok(true) => CommandOutcome::Disabled(name),
                Ok(false) => CommandOutcome::AlreadyDisabled(name),
                Err(_) => CommandOutcome::NotInstalled(name),
            },
            PluginCommand::Uninstall(name) => match self.unregister(&name).await {
                Ok(()) => CommandOutcome::Uninstalled(name),
                Err(_) => CommandOutcome::NotInstalled(name),
            },
        };
        Some(outcome)
    }

    async fn install(&self, name: String) -> CommandOutcome {
        if self.find(&name).is_some() {
            return CommandOutcome::AlreadyInstalled(name);
        }
        let Some(plugin) = self.registry.create(&name) else {
            return CommandOutcome::UnknownFactory(name);
        };
        match self.register(plugin).await {
            Ok(()) => CommandOutcome::Installed(name),
            Err(PluginError::AlreadyRegistered(existing)) => {
                CommandOutcome::AlreadyInstalled(existing)
            }
            Err(PluginError::NotRegistered(other)) => CommandOutcome::NotInstalled(other),
        }
    }
}

fn parse_input<T: DeserializeOwned>(hook_type: &str, input: Value) -> Option<T> {
    serde_json::from_value(input)
        .inspect_err(|e| tracing::warn!(hook_type, "Malformed hook input: {e}"))
        .ok()
}

fn to_output<T: Serialize>(output: Option<T>) -> Value {
    output
        .and_then(|o| serde_json::to_value(o).ok())
        .unwrap_or(Value::Null)
}

fn chrono_now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
