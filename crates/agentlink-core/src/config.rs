//! Client and session configuration.

use std::{collections::HashMap, fmt, path::PathBuf, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    Error, Result,
    traits::{PermissionHandler, ToolHandler, UserInputHandler},
};

/// Environment variable overriding the agent executable.
pub const CLI_PATH_ENV: &str = "COPILOT_CLI_PATH";
/// Environment variable naming an already-running agent endpoint.
pub const CLI_URL_ENV: &str = "COPILOT_CLI_URL";

/// Options for a connection to the agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Explicit agent executable (may include leading arguments).
    pub cli_path: Option<String>,
    /// Extra arguments placed before the transport flags.
    pub cli_args: Vec<String>,
    /// Endpoint of an already-running agent: `port`, `host:port` or `http://host:port`.
    pub cli_url: Option<String>,
    /// Talk to a spawned agent over stdio instead of TCP.
    pub use_stdio: bool,
    /// Port for a spawned TCP agent; 0 picks a random free port.
    pub port: u16,
    /// Working directory for a spawned agent.
    pub cwd: Option<PathBuf>,
    /// Extra environment for a spawned agent.
    pub env: HashMap<String, String>,
    /// Log level passed to the agent.
    pub log_level: String,
    /// Start on first use.
    pub auto_start: bool,
    /// Restart after an unexpected agent exit.
    pub auto_restart: bool,
    /// Default deadline for a single RPC call.
    pub request_timeout: Duration,
    /// Overall bound for a graceful `stop()`.
    pub stop_timeout: Duration,
    /// How long to wait for a spawned TCP agent to announce its port.
    pub port_discovery_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            cli_path: None,
            cli_args: Vec::new(),
            cli_url: None,
            use_stdio: true,
            port: 0,
            cwd: None,
            env: HashMap::new(),
            log_level: "info".to_string(),
            auto_start: true,
            auto_restart: true,
            request_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
            port_discovery_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `COPILOT_CLI_PATH` / `COPILOT_CLI_URL`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(path) = std::env::var(CLI_PATH_ENV) {
            if !path.trim().is_empty() {
                options.cli_path = Some(path);
            }
        }
        if let Ok(url) = std::env::var(CLI_URL_ENV) {
            if !url.trim().is_empty() {
                options.cli_url = Some(url);
                options.use_stdio = false;
            }
        }
        options
    }

    #[must_use]
    pub fn cli_path(mut self, path: impl Into<String>) -> Self {
        self.cli_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn cli_args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.cli_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Attach to a running agent. Turns `use_stdio` off.
    #[must_use]
    pub fn cli_url(mut self, url: impl Into<String>) -> Self {
        self.cli_url = Some(url.into());
        self.use_stdio = false;
        self
    }

    #[must_use]
    pub const fn use_stdio(mut self, use_stdio: bool) -> Self {
        self.use_stdio = use_stdio;
        self
    }

    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    #[must_use]
    pub const fn auto_start(mut self, enabled: bool) -> Self {
        self.auto_start = enabled;
        self
    }

    #[must_use]
    pub const fn auto_restart(mut self, enabled: bool) -> Self {
        self.auto_restart = enabled;
        self
    }

    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Reject contradictory settings before anything is spawned.
    ///
    /// # Errors
    /// Returns `InvalidConfig` when `cli_url` is combined with a spawn option.
    pub fn validate(&self) -> Result<()> {
        if self.cli_url.is_some() && self.cli_path.is_some() {
            return Err(Error::InvalidConfig(
                "cli_url is mutually exclusive with cli_path".to_string(),
            ));
        }
        if self.cli_url.is_some() && self.use_stdio {
            return Err(Error::InvalidConfig(
                "cli_url is mutually exclusive with use_stdio".to_string(),
            ));
        }
        if self.cli_url.is_some() && self.port != 0 {
            return Err(Error::InvalidConfig(
                "cli_url is mutually exclusive with port".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "request_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// How the system message is combined with the agent's default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMessageMode {
    Append,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessageConfig {
    pub mode: SystemMessageMode,
    pub content: String,
}

/// How much reasoning the model spends before answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
    Xhigh,
}

/// Background context compaction, letting a session outgrow the model's
/// context window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfiniteSessionConfig {
    pub enabled: bool,
    /// Context usage (0.0 to 1.0) at which compaction starts in the background.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_compaction_threshold: Option<f64>,
    /// Context usage (0.0 to 1.0) at which the session blocks until compaction ends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_exhaustion_threshold: Option<f64>,
}

impl InfiniteSessionConfig {
    #[must_use]
    pub const fn enabled() -> Self {
        Self {
            enabled: true,
            background_compaction_threshold: None,
            buffer_exhaustion_threshold: None,
        }
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            background_compaction_threshold: None,
            buffer_exhaustion_threshold: None,
        }
    }

    #[must_use]
    pub const fn thresholds(mut self, background: f64, exhaustion: f64) -> Self {
        self.background_compaction_threshold = Some(background);
        self.buffer_exhaustion_threshold = Some(exhaustion);
        self
    }

    fn validate(&self) -> Result<()> {
        let in_range = |t: Option<f64>| t.is_none_or(|t| (0.0..=1.0).contains(&t));
        if !in_range(self.background_compaction_threshold)
            || !in_range(self.buffer_exhaustion_threshold)
        {
            return Err(Error::InvalidConfig(
                "infinite session thresholds must lie between 0 and 1".to_string(),
            ));
        }
        if let (Some(background), Some(exhaustion)) = (
            self.background_compaction_threshold,
            self.buffer_exhaustion_threshold,
        ) {
            if background > exhaustion {
                return Err(Error::InvalidConfig(
                    "background compaction must start before the buffer is exhausted".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Custom model provider. Never reused implicitly on resume.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wire_api: Option<String>,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider_type", &self.provider_type)
            .field("wire_api", &self.wire_api)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A caller-implemented tool exposed to the agent.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: Option<Value>,
    pub handler: Arc<dyn ToolHandler>,
}

impl Tool {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
            handler,
        }
    }

    #[must_use]
    pub fn parameters(mut self, schema: Value) -> Self {
        self.parameters = Some(schema);
        self
    }

    fn definition(&self) -> Value {
        let mut def = json!({ "name": self.name, "description": self.description });
        if let Some(ref params) = self.parameters {
            def["parameters"] = params.clone();
        }
        def
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Configuration for a new session.
#[derive(Clone, Default)]
pub struct SessionConfig {
    /// Caller-chosen id; the agent assigns one when absent.
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub tools: Vec<Tool>,
    pub system_message: Option<SystemMessageConfig>,
    pub available_tools: Option<Vec<String>>,
    pub excluded_tools: Option<Vec<String>>,
    pub provider: Option<ProviderConfig>,
    pub streaming: bool,
    pub working_directory: Option<PathBuf>,
    /// Opaque custom agent definitions, forwarded verbatim.
    pub custom_agents: Option<Vec<Value>>,
    /// Opaque MCP server definitions keyed by name, forwarded verbatim.
    pub mcp_servers: Option<Map<String, Value>>,
    pub skill_directories: Option<Vec<PathBuf>>,
    pub disabled_skills: Option<Vec<String>>,
    pub infinite_sessions: Option<InfiniteSessionConfig>,
    pub permission_handler: Option<Arc<dyn PermissionHandler>>,
    pub user_input_handler: Option<Arc<dyn UserInputHandler>>,
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub const fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    #[must_use]
    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    #[must_use]
    pub fn system_message(mut self, mode: SystemMessageMode, content: impl Into<String>) -> Self {
        self.system_message = Some(SystemMessageConfig {
            mode,
            content: content.into(),
        });
        self
    }

    #[must_use]
    pub fn available_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.available_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn excluded_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub const fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn disabled_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled_skills = Some(skills.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub const fn infinite_sessions(mut self, config: InfiniteSessionConfig) -> Self {
        self.infinite_sessions = Some(config);
        self
    }

    #[must_use]
    pub fn permission_handler(mut self, handler: Arc<dyn PermissionHandler>) -> Self {
        self.permission_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn user_input_handler(mut self, handler: Arc<dyn UserInputHandler>) -> Self {
        self.user_input_handler = Some(handler);
        self
    }

    /// # Errors
    /// Returns `InvalidConfig` for out-of-range infinite session thresholds.
    pub fn validate(&self) -> Result<()> {
        self.infinite_sessions
            .as_ref()
            .map_or(Ok(()), InfiniteSessionConfig::validate)
    }

    /// Params for `session.create`.
    #[must_use]
    pub fn to_params(&self) -> Value {
        let mut params = Map::new();
        insert_opt(&mut params, "sessionId", self.session_id.as_ref());
        insert_opt(&mut params, "model", self.model.as_ref());
        insert_opt(&mut params, "reasoningEffort", self.reasoning_effort.as_ref());
        if !self.tools.is_empty() {
            params.insert(
                "tools".into(),
                Value::Array(self.tools.iter().map(Tool::definition).collect()),
            );
        }
        insert_opt(&mut params, "systemMessage", self.system_message.as_ref());
        insert_opt(&mut params, "availableTools", self.available_tools.as_ref());
        insert_opt(&mut params, "excludedTools", self.excluded_tools.as_ref());
        insert_opt(&mut params, "provider", self.provider.as_ref());
        insert_opt(&mut params, "workingDirectory", self.working_directory.as_ref());
        insert_opt(&mut params, "customAgents", self.custom_agents.as_ref());
        insert_opt(&mut params, "mcpServers", self.mcp_servers.as_ref());
        insert_opt(&mut params, "skillDirectories", self.skill_directories.as_ref());
        insert_opt(&mut params, "disabledSkills", self.disabled_skills.as_ref());
        insert_opt(&mut params, "infiniteSessions", self.infinite_sessions.as_ref());
        params.insert("streaming".into(), Value::Bool(self.streaming));
        params.insert(
            "requestPermission".into(),
            Value::Bool(self.permission_handler.is_some()),
        );
        params.insert(
            "requestUserInput".into(),
            Value::Bool(self.user_input_handler.is_some()),
        );
        params.insert("hooks".into(), Value::Bool(true));
        Value::Object(params)
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("session_id", &self.session_id)
            .field("model", &self.model)
            .field("reasoning_effort", &self.reasoning_effort)
            .field("tools", &self.tools)
            .field("system_message", &self.system_message)
            .field("available_tools", &self.available_tools)
            .field("excluded_tools", &self.excluded_tools)
            .field("provider", &self.provider)
            .field("streaming", &self.streaming)
            .field("disabled_skills", &self.disabled_skills)
            .field("infinite_sessions", &self.infinite_sessions)
            .field("has_permission_handler", &self.permission_handler.is_some())
            .field("has_user_input_handler", &self.user_input_handler.is_some())
            .finish_non_exhaustive()
    }
}

/// Configuration re-supplied when resuming a session.
///
/// Anything that affects how the agent authenticates against a provider has
/// to be given again here; nothing carries over from the original session.
#[derive(Clone, Default)]
pub struct ResumeSessionConfig {
    /// Switch model on resume; the persisted model is kept when absent.
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub tools: Vec<Tool>,
    pub system_message: Option<SystemMessageConfig>,
    pub provider: Option<ProviderConfig>,
    pub streaming: bool,
    pub custom_agents: Option<Vec<Value>>,
    pub mcp_servers: Option<Map<String, Value>>,
    pub skill_directories: Option<Vec<PathBuf>>,
    pub disabled_skills: Option<Vec<String>>,
    pub permission_handler: Option<Arc<dyn PermissionHandler>>,
    pub user_input_handler: Option<Arc<dyn UserInputHandler>>,
}

impl ResumeSessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub const fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    #[must_use]
    pub fn system_message(mut self, mode: SystemMessageMode, content: impl Into<String>) -> Self {
        self.system_message = Some(SystemMessageConfig {
            mode,
            content: content.into(),
        });
        self
    }

    #[must_use]
    pub fn disabled_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled_skills = Some(skills.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn user_input_handler(mut self, handler: Arc<dyn UserInputHandler>) -> Self {
        self.user_input_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    #[must_use]
    pub fn provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub const fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    #[must_use]
    pub fn permission_handler(mut self, handler: Arc<dyn PermissionHandler>) -> Self {
        self.permission_handler = Some(handler);
        self
    }

    /// Params for `session.resume`.
    #[must_use]
    pub fn to_params(&self, session_id: &str) -> Value {
        let mut params = Map::new();
        params.insert("sessionId".into(), Value::String(session_id.to_string()));
        insert_opt(&mut params, "model", self.model.as_ref());
        insert_opt(&mut params, "reasoningEffort", self.reasoning_effort.as_ref());
        if !self.tools.is_empty() {
            params.insert(
                "tools".into(),
                Value::Array(self.tools.iter().map(Tool::definition).collect()),
            );
        }
        insert_opt(&mut params, "systemMessage", self.system_message.as_ref());
        insert_opt(&mut params, "provider", self.provider.as_ref());
        insert_opt(&mut params, "customAgents", self.custom_agents.as_ref());
        insert_opt(&mut params, "mcpServers", self.mcp_servers.as_ref());
        insert_opt(&mut params, "skillDirectories", self.skill_directories.as_ref());
        insert_opt(&mut params, "disabledSkills", self.disabled_skills.as_ref());
        params.insert("streaming".into(), Value::Bool(self.streaming));
        params.insert(
            "requestPermission".into(),
            Value::Bool(self.permission_handler.is_some()),
        );
        params.insert(
            "requestUserInput".into(),
            Value::Bool(self.user_input_handler.is_some()),
        );
        params.insert("hooks".into(), Value::Bool(true));
        Value::Object(params)
    }
}

impl fmt::Debug for ResumeSessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumeSessionConfig")
            .field("model", &self.model)
            .field("reasoning_effort", &self.reasoning_effort)
            .field("tools", &self.tools)
            .field("system_message", &self.system_message)
            .field("provider", &self.provider)
            .field("streaming", &self.streaming)
            .field("disabled_skills", &self.disabled_skills)
            .finish_non_exhaustive()
    }
}

/// Delivery mode for a message sent while a turn may be active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageMode {
    /// Queue behind the active turn; delivered in submission order.
    Enqueue,
    /// Only valid when the session is idle.
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub display_name: String,
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A message to send to a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageOptions {
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    pub mode: Option<MessageMode>,
}

impl MessageOptions {
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    #[must_use]
    pub const fn mode(mut self, mode: MessageMode) -> Self {
        self.mode = Some(mode);
        self
    }

    #[must_use]
    pub fn is_enqueue(&self) -> bool {
        self.mode == Some(MessageMode::Enqueue)
    }
}

fn insert_opt<T: Serialize>(params: &mut Map<String, Value>, key: &str, value: Option<&T>) {
    if let Some(value) = value {
        match serde_json::to_value(value) {
            Ok(v) => {
                params.insert(key.to_string(), v);
            }
            Err(e) => tracing::warn!(key, "Failed to serialize session option: {e}"),
        }
    }
}
