//! Agent executable resolution and command building.

use std::path::{Path, PathBuf};

use thiserror::Error;

use agentlink_core::{ClientOptions, config::CLI_PATH_ENV};

/// Program looked up on `PATH` when nothing else is configured.
pub const DEFAULT_PROGRAM: &str = "copilot";

/// Command build error.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    NotFound(String),
}

impl From<LaunchError> for agentlink_core::Error {
    fn from(e: LaunchError) -> Self {
        match e {
            LaunchError::NotFound(program) => Self::ProcessNotFound(program),
            other => Self::InvalidConfig(other.to_string()),
        }
    }
}

/// How the spawned agent should talk to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFlag {
    Stdio,
    /// `0` lets the agent pick a free port.
    Port(u16),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if the executable cannot be found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), LaunchError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(LaunchError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for the agent command line.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base command; may carry leading arguments, e.g. `node dist/cli.js`.
    pub base: String,
    /// Arguments placed between the base and the transport flags.
    pub params: Vec<String>,
    pub log_level: String,
}

impl CommandBuilder {
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
            log_level: "info".to_string(),
        }
    }

    /// Builder seeded from the client options, with the base command
    /// chosen by [`default_base`].
    #[must_use]
    pub fn from_options(options: &ClientOptions) -> Self {
        Self::new(default_base(options.cli_path.as_deref()))
            .params(options.cli_args.iter().cloned())
            .log_level(options.log_level.clone())
    }

    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Build the full command line for the given transport.
    ///
    /// # Errors
    /// Returns error if the base command cannot be split.
    pub fn build(&self, transport: TransportFlag) -> Result<CommandParts, LaunchError> {
        let mut parts = split_command_line(&self.base)?;
        parts.extend(self.params.iter().cloned());
        parts.extend(
            ["--headless", "--no-auto-update", "--log-level", &self.log_level]
                .into_iter()
                .map(str::to_string),
        );
        match transport {
            TransportFlag::Stdio => parts.push("--stdio".to_string()),
            TransportFlag::Port(port) => {
                parts.push("--port".to_string());
                parts.push(port.to_string());
            }
        }

        if parts.is_empty() {
            return Err(LaunchError::EmptyCommand);
        }
        let program = parts.remove(0);
        Ok(CommandParts { program, args: parts })
    }
}

/// Base command: explicit path, then `COPILOT_CLI_PATH`, then the bundled
/// install under the local data dir, then the bare program name.
#[must_use]
pub fn default_base(explicit: Option<&str>) -> String {
    if let Some(path) = explicit.filter(|p| !p.trim().is_empty()) {
        return path.to_string();
    }
    if let Ok(path) = std::env::var(CLI_PATH_ENV) {
        if !path.trim().is_empty() {
            return path;
        }
    }
    if let Some(bundled) = bundled_executable().filter(|p| p.is_file()) {
        // Quote so a data dir with spaces survives shell splitting.
        let text = bundled.to_string_lossy().into_owned();
        return shlex::try_quote(&text).map_or(text.clone(), |q| q.into_owned());
    }
    DEFAULT_PROGRAM.to_string()
}

/// Location of a bundled agent install, if the platform has a data dir.
#[must_use]
pub fn bundled_executable() -> Option<PathBuf> {
    let name = if cfg!(windows) {
        format!("{DEFAULT_PROGRAM}.exe")
    } else {
        DEFAULT_PROGRAM.to_string()
    };
    dirs::data_local_dir().map(|dir| dir.join("agentlink").join("bin").join(name))
}

/// Resolve an executable by name.
///
/// Explicit paths (absolute or containing a separator) are used as-is when
/// they exist; anything else is looked up on `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

fn split_command_line(input: &str) -> Result<Vec<String>, LaunchError> {
    #[cfg(windows)]
    {
        let parts = winsplit::split(input);
        if parts.is_empty() {
            Err(LaunchError::EmptyCommand)
        } else {
            Ok(parts)
        }
    }

    #[cfg(not(windows))]
    {
        let parts = shlex::split(input).ok_or_else(|| LaunchError::InvalidBase(input.to_string()))?;
        if parts.is_empty() {
            Err(LaunchError::EmptyCommand)
        } else {
            Ok(parts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_stdio_command() {
        let parts = CommandBuilder::new("node /opt/agent/cli.js")
            .params(["--verbose"])
            .log_level("debug")
            .build(TransportFlag::Stdio)
            .unwrap();
        assert_eq!(parts.program, "node");
        assert_eq!(
            parts.args,
            [
                "/opt/agent/cli.js",
                "--verbose",
                "--headless",
                "--no-auto-update",
                "--log-level",
                "debug",
                "--stdio"
            ]
        );
    }

    #[test]
    fn test_build_port_command() {
        let parts = CommandBuilder::new("agent").build(TransportFlag::Port(0)).unwrap();
        assert_eq!(parts.args.last().map(String::as_str), Some("0"));
        assert!(parts.args.contains(&"--port".to_string()));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_unbalanced_quotes_rejected() {
        let err = CommandBuilder::new("agent \"unterminated")
            .build(TransportFlag::Stdio)
            .unwrap_err();
        assert!(matches!(err, LaunchError::InvalidBase(_)));
    }

    #[test]
    fn test_explicit_path_wins() {
        assert_eq!(default_base(Some("/usr/local/bin/agent")), "/usr/local/bin/agent");
    }

    #[tokio::test]
    async fn test_missing_explicit_path_is_not_found() {
        let parts = CommandParts {
            program: "/definitely/not/here/agent".into(),
            args: vec![],
        };
        assert!(matches!(parts.into_resolved().await, Err(LaunchError::NotFound(_))));
    }
}
