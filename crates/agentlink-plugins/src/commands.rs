//! `/plugins` management commands.

use std::fmt;

/// Reserved prefix for plugin management.
pub const COMMAND_PREFIX: &str = "/plugins";

const USAGE: &str = "Usage: /plugins [list|available|install <name>|enable <name>|disable <name>|uninstall <name>|help]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginCommand {
    List,
    Available,
    Install(String),
    Enable(String),
    Disable(String),
    Uninstall(String),
    Help,
}

impl PluginCommand {
    /// Parse prompt text.
    ///
    /// `None` when the text is not a management command at all;
    /// `Some(Err(_))` when it is one but cannot be understood.
    #[must_use]
    pub fn parse(text: &str) -> Option<Result<Self, String>> {
        let rest = text.trim().strip_prefix(COMMAND_PREFIX)?;
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            return None;
        }

        let mut words = rest.split_whitespace();
        let sub = words.next().unwrap_or("list");
        let arg = words.next().map(str::to_string);
        if words.next().is_some() {
            return Some(Err(format!("Too many arguments. {USAGE}")));
        }

        let needs_name = |ctor: fn(String) -> Self| {
            arg.clone()
                .map(ctor)
                .ok_or_else(|| format!("Missing plugin name for '{sub}'. {USAGE}"))
        };

        let parsed = match sub.to_ascii_lowercase().as_str() {
            "list" | "ls" => Ok(Self::List),
            "available" => Ok(Self::Available),
            "help" => Ok(Self::Help),
            "install" => needs_name(Self::Install),
            "enable" => needs_name(Self::Enable),
            "disable" => needs_name(Self::Disable),
            "uninstall" | "remove" => needs_name(Self::Uninstall),
            other => Err(format!("Unknown subcommand '{other}'. {USAGE}")),
        };
        Some(parsed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSummary {
    pub name: String,
    pub description: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailablePlugin {
    pub name: String,
    pub description: String,
    pub installed: bool,
}

/// Result of a management command. Every variant is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    List(Vec<PluginSummary>),
    Available(Vec<AvailablePlugin>),
    Installed(String),
    AlreadyInstalled(String),
    UnknownFactory(String),
    Enabled(String),
    AlreadyEnabled(String),
    Disabled(String),
    AlreadyDisabled(String),
    Uninstalled(String),
    NotInstalled(String),
    Help,
    Malformed(String),
}

impl CommandOutcome {
    /// Whether the command changed or reported state as asked.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(
            self,
            Self::List(_)
                | Self::Available(_)
                | Self::Installed(_)
                | Self::Enabled(_)
                | Self::Disabled(_)
                | Self::Uninstalled(_)
                | Self::Help
        )
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List(plugins) if plugins.is_empty() => f.write_str("No plugins installed."),
            Self::List(plugins) => {
                writeln!(f, "Installed plugins:")?;
                for p in plugins {
                    let state = if p.enabled { "enabled" } else { "disabled" };
                    write!(f, "  {} ({state})", p.name)?;
                    if !p.description.is_empty() {
                        write!(f, " - {}", p.description)?;
                    }
                    writeln!(f)?;
                }
                Ok(())
            }
            Self::Available(plugins) if plugins.is_empty() => {
                f.write_str("No plugins available to install.")
            }
            Self::Available(plugins) => {
                writeln!(f, "Available plugins:")?;
                for p in plugins {
                    let mark = if p.installed { " [installed]" } else { "" };
                    writeln!(f, "  {}{mark} - {}", p.name, p.description)?;
                }
                Ok(())
            }
            Self::Installed(name) => write!(f, "Installed and enabled plugin '{name}'."),
            Self::AlreadyInstalled(name) => write!(f, "Plugin '{name}' is already installed."),
            Self::UnknownFactory(name) => write!(
                f,
                "No plugin named '{name}' is available. Run /plugins available to see the catalog."
            ),
            Self::Enabled(name) => write!(f, "Enabled plugin '{name}'."),
            Self::AlreadyEnabled(name) => write!(f, "Plugin '{name}' is already enabled."),
            Self::Disabled(name) => write!(f, "Disabled plugin '{name}'."),
            Self::AlreadyDisabled(name) => write!(f, "Plugin '{name}' is already disabled."),
            Self::Uninstalled(name) => write!(f, "Uninstalled plugin '{name}'."),
            Self::NotInstalled(name) => write!(f, "Plugin '{name}' is not installed."),
            Self::Help => f.write_str(USAGE),
            Self::Malformed(message) => f.write_str(message),
        }
    }
}
