use thiserror::Error;

/// Errors from the programmatic plugin API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    #[error("Plugin '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("Plugin '{0}' is not registered")]
    NotRegistered(String),
}
