//! Error types for the recovery engine

use std::io;

use thiserror::Error;

/// Result type alias for the recovery engine
pub type Result<T> = std::result::Result<T, Error>;

/// Recovery engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid playbook definition or playbook graph
    #[error("Playbook error: {0}")]
    Playbook(String),

    /// Action identifier that has no implementation
    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    /// Resource control API answered with a non-success status
    #[error("Resource API error ({status}): {message}")]
    Resource {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Remote call did not finish in time
    #[error("Resource timeout: {0}")]
    ResourceTimeout(String),

    /// Transport-level failure talking to the resource API
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error came from talking to a remote resource
    /// (as opposed to local misconfiguration).
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Self::Resource { .. }
                | Self::ResourceTimeout(_)
                | Self::Transport(_)
                | Self::Http(_)
                | Self::Json(_)
        )
    }
}
