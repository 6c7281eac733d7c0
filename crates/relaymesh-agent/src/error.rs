use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Registration for endpoint {0} was rejected as unauthorized")]
    Unauthorized(String),
}

impl AgentError {
    /// Errors that retrying cannot fix
    pub fn is_non_recoverable(&self) -> bool {
        !matches!(self, AgentError::Connect { .. })
    }
}
