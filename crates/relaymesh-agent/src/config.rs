//! Agent configuration

use relaymesh_proto::endpoint_path_segment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AgentError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// ws:// or wss:// base URL of a node's upstream listener
    pub server_url: String,
    /// Bearer token presented when registering
    pub token: Option<String>,
    pub endpoints: Vec<EndpointConfig>,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,
    /// Bound on one request to the local service
    #[serde(with = "duration_secs")]
    pub forward_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8001".to_string(),
            token: None,
            endpoints: Vec::new(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(10),
            forward_timeout: Duration::from_secs(15),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// An endpoint served by a local HTTP service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    /// host:port of the local service
    pub addr: String,
}

impl FromStr for EndpointConfig {
    type Err = AgentError;

    /// Parses `id=host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AgentError::Config(format!("endpoint '{}' is not of the form id=host:port", s));

        let (id, addr) = s.split_once('=').ok_or_else(invalid)?;
        let (id, addr) = (id.trim(), addr.trim());
        if id.is_empty() {
            return Err(invalid());
        }
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => return Err(invalid()),
        }

        Ok(Self {
            id: id.to_string(),
            addr: addr.to_string(),
        })
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let contents = std::fs::read_to_string(path).map_err(|source| AgentError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(AgentError::Config(format!(
                "server_url '{}' must start with ws:// or wss://",
                self.server_url
            )));
        }
        if self.endpoints.is_empty() {
            return Err(AgentError::Config("no endpoints configured".to_string()));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_timeout.is_zero() {
            return Err(AgentError::Config(
                "heartbeat interval and timeout must be positive".to_string(),
            ));
        }
        if self.forward_timeout.is_zero() {
            return Err(AgentError::Config(
                "forward_timeout must be positive".to_string(),
            ));
        }
        if self.initial_backoff.is_zero() || self.max_backoff < self.initial_backoff {
            return Err(AgentError::Config(
                "initial_backoff must be positive and no larger than max_backoff".to_string(),
            ));
        }
        Ok(())
    }

    /// Listener URL for `endpoint_id`
    pub fn listener_url(&self, endpoint_id: &str) -> String {
        format!(
            "{}/relaymesh/v1/listener/{}",
            self.server_url.trim_end_matches('/'),
            endpoint_path_segment(endpoint_id)
        )
    }
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
