//! Server configuration

use relaymesh_auth::{JwtVerifier, Verifier};
use relaymesh_control::NodeAddress;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Invalid JWT key: {0}")]
    Key(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub proxy: ProxyConfig,
    pub upstream: UpstreamConfig,
    pub admin: AdminConfig,
    pub cluster: ClusterConfig,
    pub auth: Option<AuthConfig>,
    pub server: ShutdownConfig,
}

/// Listener for external clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind_addr: String,
    /// Bound on a whole proxied request, including the upstream's response
    #[serde(with = "duration_secs")]
    pub gateway_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            gateway_timeout: Duration::from_secs(15),
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Listener for upstream services
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub bind_addr: String,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8001".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(10),
        }
    }
}

/// Listener for peer nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub bind_addr: String,
    /// Address peers use to reach this node; defaults to the bound address
    pub advertise_addr: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8002".to_string(),
            advertise_addr: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub node_id: Option<String>,
    /// Random suffix appended when no node ID is given
    pub node_id_prefix: Option<String>,
    /// Peers as `node_id=admin_addr`
    pub peers: Vec<String>,
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            node_id_prefix: None,
            peers: Vec::new(),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl ClusterConfig {
    pub fn resolve_node_id(&self) -> String {
        if let Some(node_id) = &self.node_id {
            return node_id.clone();
        }
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let suffix = &suffix[..8];
        match &self.node_id_prefix {
            Some(prefix) => format!("{}{}", prefix, suffix),
            None => format!("node-{}", suffix),
        }
    }

    pub fn peer_addresses(&self) -> Result<Vec<NodeAddress>, ConfigError> {
        let mut peers = Vec::with_capacity(self.peers.len());
        let mut errors = Vec::new();
        for peer in &self.peers {
            match parse_peer(peer) {
                Some(address) => peers.push(address),
                None => errors.push(format!(
                    "cluster.peers: '{}' is not of the form node_id=host:port",
                    peer
                )),
            }
        }
        if errors.is_empty() {
            Ok(peers)
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

fn parse_peer(peer: &str) -> Option<NodeAddress> {
    let (node_id, addr) = peer.split_once('=')?;
    let (node_id, addr) = (node_id.trim(), addr.trim());
    if node_id.is_empty() || !is_host_port(addr) {
        return None;
    }
    Some(NodeAddress::new(node_id, addr))
}

fn is_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Upstream token verification; absent means listeners are unauthenticated
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 shared secret
    pub jwt_secret: Option<String>,
    /// Path to an RS256 public key in PEM format
    pub jwt_rsa_public_key: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

impl AuthConfig {
    pub fn build_verifier(&self) -> Result<Arc<dyn Verifier>, ConfigError> {
        let verifier = match (&self.jwt_secret, &self.jwt_rsa_public_key) {
            (Some(secret), None) => JwtVerifier::new(secret.as_bytes()),
            (None, Some(path)) => {
                let pem = std::fs::read(path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                JwtVerifier::from_rsa_pem(&pem).map_err(|e| ConfigError::Key(e.to_string()))?
            }
            _ => {
                return Err(ConfigError::Validation(vec![
                    "auth: exactly one of jwt_secret or jwt_rsa_public_key is required"
                        .to_string(),
                ]))
            }
        };

        let verifier = match &self.issuer {
            Some(issuer) => verifier.with_issuer(issuer.clone()),
            None => verifier,
        };
        let verifier = match &self.audience {
            Some(audience) => verifier.with_audience(audience.clone()),
            None => verifier,
        };

        Ok(Arc::new(verifier))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    #[serde(with = "duration_secs")]
    pub graceful_shutdown_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Load and validate a YAML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field, reporting all problems at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        for (name, addr) in [
            ("proxy.bind_addr", &self.proxy.bind_addr),
            ("upstream.bind_addr", &self.upstream.bind_addr),
            ("admin.bind_addr", &self.admin.bind_addr),
        ] {
            if addr.is_empty() {
                errors.push(format!("{}: missing address", name));
            } else if !is_host_port(addr) {
                errors.push(format!("{}: '{}' is not host:port", name, addr));
            }
        }

        if let Some(addr) = &self.admin.advertise_addr {
            if !is_host_port(addr) {
                errors.push(format!("admin.advertise_addr: '{}' is not host:port", addr));
            }
        }

        if self.proxy.gateway_timeout.is_zero() {
            errors.push("proxy.gateway_timeout: must be positive".to_string());
        }
        if self.proxy.max_body_bytes == 0 {
            errors.push("proxy.max_body_bytes: must be positive".to_string());
        }
        if self.upstream.heartbeat_interval.is_zero() {
            errors.push("upstream.heartbeat_interval: must be positive".to_string());
        }
        if self.upstream.heartbeat_timeout.is_zero() {
            errors.push("upstream.heartbeat_timeout: must be positive".to_string());
        }

        if self.server.graceful_shutdown_timeout.is_zero() {
            errors.push("server.graceful_shutdown_timeout: must be positive".to_string());
        }

        if self.cluster.node_id.is_some() && self.cluster.node_id_prefix.is_some() {
            errors.push(
                "cluster: cannot set both node_id and node_id_prefix".to_string(),
            );
        }
        if matches!(&self.cluster.node_id, Some(id) if id.is_empty()) {
            errors.push("cluster.node_id: must not be empty".to_string());
        }
        if let Err(ConfigError::Validation(peer_errors)) = self.cluster.peer_addresses() {
            errors.extend(peer_errors);
        }
        if !self.cluster.peers.is_empty() && self.cluster.poll_interval.is_zero() {
            errors.push("cluster.poll_interval: must be positive".to_string());
        }

        if let Some(auth) = &self.auth {
            if auth.jwt_secret.is_some() == auth.jwt_rsa_public_key.is_some() {
                errors.push(
                    "auth: exactly one of jwt_secret or jwt_rsa_public_key is required"
                        .to_string(),
                );
            }
            if matches!(&auth.jwt_secret, Some(secret) if secret.is_empty()) {
                errors.push("auth.jwt_secret: must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.proxy.bind_addr, "0.0.0.0:8000");
        assert_eq!(config.upstream.bind_addr, "0.0.0.0:8001");
        assert_eq!(config.admin.bind_addr, "0.0.0.0:8002");
        assert_eq!(config.proxy.gateway_timeout, Duration::from_secs(15));
        assert_eq!(
            config.server.graceful_shutdown_timeout,
            Duration::from_secs(60)
        );
        assert!(config.auth.is_none());
    }

    #[test]
    fn test_parse_yaml() {
        let config = ServerConfig::from_yaml(
            r#"
proxy:
  bind_addr: 127.0.0.1:9000
  gateway_timeout: 5
upstream:
  heartbeat_interval: 2
cluster:
  node_id: node-a
  peers:
    - node-b=10.0.0.2:8002
auth:
  jwt_secret: s3cret
server:
  graceful_shutdown_timeout: 10
"#,
        )
        .unwrap();

        assert_eq!(config.proxy.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.proxy.gateway_timeout, Duration::from_secs(5));
        assert_eq!(config.upstream.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.upstream.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(config.cluster.resolve_node_id(), "node-a");
        assert_eq!(
            config.cluster.peer_addresses().unwrap(),
            vec![NodeAddress::new("node-b", "10.0.0.2:8002")]
        );
        assert_eq!(
            config.server.graceful_shutdown_timeout,
            Duration::from_secs(10)
        );
        assert!(config.auth.unwrap().build_verifier().is_ok());
    }

    #[test]
    fn test_validation_collects_every_error() {
        let mut config = ServerConfig::default();
        config.proxy.bind_addr = "nonsense".to_string();
        config.upstream.bind_addr = String::new();
        config.proxy.gateway_timeout = Duration::ZERO;
        config.cluster.node_id = Some("node-a".to_string());
        config.cluster.node_id_prefix = Some("node-".to_string());
        config.cluster.peers = vec!["missing-address".to_string()];

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };

        assert_eq!(errors.len(), 5);
        assert!(errors.iter().any(|e| e.starts_with("proxy.bind_addr")));
        assert!(errors.iter().any(|e| e.starts_with("upstream.bind_addr")));
        assert!(errors.iter().any(|e| e.starts_with("proxy.gateway_timeout")));
        assert!(errors.iter().any(|e| e.starts_with("cluster:")));
        assert!(errors.iter().any(|e| e.starts_with("cluster.peers")));
    }

    #[test]
    fn test_auth_requires_exactly_one_key() {
        let mut config = ServerConfig::default();
        config.auth = Some(AuthConfig::default());
        assert!(config.validate().is_err());

        config.auth = Some(AuthConfig {
            jwt_secret: Some("a".to_string()),
            jwt_rsa_public_key: Some("/tmp/key.pem".to_string()),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_id_prefix() {
        let cluster = ClusterConfig {
            node_id_prefix: Some("edge-".to_string()),
            ..Default::default()
        };

        let first = cluster.resolve_node_id();
        let second = cluster.resolve_node_id();

        assert!(first.starts_with("edge-"));
        assert_eq!(first.len(), "edge-".len() + 8);
        assert_ne!(first, second);
    }

    #[test]
    fn test_parse_peer() {
        assert_eq!(
            parse_peer(" node-b = 10.0.0.2:8002 "),
            Some(NodeAddress::new("node-b", "10.0.0.2:8002"))
        );
        assert_eq!(parse_peer("=10.0.0.2:8002"), None);
        assert_eq!(parse_peer("node-b=10.0.0.2"), None);
        assert_eq!(parse_peer("node-b"), None);
    }
}
