//! relaymesh node
//!
//! A node accepts upstream services over WebSocket, proxies external HTTP
//! requests to them, and forwards requests for endpoints held elsewhere to
//! the peer node that holds them.

pub mod admin;
pub mod auth;
pub mod cluster;
pub mod config;
pub mod error;
pub mod node;
pub mod peer;
pub mod proxy;
pub mod transport;
pub mod upstream;

pub use cluster::PeerPoller;
pub use config::{
    AdminConfig, AuthConfig, ClusterConfig, ConfigError, ProxyConfig, ServerConfig,
    ShutdownConfig, UpstreamConfig,
};
pub use error::{ErrorResponse, ServerError};
pub use node::{Node, NodeAddrs, NodeBuilder, RunningNode};
pub use peer::HttpPeerForwarder;
pub use proxy::ENDPOINT_HEADER;
