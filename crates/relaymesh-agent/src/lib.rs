//! relaymesh agent
//!
//! Registers local HTTP services as relaymesh endpoints. For each endpoint
//! the agent holds a WebSocket connection to a node's upstream listener and
//! answers proxied requests by forwarding them to the local service,
//! reconnecting with exponential backoff whenever the connection drops.

pub mod agent;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod transport;

pub use agent::Agent;
pub use config::{AgentConfig, EndpointConfig};
pub use error::AgentError;
pub use forwarder::LocalForwarder;
pub use transport::ClientTransport;
