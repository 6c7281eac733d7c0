//! Upstream connections

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaymesh_proto::{HttpRequest, HttpResponse, RpcError, RpcType, Stream};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

/// Connection identifier, unique for the life of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Errors forwarding a request over an upstream connection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("invalid message: {0}")]
    Message(String),
}

impl From<RpcError> for ConnError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::ConnectionClosed | RpcError::HeartbeatTimeout => {
                ConnError::ConnectionLost(err.to_string())
            }
            RpcError::Remote(message) => ConnError::Upstream(message),
            RpcError::Unsupported(_) => ConnError::Upstream(err.to_string()),
            RpcError::PayloadTooLarge(_) => ConnError::Message(err.to_string()),
        }
    }
}

/// A registered upstream that can serve requests for one endpoint
#[async_trait]
pub trait Conn: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnId;

    fn endpoint_id(&self) -> &str;

    /// Send one request to the upstream and wait for its response
    async fn forward(&self, request: HttpRequest) -> Result<HttpResponse, ConnError>;

    /// Tear down the underlying transport. Idempotent.
    fn close(&self);
}

/// Connection backed by an RPC stream to an upstream listener
pub struct RpcConn {
    id: ConnId,
    endpoint_id: String,
    stream: Stream,
    remote_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
}

impl fmt::Debug for RpcConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcConn")
            .field("id", &self.id)
            .field("endpoint_id", &self.endpoint_id)
            .field("remote_addr", &self.remote_addr)
            .field("stream", &self.stream.id())
            .finish()
    }
}

impl RpcConn {
    pub fn new(endpoint_id: impl Into<String>, stream: Stream) -> Self {
        Self {
            id: ConnId::new(),
            endpoint_id: endpoint_id.into(),
            stream,
            remote_addr: None,
            connected_at: Utc::now(),
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }
}

#[async_trait]
impl Conn for RpcConn {
    fn id(&self) -> ConnId {
        self.id
    }

    fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    async fn forward(&self, request: HttpRequest) -> Result<HttpResponse, ConnError> {
        trace!(
            "[{}] Forwarding {} {} to {}",
            self.id,
            request.method,
            request.uri,
            self.endpoint_id
        );

        let payload = request
            .encode()
            .map_err(|e| ConnError::Message(e.to_string()))?;
        let reply = self.stream.rpc(RpcType::PROXY_HTTP, payload).await?;

        HttpResponse::decode(&reply).map_err(|e| ConnError::Message(e.to_string()))
    }

    fn close(&self) {
        self.stream.close();
    }
}
