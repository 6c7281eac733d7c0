//! Request routing
//!
//! A request for an endpoint goes to a local connection when this node has
//! one, otherwise to a peer node that does. The whole attempt is bounded by
//! the gateway timeout.

use async_trait::async_trait;
use http::StatusCode;
use relaymesh_proto::{ForwardFailure, HttpRequest, HttpResponse};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connection::{Conn, ConnError};
use crate::membership::{Membership, NodeAddress, StandaloneMembership};
use crate::registry::{ConnectionManager, ConnectionRegistry};

/// Errors routing a request to an endpoint
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("endpoint not found: {0}")]
    EndpointUnreachable(String),

    #[error("upstream timeout")]
    GatewayTimeout,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("peer error: {0}")]
    Peer(String),
}

impl ProxyError {
    /// HTTP status reported to the external client
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Message reported to the external client
    pub fn public_message(&self) -> &'static str {
        match self {
            ProxyError::EndpointUnreachable(_) => "endpoint not found",
            ProxyError::GatewayTimeout => "upstream timeout",
            ProxyError::ConnectionLost(_) => "upstream connection lost",
            ProxyError::Upstream(_) => "upstream error",
            ProxyError::Peer(_) => "peer unavailable",
        }
    }

    /// Wire form, for answering a peer's forwarded request
    pub fn to_failure(&self) -> ForwardFailure {
        match self {
            ProxyError::EndpointUnreachable(_) => ForwardFailure::EndpointNotFound,
            ProxyError::GatewayTimeout => ForwardFailure::Timeout,
            ProxyError::ConnectionLost(message) => ForwardFailure::ConnectionLost(message.clone()),
            ProxyError::Upstream(message) | ProxyError::Peer(message) => {
                ForwardFailure::Upstream(message.clone())
            }
        }
    }

    /// Inverse of [`ProxyError::to_failure`], for a peer's reply
    pub fn from_failure(endpoint_id: &str, failure: ForwardFailure) -> Self {
        match failure {
            ForwardFailure::EndpointNotFound => {
                ProxyError::EndpointUnreachable(endpoint_id.to_string())
            }
            ForwardFailure::Timeout => ProxyError::GatewayTimeout,
            ForwardFailure::ConnectionLost(message) => ProxyError::ConnectionLost(message),
            ForwardFailure::Upstream(message) => ProxyError::Upstream(message),
        }
    }
}

impl From<ConnError> for ProxyError {
    fn from(err: ConnError) -> Self {
        match err {
            ConnError::ConnectionLost(message) => ProxyError::ConnectionLost(message),
            ConnError::Upstream(message) | ConnError::Message(message) => {
                ProxyError::Upstream(message)
            }
        }
    }
}

/// Delivers a request to a peer node's internal forwarding service
#[async_trait]
pub trait PeerForwarder: Send + Sync {
    async fn forward(
        &self,
        peer: &NodeAddress,
        endpoint_id: &str,
        request: HttpRequest,
    ) -> Result<HttpResponse, ProxyError>;
}

/// Forwarder for nodes without peers
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPeers;

#[async_trait]
impl PeerForwarder for NoPeers {
    async fn forward(
        &self,
        peer: &NodeAddress,
        _endpoint_id: &str,
        _request: HttpRequest,
    ) -> Result<HttpResponse, ProxyError> {
        Err(ProxyError::Peer(format!(
            "no route to peer {}",
            peer.node_id
        )))
    }
}

/// Routes requests to the connections serving an endpoint
pub struct Proxy {
    registry: Arc<ConnectionRegistry>,
    membership: Arc<dyn Membership>,
    peers: Arc<dyn PeerForwarder>,
    gateway_timeout: Duration,
    /// Held across a registry change and the membership notice it causes,
    /// so notices reach membership in registry order
    membership_order: Mutex<()>,
}

impl Proxy {
    pub fn new(registry: Arc<ConnectionRegistry>, gateway_timeout: Duration) -> Self {
        Self {
            registry,
            membership: Arc::new(StandaloneMembership),
            peers: Arc::new(NoPeers),
            gateway_timeout,
            membership_order: Mutex::new(()),
        }
    }

    pub fn with_membership(mut self, membership: Arc<dyn Membership>) -> Self {
        self.membership = membership;
        self
    }

    pub fn with_peers(mut self, peers: Arc<dyn PeerForwarder>) -> Self {
        self.peers = peers;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn gateway_timeout(&self) -> Duration {
        self.gateway_timeout
    }

    /// Route a request from an external client, locally or via a peer
    pub async fn request(
        &self,
        endpoint_id: &str,
        request: HttpRequest,
    ) -> Result<HttpResponse, ProxyError> {
        self.bounded(endpoint_id, self.route(endpoint_id, request, true))
            .await
    }

    /// Route a request forwarded by a peer, to local connections only
    pub async fn forward_local(
        &self,
        endpoint_id: &str,
        request: HttpRequest,
    ) -> Result<HttpResponse, ProxyError> {
        self.bounded(endpoint_id, self.route(endpoint_id, request, false))
            .await
    }

    async fn bounded<F>(&self, endpoint_id: &str, attempt: F) -> Result<HttpResponse, ProxyError>
    where
        F: Future<Output = Result<HttpResponse, ProxyError>>,
    {
        match tokio::time::timeout(self.gateway_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Request for endpoint {} timed out after {:?}",
                    endpoint_id, self.gateway_timeout
                );
                Err(ProxyError::GatewayTimeout)
            }
        }
    }

    async fn route(
        &self,
        endpoint_id: &str,
        request: HttpRequest,
        allow_remote: bool,
    ) -> Result<HttpResponse, ProxyError> {
        if let Some(conn) = self.registry.lookup(endpoint_id).into_iter().next() {
            debug!("Routing {} to local connection {}", endpoint_id, conn.id());
            return conn.forward(request).await.map_err(ProxyError::from);
        }

        if allow_remote {
            if let Some(peer) = self.membership.owners_of(endpoint_id).into_iter().next() {
                debug!("Routing {} to peer {}", endpoint_id, peer.node_id);
                return self.peers.forward(&peer, endpoint_id, request).await;
            }
        }

        debug!("No connection for endpoint {}", endpoint_id);
        Err(ProxyError::EndpointUnreachable(endpoint_id.to_string()))
    }

    fn lock_membership_order(&self) -> std::sync::MutexGuard<'_, ()> {
        self.membership_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConnectionManager for Proxy {
    fn add_conn(&self, conn: Arc<dyn Conn>) {
        let id = conn.id();
        let endpoint_id = conn.endpoint_id().to_string();

        let count = {
            let _order = self.lock_membership_order();
            let count = self.registry.add(conn);
            if count == 1 {
                self.membership.announce_local(&endpoint_id);
            }
            count
        };
        info!(
            "Connection {} registered for endpoint {} ({} active)",
            id, endpoint_id, count
        );
    }

    fn remove_conn(&self, conn: &Arc<dyn Conn>) {
        let remaining = {
            let _order = self.lock_membership_order();
            let Some(remaining) = self.registry.remove(conn.as_ref()) else {
                return;
            };
            if remaining == 0 {
                self.membership.withdraw_local(conn.endpoint_id());
            }
            remaining
        };
        info!(
            "Connection {} removed from endpoint {} ({} active)",
            conn.id(),
            conn.endpoint_id(),
            remaining
        );
    }
}
