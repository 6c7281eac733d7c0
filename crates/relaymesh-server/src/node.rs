//! Node lifecycle
//!
//! A node binds three listeners: the proxy for external clients, the
//! upstream listener for services registering endpoints, and the admin
//! listener for peer nodes. Shutdown stops accepting on all three, tells
//! every upstream connection to disconnect, waits for in-flight work up to
//! the graceful-shutdown timeout, then forcibly closes what remains.

use relaymesh_auth::Verifier;
use relaymesh_control::{
    ClusterMember, ClusterView, ConnectionManager, ConnectionRegistry, NodeAddress, Proxy,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::cluster::PeerPoller;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::peer::HttpPeerForwarder;
use crate::{admin, proxy, upstream};

/// Builder for [`Node`]
pub struct NodeBuilder {
    config: ServerConfig,
    verifier: Option<Arc<dyn Verifier>>,
    view: Option<Arc<ClusterView>>,
}

impl NodeBuilder {
    /// Use this verifier instead of the one described by `auth`
    pub fn verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Join an existing cluster view instead of a private one
    pub fn cluster_view(mut self, view: Arc<ClusterView>) -> Self {
        self.view = Some(view);
        self
    }

    /// Validate the config and bind every listener
    pub async fn bind(self) -> Result<Node, ServerError> {
        let config = self.config;
        config.validate()?;

        let verifier = match self.verifier {
            Some(verifier) => Some(verifier),
            None => config
                .auth
                .as_ref()
                .map(|auth| auth.build_verifier())
                .transpose()?,
        };
        let peers = config.cluster.peer_addresses()?;

        let proxy_listener = bind_listener("proxy", &config.proxy.bind_addr).await?;
        let upstream_listener = bind_listener("upstream", &config.upstream.bind_addr).await?;
        let admin_listener = bind_listener("admin", &config.admin.bind_addr).await?;

        let admin_addr = admin_listener.local_addr()?;
        let advertise_addr = match &config.admin.advertise_addr {
            Some(addr) => addr.clone(),
            None => {
                if admin_addr.ip().is_unspecified() {
                    warn!(
                        "Admin listener bound to {} without an advertise address; peers cannot reach this node",
                        admin_addr
                    );
                }
                admin_addr.to_string()
            }
        };

        let node_id = config.cluster.resolve_node_id();
        let view = self.view.unwrap_or_else(ClusterView::new);
        let member = view.join(NodeAddress::new(node_id.clone(), advertise_addr));

        let proxy = Proxy::new(
            Arc::new(ConnectionRegistry::new()),
            config.proxy.gateway_timeout,
        )
        .with_membership(Arc::new(member.clone()))
        .with_peers(Arc::new(HttpPeerForwarder::new()));

        Ok(Node {
            config,
            node_id,
            verifier,
            peers,
            view,
            member,
            proxy: Arc::new(proxy),
            proxy_listener,
            upstream_listener,
            admin_listener,
        })
    }
}

async fn bind_listener(name: &'static str, addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            name,
            addr: addr.to_string(),
            source,
        })
}

/// A node with its listeners bound but not yet serving
pub struct Node {
    config: ServerConfig,
    node_id: String,
    verifier: Option<Arc<dyn Verifier>>,
    peers: Vec<NodeAddress>,
    view: Arc<ClusterView>,
    member: ClusterMember,
    proxy: Arc<Proxy>,
    proxy_listener: TcpListener,
    upstream_listener: TcpListener,
    admin_listener: TcpListener,
}

/// Bound listener addresses
#[derive(Debug, Clone, Copy)]
pub struct NodeAddrs {
    pub proxy: SocketAddr,
    pub upstream: SocketAddr,
    pub admin: SocketAddr,
}

impl Node {
    pub fn builder(config: ServerConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            verifier: None,
            view: None,
        }
    }

    /// Bind with the verifier and peers described by `config`
    pub async fn bind(config: ServerConfig) -> Result<Node, ServerError> {
        Self::builder(config).bind().await
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn addrs(&self) -> Result<NodeAddrs, ServerError> {
        Ok(NodeAddrs {
            proxy: self.proxy_listener.local_addr()?,
            upstream: self.upstream_listener.local_addr()?,
            admin: self.admin_listener.local_addr()?,
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.proxy.registry()
    }

    /// Start serving on every listener
    pub fn serve(self) -> RunningNode {
        let stop = CancellationToken::new();
        let connections = CancellationToken::new();
        let listeners = TaskTracker::new();
        let mut servers = JoinSet::new();

        let upstream_router = upstream::router(
            self.proxy.clone() as Arc<dyn ConnectionManager>,
            self.verifier.clone(),
            connections.clone(),
            listeners.clone(),
            self.config.upstream.heartbeat_interval,
            self.config.upstream.heartbeat_timeout,
        );
        let proxy_router = proxy::router(self.proxy.clone(), self.config.proxy.max_body_bytes);
        let admin_router = admin::router(
            self.node_id.clone(),
            self.proxy.clone(),
            self.config.proxy.max_body_bytes,
        );

        for (name, listener, router) in [
            ("proxy", self.proxy_listener, proxy_router),
            ("upstream", self.upstream_listener, upstream_router),
            ("admin", self.admin_listener, admin_router),
        ] {
            let stop = stop.clone();
            let node_id = self.node_id.clone();
            if let Ok(addr) = listener.local_addr() {
                info!("[{}] {} listener on {}", node_id, name, addr);
            }
            servers.spawn(async move {
                let served = axum::serve(
                    listener,
                    router.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
                if let Err(e) = served {
                    error!("[{}] {} listener failed: {}", node_id, name, e);
                }
            });
        }

        let poller = PeerPoller::new(
            self.view.clone(),
            self.peers.clone(),
            self.config.cluster.poll_interval,
        );
        servers.spawn(poller.run(stop.child_token()));

        info!(
            "[{}] Node started with {} peer(s)",
            self.node_id,
            self.peers.len()
        );

        RunningNode {
            node_id: self.node_id,
            member: self.member,
            proxy: self.proxy,
            stop,
            connections,
            listeners,
            servers,
            graceful_shutdown_timeout: self.config.server.graceful_shutdown_timeout,
        }
    }
}

/// A serving node
pub struct RunningNode {
    node_id: String,
    member: ClusterMember,
    proxy: Arc<Proxy>,
    stop: CancellationToken,
    connections: CancellationToken,
    listeners: TaskTracker,
    servers: JoinSet<()>,
    graceful_shutdown_timeout: Duration,
}

impl RunningNode {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.proxy.registry()
    }

    /// Stop accepting, disconnect every upstream and drain in-flight work
    pub async fn shutdown(mut self) {
        info!("[{}] Shutting down", self.node_id);

        self.stop.cancel();
        self.connections.cancel();
        self.listeners.close();

        let drained = tokio::time::timeout(
            self.graceful_shutdown_timeout,
            drain(&mut self.servers, &self.listeners),
        )
        .await;

        if drained.is_err() {
            warn!(
                "[{}] Graceful shutdown timed out after {:?}, closing remaining connections",
                self.node_id, self.graceful_shutdown_timeout
            );
            self.servers.abort_all();
            while self.servers.join_next().await.is_some() {}
            self.close_remaining();
        }

        self.member.leave();
        info!("[{}] Node stopped", self.node_id);
    }

    fn close_remaining(&self) {
        let registry = self.proxy.registry();
        for endpoint_id in registry.endpoints().into_keys() {
            for conn in registry.lookup(&endpoint_id) {
                conn.close();
            }
        }
    }
}

async fn drain(servers: &mut JoinSet<()>, listeners: &TaskTracker) {
    while servers.join_next().await.is_some() {}
    listeners.wait().await;
}
