//! Cluster membership
//!
//! Each node learns which other nodes hold connections for an endpoint. The
//! proxy only asks [`Membership::owners_of`] when it has no local connection,
//! and tells membership when this node gains its first, or loses its last,
//! connection for an endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// How to reach a node's internal forwarding service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub node_id: String,
    /// host:port of the node's admin listener
    pub addr: String,
}

impl NodeAddress {
    pub fn new(node_id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            addr: addr.into(),
        }
    }
}

pub trait Membership: Send + Sync {
    /// Remote nodes currently holding a connection for `endpoint_id`
    fn owners_of(&self, endpoint_id: &str) -> Vec<NodeAddress>;

    /// This node gained its first connection for `endpoint_id`
    fn announce_local(&self, _endpoint_id: &str) {}

    /// This node lost its last connection for `endpoint_id`
    fn withdraw_local(&self, _endpoint_id: &str) {}
}

/// Membership for a node running alone
#[derive(Debug, Default, Clone, Copy)]
pub struct StandaloneMembership;

impl Membership for StandaloneMembership {
    fn owners_of(&self, _endpoint_id: &str) -> Vec<NodeAddress> {
        Vec::new()
    }
}

/// Shared table of which node holds which endpoints
#[derive(Debug, Default)]
pub struct ClusterView {
    nodes: RwLock<HashMap<String, NodeEntry>>,
}

#[derive(Debug)]
struct NodeEntry {
    address: NodeAddress,
    endpoints: HashSet<String>,
}

impl ClusterView {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Membership handle for the node at `local`
    pub fn join(self: &Arc<Self>, local: NodeAddress) -> ClusterMember {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(local.node_id.clone())
            .or_insert_with(|| NodeEntry {
                address: local.clone(),
                endpoints: HashSet::new(),
            });

        ClusterMember {
            view: self.clone(),
            local,
        }
    }

    /// Replace everything known about `node`
    pub fn set_endpoints(&self, node: NodeAddress, endpoints: HashSet<String>) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.insert(
            node.node_id.clone(),
            NodeEntry {
                address: node,
                endpoints,
            },
        );
    }

    pub fn add_endpoint(&self, node: &NodeAddress, endpoint_id: &str) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes
            .entry(node.node_id.clone())
            .or_insert_with(|| NodeEntry {
                address: node.clone(),
                endpoints: HashSet::new(),
            })
            .endpoints
            .insert(endpoint_id.to_string());
    }

    pub fn remove_endpoint(&self, node_id: &str, endpoint_id: &str) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = nodes.get_mut(node_id) {
            entry.endpoints.remove(endpoint_id);
        }
    }

    pub fn remove_node(&self, node_id: &str) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if nodes.remove(node_id).is_some() {
            debug!("Node {} left the cluster view", node_id);
        }
    }

    /// Nodes other than `exclude` that hold `endpoint_id`
    pub fn owners(&self, endpoint_id: &str, exclude: &str) -> Vec<NodeAddress> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes
            .values()
            .filter(|entry| entry.address.node_id != exclude)
            .filter(|entry| entry.endpoints.contains(endpoint_id))
            .map(|entry| entry.address.clone())
            .collect()
    }

    pub fn node_ids(&self) -> Vec<String> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes.keys().cloned().collect()
    }
}

/// One node's view of the cluster
#[derive(Debug, Clone)]
pub struct ClusterMember {
    view: Arc<ClusterView>,
    local: NodeAddress,
}

impl ClusterMember {
    pub fn local(&self) -> &NodeAddress {
        &self.local
    }

    pub fn view(&self) -> &Arc<ClusterView> {
        &self.view
    }

    /// Drop this node from the shared view
    pub fn leave(&self) {
        self.view.remove_node(&self.local.node_id);
    }
}

impl Membership for ClusterMember {
    fn owners_of(&self, endpoint_id: &str) -> Vec<NodeAddress> {
        self.view.owners(endpoint_id, &self.local.node_id)
    }

    fn announce_local(&self, endpoint_id: &str) {
        debug!(
            "Node {} now serves endpoint {}",
            self.local.node_id, endpoint_id
        );
        self.view.add_endpoint(&self.local, endpoint_id);
    }

    fn withdraw_local(&self, endpoint_id: &str) {
        debug!(
            "Node {} no longer serves endpoint {}",
            self.local.node_id, endpoint_id
        );
        self.view.remove_endpoint(&self.local.node_id, endpoint_id);
    }
}
