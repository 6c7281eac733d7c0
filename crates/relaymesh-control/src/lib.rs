//! Control plane for relaymesh nodes
//!
//! Tracks the upstream connections a node holds, knows which peer nodes hold
//! the rest, and routes each proxied request to one of them.

pub mod cancel;
pub mod connection;
pub mod membership;
pub mod proxy;
pub mod registry;

pub use cancel::{child_with_deadline, deadline_from};
pub use connection::{Conn, ConnError, ConnId, RpcConn};
pub use membership::{ClusterMember, ClusterView, Membership, NodeAddress, StandaloneMembership};
pub use proxy::{NoPeers, PeerForwarder, Proxy, ProxyError};
pub use registry::{ConnectionManager, ConnectionRegistry, Registration};
