//! Static-peer membership
//!
//! Each node polls the endpoint table of every configured peer and keeps
//! the shared [`ClusterView`] up to date. A peer that cannot be reached is
//! dropped from the view until it answers again, so the view is eventually
//! consistent and may briefly route to a node that just lost an endpoint.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use relaymesh_control::{ClusterView, NodeAddress};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin::{EndpointsResponse, ENDPOINTS_PATH};

#[derive(Debug, Error)]
enum PollError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected status {0}")]
    Status(http::StatusCode),

    #[error("invalid endpoint table: {0}")]
    Body(String),

    #[error("timed out")]
    Timeout,
}

pub struct PeerPoller {
    view: Arc<ClusterView>,
    peers: Vec<NodeAddress>,
    client: Client<HttpConnector, Empty<Bytes>>,
    interval: Duration,
}

impl PeerPoller {
    pub fn new(view: Arc<ClusterView>, peers: Vec<NodeAddress>, interval: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            view,
            peers,
            client,
            interval,
        }
    }

    /// Poll every peer each interval until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        if self.peers.is_empty() {
            return;
        }

        info!(
            "Polling {} peer(s) every {:?}",
            self.peers.len(),
            self.interval
        );

        loop {
            self.poll_all().await;

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Peer poller stopping");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Refresh the view from every peer once
    pub async fn poll_all(&self) {
        for peer in &self.peers {
            match self.fetch(peer).await {
                Ok(endpoints) => {
                    debug!("[{}] Peer holds {} endpoint(s)", peer.node_id, endpoints.len());
                    self.view.set_endpoints(peer.clone(), endpoints);
                }
                Err(e) => {
                    warn!("[{}] Failed to poll peer at {}: {}", peer.node_id, peer.addr, e);
                    self.view.remove_node(&peer.node_id);
                }
            }
        }
    }

    async fn fetch(&self, peer: &NodeAddress) -> Result<HashSet<String>, PollError> {
        let request = http::Request::get(format!("http://{}{}", peer.addr, ENDPOINTS_PATH))
            .body(Empty::new())
            .map_err(|e| PollError::Request(e.to_string()))?;

        let response = tokio::time::timeout(self.interval, self.client.request(request))
            .await
            .map_err(|_| PollError::Timeout)?
            .map_err(|e| PollError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PollError::Status(response.status()));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| PollError::Body(e.to_string()))?
            .to_bytes();
        let table: EndpointsResponse =
            serde_json::from_slice(&body).map_err(|e| PollError::Body(e.to_string()))?;

        if table.node_id != peer.node_id {
            warn!(
                "[{}] Peer at {} reports node id {}",
                peer.node_id, peer.addr, table.node_id
            );
        }

        Ok(table
            .endpoints
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(endpoint_id, _)| endpoint_id)
            .collect())
    }
}
