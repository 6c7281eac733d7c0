//! Forwarding to peer nodes over their admin listener

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use relaymesh_control::{NodeAddress, PeerForwarder, ProxyError};
use relaymesh_proto::{
    decode_forward_result, endpoint_path_segment, HttpRequest, HttpResponse,
};
use tracing::{debug, warn};

/// URL of a peer's forward route for `endpoint_id`
pub fn forward_url(peer: &NodeAddress, endpoint_id: &str) -> String {
    format!(
        "http://{}/relaymesh/v1/forward/{}",
        peer.addr,
        endpoint_path_segment(endpoint_id)
    )
}

/// Delivers requests to the admin listener of the peer holding the endpoint
#[derive(Clone)]
pub struct HttpPeerForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpPeerForwarder {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client }
    }
}

impl Default for HttpPeerForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerForwarder for HttpPeerForwarder {
    async fn forward(
        &self,
        peer: &NodeAddress,
        endpoint_id: &str,
        request: HttpRequest,
    ) -> Result<HttpResponse, ProxyError> {
        let body = request
            .encode()
            .map_err(|e| ProxyError::Peer(format!("failed to encode request: {}", e)))?;

        let hop = http::Request::post(forward_url(peer, endpoint_id))
            .header(http::header::CONTENT_TYPE, "application/octet-stream")
            .body(Full::new(body))
            .map_err(|e| ProxyError::Peer(format!("invalid peer request: {}", e)))?;

        debug!("[{}] Forwarding request for {}", peer.node_id, endpoint_id);
        let response = self.client.request(hop).await.map_err(|e| {
            warn!("[{}] Peer unreachable: {}", peer.node_id, e);
            ProxyError::Peer(format!("peer {} unreachable: {}", peer.node_id, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!("[{}] Peer answered forward with {}", peer.node_id, status);
            return Err(ProxyError::Peer(format!(
                "peer {} answered {}",
                peer.node_id, status
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::Peer(format!("failed to read peer response: {}", e)))?
            .to_bytes();

        decode_forward_result(&body)
            .map_err(|e| ProxyError::Peer(format!("invalid peer response: {}", e)))?
            .map_err(|failure| ProxyError::from_failure(endpoint_id, failure))
    }
}
