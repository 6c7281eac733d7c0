//! Serves proxy calls by forwarding them to a local HTTP service

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use relaymesh_proto::{Handler, HttpRequest, HttpResponse, RpcError, RpcType};
use std::time::Duration;
use tracing::{debug, warn};

/// Handler forwarding each `ProxyHttp` call to one local address
#[derive(Clone)]
pub struct LocalForwarder {
    endpoint_id: String,
    addr: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl LocalForwarder {
    pub fn new(endpoint_id: impl Into<String>, addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            addr: addr.into(),
            timeout,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Send `request` to the local service and return its response
    pub async fn forward(&self, mut request: HttpRequest) -> Result<HttpResponse, RpcError> {
        let path = request.uri.clone();
        request.uri = format!("http://{}{}", self.addr, path);

        let request = request
            .into_http()
            .map_err(|e| RpcError::Remote(e.to_string()))?
            .map(Full::new);

        debug!(
            "[{}] {} {} -> {}",
            self.endpoint_id,
            request.method(),
            path,
            self.addr
        );

        // One deadline covers the response head and the whole body
        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| {
                warn!(
                    "[{}] Local service at {} unreachable: {}",
                    self.endpoint_id, self.addr, e
                );
                RpcError::Remote(format!("local service unreachable: {}", e))
            })?;

            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| RpcError::Remote(format!("failed to read local response: {}", e)))?
                .to_bytes();

            Ok::<_, RpcError>(HttpResponse::from_parts(&parts, body))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                warn!("[{}] Local service at {} timed out", self.endpoint_id, self.addr);
                RpcError::Remote(format!("local service timed out after {:?}", self.timeout))
            })?
    }
}

#[async_trait]
impl Handler for LocalForwarder {
    async fn handle(&self, rpc_type: RpcType, payload: Bytes) -> Result<Bytes, RpcError> {
        if rpc_type != RpcType::PROXY_HTTP {
            return Err(RpcError::Unsupported(rpc_type));
        }

        let request =
            HttpRequest::decode(&payload).map_err(|e| RpcError::Remote(e.to_string()))?;
        let response = self.forward(request).await?;
        response
            .encode()
            .map_err(|e| RpcError::Remote(e.to_string()))
    }
}
