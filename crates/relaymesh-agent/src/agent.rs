//! Keeps one registered connection per endpoint

use futures::future::try_join_all;
use relaymesh_proto::{Handler, Stream};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, EndpointConfig};
use crate::error::AgentError;
use crate::forwarder::LocalForwarder;
use crate::transport::{websocket_config, ClientTransport};

pub struct Agent {
    config: Arc<AgentConfig>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Serve every configured endpoint until `cancel` fires.
    ///
    /// Returns early with the first non-recoverable error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        let endpoints = self
            .config
            .endpoints
            .iter()
            .map(|endpoint| self.run_endpoint(endpoint, cancel.clone()));

        try_join_all(endpoints).await?;
        Ok(())
    }

    async fn run_endpoint(
        &self,
        endpoint: &EndpointConfig,
        cancel: CancellationToken,
    ) -> Result<(), AgentError> {
        let forwarder: Arc<dyn Handler> = Arc::new(LocalForwarder::new(
            endpoint.id.clone(),
            endpoint.addr.clone(),
            self.config.forward_timeout,
        ));
        let mut backoff = self.config.initial_backoff;

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                connected = self.connect(endpoint, forwarder.clone()) => connected,
            };

            match connected {
                Ok(stream) => {
                    backoff = self.config.initial_backoff;
                    info!(
                        "[{}] Registered with {}, forwarding to {}",
                        endpoint.id, self.config.server_url, endpoint.addr
                    );

                    let result = stream
                        .monitor(
                            cancel.clone(),
                            self.config.heartbeat_interval,
                            self.config.heartbeat_timeout,
                        )
                        .await;
                    stream.close();

                    match result {
                        Ok(()) => {
                            info!("[{}] Disconnected for shutdown", endpoint.id);
                            return Ok(());
                        }
                        Err(e) => warn!("[{}] Connection lost: {}", endpoint.id, e),
                    }
                }
                Err(e) if e.is_non_recoverable() => {
                    error!("[{}] {}", endpoint.id, e);
                    return Err(e);
                }
                Err(e) => warn!("[{}] {}", endpoint.id, e),
            }

            info!("[{}] Reconnecting in {:?}", endpoint.id, backoff);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff, self.config.max_backoff);
        }
    }

    async fn connect(
        &self,
        endpoint: &EndpointConfig,
        handler: Arc<dyn Handler>,
    ) -> Result<Stream, AgentError> {
        let url = self.config.listener_url(&endpoint.id);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::Config(format!("invalid server url {}: {}", url, e)))?;

        if let Some(token) = &self.config.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| AgentError::Config("token is not a valid header value".to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!("[{}] Connecting to {}", endpoint.id, url);
        match tokio_tungstenite::connect_async_with_config(request, Some(websocket_config()), false)
            .await
        {
            Ok((socket, _response)) => Ok(Stream::new(ClientTransport::new(socket), handler)),
            Err(WsError::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
                Err(AgentError::Unauthorized(endpoint.id.clone()))
            }
            Err(e) => Err(AgentError::Connect {
                url,
                reason: e.to_string(),
            }),
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
