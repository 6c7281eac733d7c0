//! RPC transport over an outbound WebSocket

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relaymesh_proto::{FrameReader, FrameWriter, Transport, TransportError, MAX_FRAME_SIZE};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::trace;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client settings admitting every frame the protocol can produce
pub fn websocket_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_FRAME_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    }
}

/// One binary WebSocket message per frame
pub struct ClientTransport {
    socket: WsStream,
}

impl ClientTransport {
    pub fn new(socket: WsStream) -> Self {
        Self { socket }
    }
}

impl Transport for ClientTransport {
    type Reader = ClientReader;
    type Writer = ClientWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.socket.split();
        (ClientReader { stream }, ClientWriter { sink })
    }
}

pub struct ClientReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for ClientReader {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        while let Some(message) = self.stream.next().await {
            match message.map_err(|e| TransportError::WebSocket(e.to_string()))? {
                Message::Binary(data) => return Ok(Some(Bytes::from(data))),
                Message::Close(frame) => {
                    trace!("WebSocket closed by server: {:?}", frame);
                    return Ok(None);
                }
                Message::Text(_) => {
                    return Err(TransportError::Protocol(
                        "unexpected text message".to_string(),
                    ))
                }
                // Pings are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
        Ok(None)
    }
}

pub struct ClientWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for ClientWriter {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}
