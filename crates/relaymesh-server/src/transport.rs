//! RPC transport over an accepted WebSocket

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relaymesh_proto::{FrameReader, FrameWriter, Transport, TransportError};
use tracing::trace;

/// One binary WebSocket message per frame
pub struct WebSocketTransport {
    socket: WebSocket,
}

impl WebSocketTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl Transport for WebSocketTransport {
    type Reader = WebSocketReader;
    type Writer = WebSocketWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.socket.split();
        (WebSocketReader { stream }, WebSocketWriter { sink })
    }
}

pub struct WebSocketReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameReader for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        while let Some(message) = self.stream.next().await {
            match message.map_err(|e| TransportError::WebSocket(e.to_string()))? {
                Message::Binary(data) => return Ok(Some(data)),
                Message::Close(frame) => {
                    trace!("WebSocket closed by peer: {:?}", frame);
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Text(_) => {
                    return Err(TransportError::Protocol(
                        "unexpected text message".to_string(),
                    ))
                }
            }
        }
        Ok(None)
    }
}

pub struct WebSocketWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameWriter for WebSocketWriter {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(frame))
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
