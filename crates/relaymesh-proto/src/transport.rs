//! Transport abstraction for the RPC stream
//!
//! A transport moves whole, already-encoded frames in both directions. The
//! stream splits it into an independent reader and writer so receiving never
//! waits on sending. Message-oriented transports (WebSocket) map one frame to
//! one message; byte-stream transports (TCP, in-memory pipes) use
//! [`FramedTransport`] which length-prefixes each frame.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::frame::Frame;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Receiving half of a transport
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Receive the next encoded frame.
    ///
    /// Returns `None` once the remote peer has closed the connection.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Sending half of a transport
#[async_trait]
pub trait FrameWriter: Send + 'static {
    /// Send one encoded frame
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the sending side
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A bidirectional frame transport
pub trait Transport: Send + 'static {
    type Reader: FrameReader;
    type Writer: FrameWriter;

    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Length-delimited frames over any byte stream
pub struct FramedTransport<T> {
    framed: Framed<T, LengthDelimitedCodec>,
}

/// Length-delimited frames over TCP
pub type TcpTransport = FramedTransport<TcpStream>;

impl<T> FramedTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(io: T) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(crate::MAX_PAYLOAD_SIZE as usize + Frame::HEADER_SIZE)
            .new_codec();

        Self {
            framed: Framed::new(io, codec),
        }
    }
}

impl<T> Transport for FramedTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Reader = FramedReader<T>;
    type Writer = FramedWriter<T>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.framed.split();
        (FramedReader { stream }, FramedWriter { sink })
    }
}

pub struct FramedReader<T> {
    stream: SplitStream<Framed<T, LengthDelimitedCodec>>,
}

#[async_trait]
impl<T> FrameReader for FramedReader<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.stream.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(TransportError::Io(e)),
            None => Ok(None),
        }
    }
}

pub struct FramedWriter<T> {
    sink: SplitSink<Framed<T, LengthDelimitedCodec>, Bytes>,
}

#[async_trait]
impl<T> FrameWriter for FramedWriter<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.sink.send(frame).await.map_err(TransportError::Io)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await.map_err(TransportError::Io)
    }
}
