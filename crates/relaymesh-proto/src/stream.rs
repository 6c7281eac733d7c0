//! Multiplexed RPC stream over a single transport
//!
//! Either side may issue calls. Each call gets a fresh call id and the reply
//! is routed back to the caller by that id, so any number of calls can be in
//! flight at once and replies may arrive in any order. Incoming requests are
//! dispatched to a [`Handler`] on their own task, except heartbeats, which the
//! stream answers itself.
//!
//! A stream runs a reader task and a writer task until it is closed. It closes
//! when the transport fails or ends, when the peer sends a close frame, when a
//! frame fails to decode, or when [`Stream::close`] is called. Closing fails
//! every pending call with [`RpcError::ConnectionClosed`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::frame::{CallId, Frame, FrameKind, RpcType};
use crate::transport::{FrameReader, FrameWriter, Transport};

const OUTBOUND_QUEUE: usize = 256;

/// RPC errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("heartbeat timed out")]
    HeartbeatTimeout,

    #[error("{0}")]
    Remote(String),

    #[error("unsupported rpc type: {0}")]
    Unsupported(RpcType),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Serves requests arriving on a stream
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one request. An `Err` is sent back to the caller as an error frame.
    async fn handle(&self, rpc_type: RpcType, payload: Bytes) -> Result<Bytes, RpcError>;
}

/// Handler for sides that only issue calls
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectingHandler;

#[async_trait]
impl Handler for RejectingHandler {
    async fn handle(&self, rpc_type: RpcType, _payload: Bytes) -> Result<Bytes, RpcError> {
        Err(RpcError::Unsupported(rpc_type))
    }
}

type PendingCall = oneshot::Sender<Result<Bytes, RpcError>>;

/// Handle to a running RPC stream. Clones share the same stream.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    next_call_id: AtomicU64,
    pending: Mutex<HashMap<CallId, PendingCall>>,
    outbound: mpsc::Sender<Frame>,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
    last_seen: Mutex<Instant>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Stream {
    /// Start a stream over `transport`, serving incoming requests with `handler`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<T: Transport>(transport: T, handler: Arc<dyn Handler>) -> Self {
        let id = format!("rpc-{}", uuid::Uuid::new_v4());
        let (reader, writer) = transport.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let inner = Arc::new(Inner {
            id,
            next_call_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound,
            handler,
            shutdown: CancellationToken::new(),
            last_seen: Mutex::new(Instant::now()),
        });

        tokio::spawn(write_loop(inner.clone(), writer, outbound_rx));
        tokio::spawn(read_loop(inner.clone(), reader));

        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Issue a call and wait for its reply.
    ///
    /// Dropping the returned future abandons the call; a reply that arrives
    /// afterwards is discarded.
    pub async fn rpc(&self, rpc_type: RpcType, payload: Bytes) -> Result<Bytes, RpcError> {
        if payload.len() > crate::MAX_PAYLOAD_SIZE as usize {
            return Err(RpcError::PayloadTooLarge(payload.len()));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }

        let call_id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(call_id, tx);
        let _pending = PendingGuard {
            inner: &*self.inner,
            call_id,
        };

        // close() may have drained the table before the insert above
        if self.inner.shutdown.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }

        trace!("[{}] Sending call {} ({})", self.inner.id, call_id, rpc_type);
        if self
            .inner
            .outbound
            .send(Frame::request(call_id, rpc_type, payload))
            .await
            .is_err()
        {
            return Err(RpcError::ConnectionClosed);
        }

        tokio::select! {
            reply = rx => reply.unwrap_or(Err(RpcError::ConnectionClosed)),
            _ = self.inner.shutdown.cancelled() => Err(RpcError::ConnectionClosed),
        }
    }

    /// Heartbeat the remote peer until `cancel` fires or the peer is found dead.
    ///
    /// Returns `Ok(())` when cancelled. Returns an error, after closing the
    /// stream, when a heartbeat gets no reply within `timeout` and no other
    /// frame arrived in that window, or when the stream closes underneath.
    pub async fn monitor(
        &self,
        cancel: CancellationToken,
        interval: Duration,
        timeout: Duration,
    ) -> Result<(), RpcError> {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.inner.shutdown.cancelled() => return Err(RpcError::ConnectionClosed),
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.heartbeat(timeout) => result,
            };

            if let Err(e) = result {
                warn!("[{}] Peer failed heartbeat: {}", self.inner.id, e);
                self.close();
                return Err(e);
            }
        }
    }

    async fn heartbeat(&self, timeout: Duration) -> Result<(), RpcError> {
        let sent_at = Instant::now();

        match tokio::time::timeout(timeout, self.rpc(RpcType::HEARTBEAT, Bytes::new())).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) if self.inner.last_seen() > sent_at => {
                debug!(
                    "[{}] Heartbeat reply late but peer is sending traffic",
                    self.inner.id
                );
                Ok(())
            }
            Err(_) => Err(RpcError::HeartbeatTimeout),
        }
    }

    /// Close the stream. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Wait until the stream has closed
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<CallId, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, call_id: CallId, result: Result<Bytes, RpcError>) {
        match self.pending().remove(&call_id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => trace!("[{}] Dropping reply for unknown call {}", self.id, call_id),
        }
    }

    fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let pending = std::mem::take(&mut *self.pending());
        if !pending.is_empty() {
            debug!(
                "[{}] Failing {} pending calls on close",
                self.id,
                pending.len()
            );
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        let inner = self.clone();

        tokio::spawn(async move {
            let Frame {
                call_id,
                rpc_type,
                payload,
                ..
            } = frame;

            let reply = if rpc_type == RpcType::HEARTBEAT {
                Frame::response(call_id, rpc_type, payload)
            } else {
                let handled = AssertUnwindSafe(inner.handler.handle(rpc_type, payload))
                    .catch_unwind()
                    .await;

                match handled {
                    Ok(Ok(body)) if body.len() <= crate::MAX_PAYLOAD_SIZE as usize => {
                        Frame::response(call_id, rpc_type, body)
                    }
                    Ok(Ok(body)) => Frame::error(
                        call_id,
                        rpc_type,
                        &RpcError::PayloadTooLarge(body.len()).to_string(),
                    ),
                    Ok(Err(e)) => Frame::error(call_id, rpc_type, &e.to_string()),
                    Err(_) => {
                        error!(
                            "[{}] Handler panicked serving call {} ({})",
                            inner.id, call_id, rpc_type
                        );
                        Frame::error(call_id, rpc_type, "internal error")
                    }
                }
            };

            if inner.outbound.send(reply).await.is_err() {
                trace!("[{}] Stream closed before reply to {}", inner.id, call_id);
            }
        });
    }
}

/// Releases a pending slot when its caller stops waiting
struct PendingGuard<'a> {
    inner: &'a Inner,
    call_id: CallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending().remove(&self.call_id);
    }
}

async fn write_loop<W: FrameWriter>(
    inner: Arc<Inner>,
    mut writer: W,
    mut outbound: mpsc::Receiver<Frame>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("[{}] Dropping unencodable frame: {}", inner.id, e);
                continue;
            }
        };

        if let Err(e) = writer.send(encoded).await {
            debug!("[{}] Transport write failed: {}", inner.id, e);
            break;
        }
    }

    if let Ok(close) = Frame::close().encode() {
        let _ = writer.send(close).await;
    }
    let _ = writer.close().await;

    debug!("[{}] Writer task ended", inner.id);
    inner.close();
}

async fn read_loop<R: FrameReader>(inner: Arc<Inner>, mut reader: R) {
    let reason = loop {
        let received = tokio::select! {
            _ = inner.shutdown.cancelled() => break "closed locally".to_string(),
            received = reader.recv() => received,
        };

        let data = match received {
            Ok(Some(data)) => data,
            Ok(None) => break "transport ended".to_string(),
            Err(e) => break format!("transport error: {}", e),
        };

        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => break format!("protocol error: {}", e),
        };

        inner.touch();

        match frame.kind {
            FrameKind::Request => inner.dispatch(frame),
            FrameKind::Response => inner.complete(frame.call_id, Ok(frame.payload)),
            FrameKind::Error => {
                let message = String::from_utf8_lossy(&frame.payload).into_owned();
                inner.complete(frame.call_id, Err(RpcError::Remote(message)));
            }
            FrameKind::Close => break "peer closed".to_string(),
        }
    };

    debug!("[{}] Reader task ended: {}", inner.id, reason);
    inner.close();
}
