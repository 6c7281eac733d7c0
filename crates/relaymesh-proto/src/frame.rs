//! Frame encoding for the RPC stream

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Identifier of an in-flight call, unique per stream direction
pub type CallId = u64;

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Response = 1,
    Error = 2,
    Close = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(FrameKind::Request),
            1 => Ok(FrameKind::Response),
            2 => Ok(FrameKind::Error),
            3 => Ok(FrameKind::Close),
            _ => Err(FrameError::InvalidKind(value)),
        }
    }
}

/// RPC type carried by every frame of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcType(pub u16);

impl RpcType {
    /// Liveness probe, answered by the stream itself
    pub const HEARTBEAT: RpcType = RpcType(1);
    /// Serialized HTTP request in, serialized HTTP response out
    pub const PROXY_HTTP: RpcType = RpcType(2);
}

impl fmt::Display for RpcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RpcType::HEARTBEAT => write!(f, "heartbeat"),
            RpcType::PROXY_HTTP => write!(f, "proxy_http"),
            RpcType(other) => write!(f, "rpc_{}", other),
        }
    }
}

/// A single frame on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub call_id: CallId,
    pub rpc_type: RpcType,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: kind (1) + call_id (8) + rpc_type (2) + length (4) = 15 bytes
    pub const HEADER_SIZE: usize = 15;

    pub fn request(call_id: CallId, rpc_type: RpcType, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Request,
            call_id,
            rpc_type,
            payload,
        }
    }

    pub fn response(call_id: CallId, rpc_type: RpcType, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Response,
            call_id,
            rpc_type,
            payload,
        }
    }

    /// Application error reply; the message travels as UTF-8 payload
    pub fn error(call_id: CallId, rpc_type: RpcType, message: &str) -> Self {
        Self {
            kind: FrameKind::Error,
            call_id,
            rpc_type,
            payload: Bytes::copy_from_slice(message.as_bytes()),
        }
    }

    pub fn close() -> Self {
        Self {
            kind: FrameKind::Close,
            call_id: 0,
            rpc_type: RpcType(0),
            payload: Bytes::new(),
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_PAYLOAD_SIZE as usize {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);

        buf.put_u8(self.kind as u8);
        buf.put_u64(self.call_id);
        buf.put_u16(self.rpc_type.0);
        buf.put_u32(payload_len as u32);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }

    /// Decode a frame from one complete transport message
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(FrameError::Incomplete);
        }

        let kind = FrameKind::try_from(buf.get_u8())?;
        let call_id = buf.get_u64();
        let rpc_type = RpcType(buf.get_u16());
        let length = buf.get_u32();

        if length > crate::MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(length as usize));
        }

        if buf.remaining() < length as usize {
            return Err(FrameError::Incomplete);
        }

        let payload = buf.split_to(length as usize);
        if buf.has_remaining() {
            return Err(FrameError::TrailingBytes(buf.remaining()));
        }

        Ok(Self {
            kind,
            call_id,
            rpc_type,
            payload,
        })
    }
}

/// Frame errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid frame kind: {0}")]
    InvalidKind(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Incomplete frame")]
    Incomplete,

    #[error("{0} trailing bytes after frame payload")]
    TrailingBytes(usize),
}
