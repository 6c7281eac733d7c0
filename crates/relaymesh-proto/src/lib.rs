//! Relaymesh Protocol Definitions
//!
//! This crate defines the frame format spoken on an upstream connection, the
//! multiplexed RPC stream built on top of it, and the HTTP messages tunnelled
//! through that stream.

pub mod frame;
pub mod messages;
pub mod path;
pub mod stream;
pub mod transport;

pub use frame::{CallId, Frame, FrameError, FrameKind, RpcType};
pub use messages::{
    decode_forward_result, encode_forward_result, is_hop_by_hop, ForwardFailure, ForwardResult,
    HttpRequest, HttpResponse, MessageError,
};
pub use path::endpoint_path_segment;
pub use stream::{Handler, RejectingHandler, RpcError, Stream};
pub use transport::{
    FrameReader, FrameWriter, FramedTransport, TcpTransport, Transport, TransportError,
};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size (16MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Largest encoded frame, and so the largest transport message
pub const MAX_FRAME_SIZE: usize = Frame::HEADER_SIZE + MAX_PAYLOAD_SIZE as usize;
