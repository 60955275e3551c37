//! Transports for qconn connections: framed byte streams and WebSockets,
//! each exposed as a [`qconn_core::MessageChannel`].

pub mod channel;
pub mod codec;
pub mod error;
pub mod stream;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::FramedChannel;
pub use codec::{
    FrameCodec, FrameError, Framing, JsonLinesCodec, LengthPrefixedCodec, DEFAULT_MAX_FRAME_SIZE,
};
pub use error::TransportError;
pub use stream::stream_channel;
