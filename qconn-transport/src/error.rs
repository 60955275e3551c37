use thiserror::Error;

use crate::codec::FrameError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}
