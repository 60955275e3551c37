use async_trait::async_trait;
use qconn_core::{ChannelError, CloseSignal, MessageChannel, RpcError};
use serde_json::Value as JsonValue;
use std::fmt;
use tokio::sync::{mpsc, Mutex};

/// Message channel fed by background I/O tasks.
///
/// The transport owns the other side ([`Pumps`]): it pushes decoded inbound
/// messages, drains outbound ones, and closes the shared signal when the
/// underlying stream ends.
pub struct FramedChannel {
    outbound: mpsc::UnboundedSender<JsonValue>,
    inbound: Mutex<mpsc::UnboundedReceiver<JsonValue>>,
    signal: CloseSignal,
    peer: Option<String>,
}

/// Transport side of a [`FramedChannel`].
pub(crate) struct Pumps {
    pub(crate) inbound: mpsc::UnboundedSender<JsonValue>,
    pub(crate) outbound: mpsc::UnboundedReceiver<JsonValue>,
    pub(crate) signal: CloseSignal,
}

impl FramedChannel {
    pub(crate) fn new(peer: Option<String>) -> (Self, Pumps) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let signal = CloseSignal::new();
        (
            FramedChannel {
                outbound: out_tx,
                inbound: Mutex::new(in_rx),
                signal: signal.clone(),
                peer,
            },
            Pumps {
                inbound: in_tx,
                outbound: out_rx,
                signal,
            },
        )
    }

    /// Remote address or URL, when the transport knows it.
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }
}

impl fmt::Debug for FramedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedChannel")
            .field("peer", &self.peer)
            .field("closed", &self.signal.is_closed())
            .finish()
    }
}

#[async_trait]
impl MessageChannel for FramedChannel {
    async fn get(&self) -> Result<JsonValue, ChannelError> {
        let mut inbound = self.inbound.lock().await;
        if let Ok(message) = inbound.try_recv() {
            return Ok(message);
        }
        tokio::select! {
            biased;
            message = inbound.recv() => match message {
                Some(message) => Ok(message),
                None => {
                    self.signal.close(None);
                    Err(ChannelError::Closed(self.signal.reason().flatten()))
                }
            },
            reason = self.signal.wait() => {
                // The reader may have queued a last message before closing.
                match inbound.try_recv() {
                    Ok(message) => Ok(message),
                    Err(_) => Err(ChannelError::Closed(reason)),
                }
            }
        }
    }

    fn put(&self, message: JsonValue) -> Result<(), ChannelError> {
        if let Some(reason) = self.signal.reason() {
            return Err(ChannelError::Closed(reason));
        }
        self.outbound
            .send(message)
            .map_err(|_| ChannelError::Send("writer task has stopped".to_string()))
    }

    async fn closed(&self) -> Option<RpcError> {
        self.signal.wait().await
    }

    fn close(&self, reason: Option<RpcError>) {
        self.signal.close(reason);
    }
}
