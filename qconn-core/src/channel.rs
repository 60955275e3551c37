use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::RpcError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed(Option<RpcError>),
    #[error("channel send failed: {0}")]
    Send(String),
}

impl ChannelError {
    /// The close reason, when the error reports a closed channel.
    pub fn reason(&self) -> Option<RpcError> {
        match self {
            ChannelError::Closed(reason) => reason.clone(),
            ChannelError::Send(message) => Some(RpcError::internal(message.clone())),
        }
    }
}

/// Ordered, reliable delivery of JSON messages in both directions.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Next inbound message. Fails with the close reason once the channel
    /// has closed and everything already received has been handed out.
    async fn get(&self) -> Result<JsonValue, ChannelError>;

    /// Queues an outbound message.
    fn put(&self, message: JsonValue) -> Result<(), ChannelError>;

    /// Settles when the channel closes, with the reason it closed.
    async fn closed(&self) -> Option<RpcError>;

    fn close(&self, reason: Option<RpcError>);
}

#[derive(Debug, Clone)]
enum Closure {
    Open,
    Closed(Option<RpcError>),
}

/// One-shot closed signal shared by the ends of a channel.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    state: Arc<watch::Sender<Closure>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Closure::Open);
        CloseSignal {
            state: Arc::new(state),
        }
    }

    /// Closes with `reason`. Returns false if it was already closed; the
    /// first reason is kept.
    pub fn close(&self, reason: Option<RpcError>) -> bool {
        self.state.send_if_modified(|state| match state {
            Closure::Open => {
                *state = Closure::Closed(reason);
                true
            }
            Closure::Closed(_) => false,
        })
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), Closure::Closed(_))
    }

    /// `Some(reason)` once closed.
    pub fn reason(&self) -> Option<Option<RpcError>> {
        match &*self.state.borrow() {
            Closure::Open => None,
            Closure::Closed(reason) => Some(reason.clone()),
        }
    }

    pub async fn wait(&self) -> Option<RpcError> {
        let mut rx = self.state.subscribe();
        let closure = match rx.wait_for(|state| matches!(state, Closure::Closed(_))).await {
            Ok(state) => state.clone(),
            Err(_) => return None,
        };
        match closure {
            Closure::Closed(reason) => reason,
            Closure::Open => None,
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// One end of an in-process channel pair.
#[derive(Debug)]
pub struct LocalChannel {
    outbound: mpsc::UnboundedSender<JsonValue>,
    inbound: Mutex<mpsc::UnboundedReceiver<JsonValue>>,
    signal: CloseSignal,
}

/// Two linked in-process channel ends. Closing either end closes both with
/// the same reason.
pub fn pair() -> (LocalChannel, LocalChannel) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let signal = CloseSignal::new();
    (
        LocalChannel {
            outbound: a_tx,
            inbound: Mutex::new(b_rx),
            signal: signal.clone(),
        },
        LocalChannel {
            outbound: b_tx,
            inbound: Mutex::new(a_rx),
            signal,
        },
    )
}

#[async_trait]
impl MessageChannel for LocalChannel {
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
            reason = self.signal.wait() => Err(ChannelError::Closed(reason)),
        }
    }

    fn put(&self, message: JsonValue) -> Result<(), ChannelError> {
        if let Some(reason) = self.signal.reason() {
            return Err(ChannelError::Closed(reason));
        }
        self.outbound
            .send(message)
            .map_err(|_| ChannelError::Closed(None))
    }

    async fn closed(&self) -> Option<RpcError> {
        self.signal.wait().await
    }

    fn close(&self, reason: Option<RpcError>) {
        self.signal.close(reason);
    }
}
