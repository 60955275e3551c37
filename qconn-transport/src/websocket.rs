use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use qconn_core::{CloseSignal, RpcError};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite, WebSocketStream};
use tracing::{debug, trace, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::channel::{FramedChannel, Pumps};
use crate::TransportError;

/// Attaches a message channel to an established WebSocket. Each message
/// travels as one text frame; binary frames holding JSON are accepted too.
pub fn websocket_channel<S>(stream: WebSocketStream<S>, peer: Option<String>) -> FramedChannel
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (channel, pumps) = FramedChannel::new(peer.clone());
    let Pumps {
        inbound,
        outbound,
        signal,
    } = pumps;
    let (sink, source) = stream.split();
    let peer = peer.unwrap_or_else(|| "websocket".to_string());

    tokio::spawn(read_messages(source, inbound, signal.clone(), peer.clone()));
    tokio::spawn(write_messages(sink, outbound, signal, peer));
    channel
}

/// Connects to a WebSocket server.
pub async fn connect(url: &str) -> Result<FramedChannel, TransportError> {
    let (stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::WebSocket(format!("Failed to connect: {}", e)))?;
    Ok(websocket_channel(stream, Some(url.to_string())))
}

/// Completes the server side of a WebSocket handshake.
pub async fn accept<S>(stream: S, peer: Option<String>) -> Result<FramedChannel, TransportError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| TransportError::WebSocket(format!("Handshake failed: {}", e)))?;
    Ok(websocket_channel(stream, peer))
}

async fn read_messages<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    inbound: mpsc::UnboundedSender<JsonValue>,
    signal: CloseSignal,
    peer: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = signal.wait() => break,
            frame = source.next() => frame,
        };
        let parsed = match frame {
            Some(Ok(WsMessage::Text(text))) => serde_json::from_str::<JsonValue>(text.as_str()),
            Some(Ok(WsMessage::Binary(data))) => serde_json::from_slice::<JsonValue>(&data),
            Some(Ok(WsMessage::Close(_))) | None => {
                debug!(peer = %peer, "websocket closed by peer");
                signal.close(None);
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(peer = %peer, error = %err, "websocket error");
                signal.close(Some(RpcError::internal(format!("WebSocket error: {}", err))));
                break;
            }
        };
        match parsed {
            Ok(message) => {
                trace!(peer = %peer, "message received");
                if inbound.send(message).is_err() {
                    signal.close(None);
                    break;
                }
            }
            // Frames are self-delimiting, so a bad one does not corrupt the rest.
            Err(err) => warn!(peer = %peer, error = %err, "ignoring frame that is not JSON"),
        }
    }
}

async fn write_messages<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbound: mpsc::UnboundedReceiver<JsonValue>,
    signal: CloseSignal,
    peer: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => {
                    let text = WsMessage::text(message.to_string());
                    if let Err(err) = sink.send(text).await {
                        warn!(peer = %peer, error = %err, "websocket send failed");
                        signal.close(Some(RpcError::internal(format!("WebSocket error: {}", err))));
                        return;
                    }
                }
                None => break,
            },
            _ = signal.wait() => break,
        }
    }

    while let Ok(message) = outbound.try_recv() {
        if sink.feed(WsMessage::text(message.to_string())).await.is_err() {
            break;
        }
    }
    if let Err(err) = sink.close().await {
        debug!(peer = %peer, error = %err, "websocket close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qconn_core::MessageChannel;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, peer) = listener.accept().await.unwrap();
            let channel = accept(socket, Some(peer.to_string())).await.unwrap();
            let message = channel.get().await.unwrap();
            channel.put(json!({"echo": message})).unwrap();
            channel.closed().await
        });

        let client = connect(&format!("ws://{}", addr)).await.unwrap();
        client.put(json!({"type": "pass", "id": 3})).unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), client.get())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, json!({"echo": {"type": "pass", "id": 3}}));

        client.close(None);
        let server_reason = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server_reason, None);
    }
}
