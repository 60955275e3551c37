//! Message channels over byte streams (TCP sockets, pipes, duplex buffers).

use futures::{SinkExt, StreamExt};
use qconn_core::{CloseSignal, RpcError};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::channel::{FramedChannel, Pumps};
use crate::codec::{FrameCodec, FrameError};

/// Attaches a message channel to `stream`.
///
/// One task decodes frames into the inbound queue and another encodes
/// outbound messages. End of stream closes the channel without a reason;
/// framing and I/O errors close it with one. Closing the channel flushes
/// pending output and shuts the write half down.
pub fn stream_channel<S>(stream: S, codec: FrameCodec, peer: Option<String>) -> FramedChannel
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (channel, pumps) = FramedChannel::new(peer.clone());
    let Pumps {
        inbound,
        outbound,
        signal,
    } = pumps;
    let (read_half, write_half) = tokio::io::split(stream);
    let peer = peer.unwrap_or_else(|| "stream".to_string());

    tokio::spawn(read_frames(
        FramedRead::new(read_half, codec.clone()),
        inbound,
        signal.clone(),
        peer.clone(),
    ));
    tokio::spawn(write_frames(
        FramedWrite::new(write_half, codec),
        outbound,
        signal,
        peer,
    ));
    channel
}

async fn read_frames<S>(
    mut reader: FramedRead<ReadHalf<S>, FrameCodec>,
    inbound: mpsc::UnboundedSender<JsonValue>,
    signal: CloseSignal,
    peer: String,
) where
    S: AsyncRead + AsyncWrite,
{
    loop {
        tokio::select! {
            biased;
            _ = signal.wait() => break,
            frame = reader.next() => match frame {
                Some(Ok(message)) => {
                    trace!(peer = %peer, "frame received");
                    if inbound.send(message).is_err() {
                        signal.close(None);
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!(peer = %peer, error = %err, "closing stream after framing error");
                    signal.close(Some(frame_failure(&err)));
                    break;
                }
                None => {
                    debug!(peer = %peer, "stream ended");
                    signal.close(None);
                    break;
                }
            }
        }
    }
}

async fn write_frames<S>(
    mut writer: FramedWrite<WriteHalf<S>, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<JsonValue>,
    signal: CloseSignal,
    peer: String,
) where
    S: AsyncRead + AsyncWrite,
{
    loop {
        tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(err) = writer.send(message).await {
                        warn!(peer = %peer, error = %err, "closing stream after write error");
                        signal.close(Some(frame_failure(&err)));
                        return;
                    }
                }
                None => break,
            },
            _ = signal.wait() => break,
        }
    }

    while let Ok(message) = outbound.try_recv() {
        if writer.feed(message).await.is_err() {
            break;
        }
    }
    if let Err(err) = writer.close().await {
        debug!(peer = %peer, error = %err, "shutdown of write half failed");
    }
}

fn frame_failure(err: &FrameError) -> RpcError {
    match err {
        FrameError::Io(_) => RpcError::internal(err.to_string()),
        _ => RpcError::bad_request(err.to_string()),
    }
}
