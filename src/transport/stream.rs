//! Driver task for stream-based transports.
//!
//! Any sink/stream of whole frames (a `Framed` TCP socket, an adapted
//! WebSocket) is serviced by the same loop.

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::core::codec::FrameCodec;
use crate::error::{ProtocolError, Result};
use crate::transport::{channel_pair, ChannelDriver, DisconnectReason, FramedChannel};

/// Spawn a task that pumps frames between `io` and a new [`FramedChannel`].
pub fn spawn_framed<S>(io: S, remote: impl Into<String>, capacity: usize) -> FramedChannel
where
    S: Stream<Item = Result<Bytes>> + Sink<Bytes, Error = ProtocolError> + Send + Unpin + 'static,
{
    let remote = remote.into();
    let (channel, driver) = channel_pair(remote.clone(), capacity);
    tokio::spawn(async move {
        let mut driver = driver;
        let reason = pump(io, &mut driver).await;
        debug!(%remote, %reason, "stream channel closed");
        driver.finish(reason);
    });
    channel
}

/// Frame a raw byte stream with [`FrameCodec`] and spawn its driver.
pub fn spawn_stream<T>(io: T, remote: impl Into<String>, capacity: usize) -> FramedChannel
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    spawn_framed(Framed::new(io, FrameCodec), remote, capacity)
}

async fn pump<S>(mut io: S, driver: &mut ChannelDriver) -> DisconnectReason
where
    S: Stream<Item = Result<Bytes>> + Sink<Bytes, Error = ProtocolError> + Unpin,
{
    loop {
        tokio::select! {
            _ = driver.shutdown.cancelled() => {
                let _ = io.close().await;
                return DisconnectReason::UserInitiated;
            }
            frame = driver.outgoing.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = io.send(frame).await {
                        warn!(error = %e, "frame write failed");
                        return DisconnectReason::Error(e.to_string());
                    }
                }
                None => {
                    let _ = io.close().await;
                    return DisconnectReason::UserInitiated;
                }
            },
            frame = io.next() => match frame {
                Some(Ok(frame)) => {
                    if driver.incoming.send(frame).await.is_err() {
                        let _ = io.close().await;
                        return DisconnectReason::UserInitiated;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "frame read failed");
                    return DisconnectReason::Error(e.to_string());
                }
                None => return DisconnectReason::RemoteClosed,
            },
        }
    }
}
