//! WebSocket transport: one binary message per frame.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, instrument};

use crate::discovery::Endpoint;
use crate::error::{ProtocolError, Result};
use crate::transport::stream::spawn_framed;
use crate::transport::{FramedChannel, Transport};
use crate::utils::timeout::with_timeout;

const SOCKET_PATH: &str = "/cmsocket/";

/// `wss://host/cmsocket/`, or `ws://` when TLS is off.
pub fn socket_url(address: &str, secure: bool) -> String {
    let scheme = if secure { "wss" } else { "ws" };
    format!("{scheme}://{address}{SOCKET_PATH}")
}

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
    capacity: usize,
    secure: bool,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration, capacity: usize) -> Self {
        Self {
            connect_timeout,
            capacity,
            secure: true,
        }
    }

    /// Connect over plain `ws://`. Only useful against local test servers.
    pub fn insecure(mut self) -> Self {
        self.secure = false;
        self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    #[instrument(skip(self), fields(address = %endpoint.address()))]
    async fn open(&self, endpoint: &Endpoint) -> Result<FramedChannel> {
        let url = socket_url(endpoint.address(), self.secure);
        let (socket, _) = with_timeout(connect_async(url.as_str()), self.connect_timeout)
            .await
            .map_err(|_| ProtocolError::ConnectionFailed(format!("{endpoint}: connect timed out")))?
            .map_err(|e| ProtocolError::ConnectionFailed(format!("{endpoint}: {e}")))?;
        debug!(%url, "websocket connected");

        let io = socket
            .sink_map_err(ProtocolError::from)
            .with(|frame: Bytes| future::ready(Ok::<_, ProtocolError>(Message::Binary(frame.to_vec()))))
            .filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                    Ok(_) => None,
                    Err(e) => Some(Err(ProtocolError::from(e))),
                })
            });

        Ok(spawn_framed(io, url, self.capacity))
    }
}
