//! TCP transport: `VT01` length-prefixed frames over a plain socket.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::discovery::Endpoint;
use crate::error::{ProtocolError, Result};
use crate::transport::stream::spawn_stream;
use crate::transport::{FramedChannel, Transport};
use crate::utils::timeout::with_timeout;

#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    capacity: usize,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, capacity: usize) -> Self {
        Self {
            connect_timeout,
            capacity,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    #[instrument(skip(self), fields(address = %endpoint.address()))]
    async fn open(&self, endpoint: &Endpoint) -> Result<FramedChannel> {
        let stream = with_timeout(TcpStream::connect(endpoint.address()), self.connect_timeout)
            .await
            .map_err(|_| ProtocolError::ConnectionFailed(format!("{endpoint}: connect timed out")))?
            .map_err(|e| ProtocolError::ConnectionFailed(format!("{endpoint}: {e}")))?;
        stream.set_nodelay(true)?;

        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| endpoint.address().to_string());
        debug!(%remote, "tcp connected");
        Ok(spawn_stream(stream, remote, self.capacity))
    }
}
