//! # Transport Layer
//!
//! Opens a connection to one server and exposes it as a [`FramedChannel`]:
//! whole frames in, whole frames out, plus a notice when the link drops.
//!
//! ## Transports
//! - **TCP**: length-prefixed frames with the `VT01` magic
//! - **WebSocket**: one binary message per frame over `wss://host/cmsocket/`
//! - **UDP**: datagrams with a small reliability layer (sequencing, acks, resends)
//!
//! Each open channel is driven by its own task. Dropping the channel or
//! calling [`FramedChannel::close`] shuts that task down.

pub mod stream;
pub mod tcp;
pub mod udp;
pub mod websocket;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::discovery::Endpoint;
use crate::error::{ProtocolError, Result};

/// Wire transport of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
    #[serde(rename = "websocket")]
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::WebSocket => write!(f, "websocket"),
        }
    }
}

/// Why a channel stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local side closed the channel.
    UserInitiated,
    /// The server closed the connection.
    RemoteClosed,
    /// Nothing was heard from the server for too long.
    Timeout,
    Error(String),
}

impl DisconnectReason {
    pub fn is_user_initiated(&self) -> bool {
        matches!(self, DisconnectReason::UserInitiated)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::UserInitiated => write!(f, "closed locally"),
            DisconnectReason::RemoteClosed => write!(f, "closed by server"),
            DisconnectReason::Timeout => write!(f, "timed out"),
            DisconnectReason::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// An open connection carrying whole frames.
#[derive(Debug)]
pub struct FramedChannel {
    remote: String,
    outgoing: mpsc::Sender<Bytes>,
    incoming: mpsc::Receiver<Bytes>,
    closed: watch::Receiver<Option<DisconnectReason>>,
    shutdown: CancellationToken,
}

/// The driver-task half of a [`FramedChannel`].
#[derive(Debug)]
pub struct ChannelDriver {
    pub outgoing: mpsc::Receiver<Bytes>,
    pub incoming: mpsc::Sender<Bytes>,
    pub closed: watch::Sender<Option<DisconnectReason>>,
    pub shutdown: CancellationToken,
}

impl ChannelDriver {
    /// Publish the final reason. Called once when the driver exits.
    pub fn finish(&self, reason: DisconnectReason) {
        let _ = self.closed.send(Some(reason));
    }
}

/// Create a channel and the driver half a transport task services.
pub fn channel_pair(remote: impl Into<String>, capacity: usize) -> (FramedChannel, ChannelDriver) {
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let (closed_tx, closed_rx) = watch::channel(None);
    let shutdown = CancellationToken::new();

    let channel = FramedChannel {
        remote: remote.into(),
        outgoing: out_tx,
        incoming: in_rx,
        closed: closed_rx,
        shutdown: shutdown.clone(),
    };
    let driver = ChannelDriver {
        outgoing: out_rx,
        incoming: in_tx,
        closed: closed_tx,
        shutdown,
    };
    (channel, driver)
}

impl FramedChannel {
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Queue one frame for sending.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Next received frame, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.incoming.recv().await
    }

    /// Reason the channel stopped, if it has.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.closed.borrow().clone()
    }

    /// Wait until the driver reports why the channel stopped.
    pub async fn closed(&mut self) -> DisconnectReason {
        loop {
            if let Some(reason) = self.closed.borrow_and_update().clone() {
                return reason;
            }
            if self.closed.changed().await.is_err() {
                return self
                    .closed
                    .borrow()
                    .clone()
                    .unwrap_or(DisconnectReason::RemoteClosed);
            }
        }
    }

    /// Ask the driver to shut the connection down.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for FramedChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Something that can open a channel to an endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, endpoint: &Endpoint) -> Result<FramedChannel>;
}

/// Opens channels with the transport each endpoint names.
#[derive(Debug)]
pub struct Connector {
    tcp: tcp::TcpTransport,
    udp: udp::UdpTransport,
    websocket: websocket::WebSocketTransport,
}

impl Connector {
    pub fn new(config: &TransportConfig, connect_timeout: Duration) -> Self {
        Self {
            tcp: tcp::TcpTransport::new(connect_timeout, config.channel_capacity),
            udp: udp::UdpTransport::new(connect_timeout, config.channel_capacity),
            websocket: websocket::WebSocketTransport::new(connect_timeout, config.channel_capacity),
        }
    }
}

#[async_trait]
impl Transport for Connector {
    async fn open(&self, endpoint: &Endpoint) -> Result<FramedChannel> {
        match endpoint.kind() {
            TransportKind::Tcp => self.tcp.open(endpoint).await,
            TransportKind::Udp => self.udp.open(endpoint).await,
            TransportKind::WebSocket => self.websocket.open(endpoint).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_pair_roundtrip_and_close() {
        let (mut channel, mut driver) = channel_pair("test", 4);
        channel.send(Bytes::from_static(b"out")).await.unwrap();
        assert_eq!(driver.outgoing.recv().await.unwrap(), Bytes::from_static(b"out"));

        driver.incoming.send(Bytes::from_static(b"in")).await.unwrap();
        assert_eq!(channel.recv().await.unwrap(), Bytes::from_static(b"in"));

        channel.close();
        assert!(driver.shutdown.is_cancelled());
        driver.finish(DisconnectReason::UserInitiated);
        assert_eq!(channel.closed().await, DisconnectReason::UserInitiated);
    }

    #[test]
    fn test_kind_serde_names() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            kind: TransportKind,
        }
        let parsed: Wrapper = toml::from_str("kind = \"websocket\"").unwrap();
        assert_eq!(parsed.kind, TransportKind::WebSocket);
        let text = toml::to_string(&Wrapper { kind: TransportKind::Udp }).unwrap();
        assert!(text.contains("\"udp\""));
    }
}
