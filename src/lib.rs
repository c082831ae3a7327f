//! # cm-protocol
//!
//! Client protocol engine for Connection Manager networks.
//!
//! Finds the least loaded server, sets up an encrypted channel over TCP, UDP
//! or WebSocket, frames and unpacks messages across every header layout,
//! correlates request/reply jobs and keeps the session alive with
//! heartbeats and reconnects.
//!
//! ## Layers
//! - **core**: message tags, headers, envelopes, multis, schema registry, TCP framing
//! - **transport**: TCP, WebSocket and UDP channels
//! - **discovery**: server directory and load-based selection
//! - **protocol**: handshake, jobs, heartbeat, session, dispatch
//! - **service**: the [`Client`] tying it all together
//!
//! ## Example
//! ```no_run
//! use cm_protocol::config::NetworkConfig;
//! use cm_protocol::protocol::handshake::UniverseKeys;
//! use cm_protocol::service::{Client, ClientEvent};
//! use futures::StreamExt;
//!
//! # async fn run(keys: UniverseKeys) -> cm_protocol::error::Result<()> {
//! let config = NetworkConfig::from_file("cm-protocol.toml")?;
//! let (client, mut events) = Client::new(config, keys)?.start();
//! client.connect().await?;
//! while let Some(event) = events.next().await {
//!     if let ClientEvent::ChannelEncrypted = event {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use error::{ProtocolError, Result};
pub use service::{Client, ClientEvent, ClientHandle};
