//! # Client Service
//!
//! The orchestrator that turns the protocol pieces into one logical client.
//!
//! ## Components
//! - **Client**: actor task owning transport, handshake, session, jobs and heartbeat
//! - **Logon**: logon request building and the injected machine-id provider
//!
//! ## Lifecycle
//! ```text
//! connect -> discover -> open transport -> channel handshake -> logon -> heartbeat
//!    ^                                                                       |
//!    +---------------- backoff <---- unexpected disconnect <-----------------+
//! ```

pub mod client;
pub mod logon;

pub use client::{Client, ClientEvent, ClientHandle, ClientStatus, EventStream};
pub use logon::{LogOnDetails, MachineIdProvider, StaticMachineId};
