//! # Session Protocol
//!
//! Connection-level state machines layered on top of the message codec.
//!
//! ## Components
//! - **Handshake**: Channel encryption setup (RSA-wrapped session key)
//! - **Jobs**: Job id allocation and request/reply correlation
//! - **Heartbeat**: Keepalive schedule while logged on
//! - **Session**: Identity and cipher of the live connection
//! - **Dispatcher**: Routing of decoded messages to handlers

pub mod dispatcher;
pub mod handshake;
pub mod heartbeat;
pub mod jobs;
pub mod session;
