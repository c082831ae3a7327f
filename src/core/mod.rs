//! # Core Protocol Components
//!
//! Message identification, header variants, envelopes and stream framing.
//!
//! ## Components
//! - **EMsg**: message type ids and the (type, protobuf flag) wire tag
//! - **Header**: the five header layouts behind one tagged union
//! - **Envelope**: header, body and trailing payload of one message
//! - **Registry**: body decoders keyed by message type or service method name
//! - **Multi**: length-prefixed message bundles with optional compression
//! - **Codec**: Tokio codec for TCP framing
//!
//! ## Wire Format
//! ```text
//! TCP frame: [Length(4)] ["VT01"(4)] [Envelope(N)]
//! Envelope:  [Header] [Body] [Payload]
//! ```
//!
//! ## Security
//! - Maximum frame size: 16MB (prevents memory exhaustion)
//! - Length validation before allocation
//! - Decompression output bounded by the same limit

pub mod codec;
pub mod emsg;
pub mod envelope;
pub mod header;
pub mod multi;
pub mod proto;
pub mod registry;
