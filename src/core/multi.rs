//! Multi-message containers.
//!
//! A `Multi` message carries a protobuf body `{size_unzipped, message_body}`.
//! The body is a sequence of length-prefixed messages:
//!
//! ```text
//! [len u32 LE][message; len][len u32 LE][message; len]...
//! ```
//!
//! and may be wrapped in one of the containers from
//! [`utils::compression`](crate::utils::compression). Nested multis are
//! flattened depth-first so the caller sees sub-messages in wire order.

use bytes::{Buf, Bytes};
use tracing::debug;

use crate::core::emsg::MsgType;
use crate::core::envelope::Envelope;
use crate::core::proto::MultiBody;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::compression::{self, CompressionKind};

/// Nesting bound for multis inside multis.
const MAX_DEPTH: usize = 8;

/// Expand a multi envelope into its sub-messages, in order.
pub fn unpack(envelope: &Envelope) -> Result<Vec<Envelope>> {
    let mut out = Vec::new();
    unpack_into(envelope, 0, &mut out)?;
    Ok(out)
}

fn unpack_into(envelope: &Envelope, depth: usize, out: &mut Vec<Envelope>) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::DecodeError("multi nesting too deep".into()));
    }
    if !envelope.is_proto() {
        return Err(ProtocolError::DecodeError(constants::ERR_NON_PROTO_MULTI.into()));
    }

    let body: MultiBody = envelope.decode_body()?;
    let raw = body.message_body.unwrap_or_default();
    let size_unzipped = body.size_unzipped.unwrap_or(0) as usize;

    // Only a declared unzipped size marks the body as compressed. A plain
    // body can start with bytes that look like a compression magic.
    let data = if size_unzipped == 0 {
        Bytes::from(raw)
    } else {
        let kind = CompressionKind::detect(&raw).ok_or_else(|| {
            ProtocolError::DecompressionFailure(constants::ERR_UNKNOWN_COMPRESSION.into())
        })?;
        let inflated = compression::decompress(&raw, kind)?;
        if inflated.len() != size_unzipped {
            return Err(ProtocolError::DecompressionFailure(format!(
                "multi declared {size_unzipped} bytes, inflated to {}",
                inflated.len()
            )));
        }
        Bytes::from(inflated)
    };

    let mut cursor = data.clone();
    while cursor.has_remaining() {
        if cursor.remaining() < 4 {
            return Err(ProtocolError::Truncated {
                needed: 4,
                available: cursor.remaining(),
            });
        }
        let len = cursor.get_u32_le() as usize;
        if cursor.remaining() < len {
            return Err(ProtocolError::Truncated {
                needed: len,
                available: cursor.remaining(),
            });
        }
        let sub = Envelope::decode(cursor.split_to(len))?;
        debug!(msg_type = %sub.msg_type(), len, depth, "unpacked sub-message");
        if sub.msg_type() == MsgType::MULTI {
            unpack_into(&sub, depth + 1, out)?;
        } else {
            out.push(sub);
        }
    }
    Ok(())
}

/// Build a multi envelope from `messages`, optionally compressed.
pub fn pack(messages: &[Envelope], compression: Option<CompressionKind>) -> Result<Envelope> {
    let mut plain = Vec::new();
    for message in messages {
        let encoded = message.encode();
        plain.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        plain.extend_from_slice(&encoded);
    }

    let body = match compression {
        Some(kind) => MultiBody {
            size_unzipped: Some(plain.len() as u32),
            message_body: Some(compression::compress(&plain, kind)?),
        },
        None => MultiBody {
            size_unzipped: None,
            message_body: Some(plain),
        },
    };
    Ok(Envelope::proto(MsgType::MULTI, &body))
}
