//! Stream framing for TCP connections.
//!
//! ```text
//! [Length u32 LE] [Magic "VT01" u32 LE] [Payload; Length]
//! ```
//!
//! The length covers the payload only. Frames larger than
//! [`MAX_FRAME_SIZE`] are rejected before any allocation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{constants, ProtocolError, Result};

/// "VT01" read as a little-endian u32.
pub const TCP_MAGIC: u32 = 0x3130_5456;

pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let magic = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);

        if magic != TCP_MAGIC {
            return Err(ProtocolError::InvalidHeader(constants::ERR_BAD_TCP_MAGIC));
        }
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::OversizedPacket(len));
        }

        let total = FRAME_HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::OversizedPacket(item.len()));
        }
        dst.reserve(FRAME_HEADER_LEN + item.len());
        dst.put_u32_le(item.len() as u32);
        dst.put_u32_le(TCP_MAGIC);
        dst.put_slice(&item);
        Ok(())
    }
}
