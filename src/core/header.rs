//! Message header variants.
//!
//! All headers are little-endian. Layouts:
//!
//! ```text
//! Basic          [type u32][target_job u64][source_job u64]                      20 bytes
//! Extended       [type u32][size u8][version u16][target u64][source u64]
//!                [canary u8][account_id u64][session_id i32]                     36 bytes
//! ProtoBuf       [type|0x80000000 u32][len u32][ProtoHeader; len]
//! Tunnel         [version u16][target u64][source u64]                           18 bytes
//! TunnelProtoBuf [type|0x80000000 u32][len u32][GcProtoHeader; len]
//! ```
//!
//! The tunnel variants live inside a `ClientToGC`/`ClientFromGC` envelope. The
//! plain tunnel header does not carry its type on the wire; the wrapping
//! envelope supplies it.

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;

use crate::core::emsg::{MsgType, WireTag};
use crate::core::proto::{GcProtoHeader, ProtoHeader, NO_JOB};
use crate::error::{ProtocolError, Result};
use crate::protocol::jobs::JobId;

pub const BASIC_HEADER_LEN: usize = 20;
pub const EXTENDED_HEADER_LEN: usize = 36;
pub const TUNNEL_HEADER_LEN: usize = 18;

const EXTENDED_HEADER_VERSION: u16 = 2;
const EXTENDED_HEADER_CANARY: u8 = 239;
const TUNNEL_HEADER_VERSION: u16 = 1;

/// Upper bound on an embedded protobuf header. Real headers are a few dozen bytes.
const MAX_PROTO_HEADER_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicHeader {
    pub msg_type: MsgType,
    pub target_job: JobId,
    pub source_job: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub msg_type: MsgType,
    pub header_size: u8,
    pub header_version: u16,
    pub target_job: JobId,
    pub source_job: JobId,
    pub canary: u8,
    pub account_id: u64,
    pub session_id: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtoBufHeader {
    pub msg_type: MsgType,
    pub proto: ProtoHeader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHeader {
    pub msg_type: MsgType,
    pub header_version: u16,
    pub target_job: JobId,
    pub source_job: JobId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TunnelProtoBufHeader {
    pub msg_type: MsgType,
    pub proto: GcProtoHeader,
}

/// One header of any variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Header {
    Basic(BasicHeader),
    Extended(ExtendedHeader),
    ProtoBuf(ProtoBufHeader),
    Tunnel(TunnelHeader),
    TunnelProtoBuf(TunnelProtoBufHeader),
}

impl BasicHeader {
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            msg_type,
            target_job: JobId::INVALID,
            source_job: JobId::INVALID,
        }
    }
}

impl ExtendedHeader {
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            msg_type,
            header_size: EXTENDED_HEADER_LEN as u8,
            header_version: EXTENDED_HEADER_VERSION,
            target_job: JobId::INVALID,
            source_job: JobId::INVALID,
            canary: EXTENDED_HEADER_CANARY,
            account_id: 0,
            session_id: 0,
        }
    }
}

impl ProtoBufHeader {
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            msg_type,
            proto: ProtoHeader::default(),
        }
    }
}

impl TunnelHeader {
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            msg_type,
            header_version: TUNNEL_HEADER_VERSION,
            target_job: JobId::INVALID,
            source_job: JobId::INVALID,
        }
    }
}

impl TunnelProtoBufHeader {
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            msg_type,
            proto: GcProtoHeader::default(),
        }
    }
}

#[inline]
fn ensure(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Split off a length-prefixed embedded protobuf header.
fn take_proto_slice<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    ensure(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    if len > MAX_PROTO_HEADER_LEN {
        return Err(ProtocolError::InvalidHeader("protobuf header length out of range"));
    }
    ensure(buf, len)?;
    let slice: &'a [u8] = buf;
    let (proto, rest) = slice.split_at(len);
    *buf = rest;
    Ok(proto)
}

impl Header {
    /// Pick the header variant a newly built outgoing message should carry.
    pub fn for_outgoing(tag: WireTag) -> Self {
        if tag.msg_type.is_channel_encrypt() {
            Header::Basic(BasicHeader::new(tag.msg_type))
        } else if tag.is_proto {
            Header::ProtoBuf(ProtoBufHeader::new(tag.msg_type))
        } else {
            Header::Extended(ExtendedHeader::new(tag.msg_type))
        }
    }

    pub fn msg_type(&self) -> MsgType {
        match self {
            Header::Basic(h) => h.msg_type,
            Header::Extended(h) => h.msg_type,
            Header::ProtoBuf(h) => h.msg_type,
            Header::Tunnel(h) => h.msg_type,
            Header::TunnelProtoBuf(h) => h.msg_type,
        }
    }

    pub fn is_proto(&self) -> bool {
        matches!(self, Header::ProtoBuf(_) | Header::TunnelProtoBuf(_))
    }

    pub fn tag(&self) -> WireTag {
        WireTag::new(self.msg_type(), self.is_proto())
    }

    pub fn target_job(&self) -> JobId {
        match self {
            Header::Basic(h) => h.target_job,
            Header::Extended(h) => h.target_job,
            Header::ProtoBuf(h) => JobId(h.proto.jobid_target.unwrap_or(NO_JOB)),
            Header::Tunnel(h) => h.target_job,
            Header::TunnelProtoBuf(h) => JobId(h.proto.job_id_target.unwrap_or(NO_JOB)),
        }
    }

    pub fn source_job(&self) -> JobId {
        match self {
            Header::Basic(h) => h.source_job,
            Header::Extended(h) => h.source_job,
            Header::ProtoBuf(h) => JobId(h.proto.jobid_source.unwrap_or(NO_JOB)),
            Header::Tunnel(h) => h.source_job,
            Header::TunnelProtoBuf(h) => JobId(h.proto.job_id_source.unwrap_or(NO_JOB)),
        }
    }

    pub fn set_target_job(&mut self, job: JobId) {
        match self {
            Header::Basic(h) => h.target_job = job,
            Header::Extended(h) => h.target_job = job,
            Header::ProtoBuf(h) => h.proto.jobid_target = Some(job.0),
            Header::Tunnel(h) => h.target_job = job,
            Header::TunnelProtoBuf(h) => h.proto.job_id_target = Some(job.0),
        }
    }

    pub fn set_source_job(&mut self, job: JobId) {
        match self {
            Header::Basic(h) => h.source_job = job,
            Header::Extended(h) => h.source_job = job,
            Header::ProtoBuf(h) => h.proto.jobid_source = Some(job.0),
            Header::Tunnel(h) => h.source_job = job,
            Header::TunnelProtoBuf(h) => h.proto.job_id_source = Some(job.0),
        }
    }

    /// Account id, where the variant carries one.
    pub fn account_id(&self) -> Option<u64> {
        match self {
            Header::Extended(h) => Some(h.account_id),
            Header::ProtoBuf(h) => h.proto.steamid,
            Header::TunnelProtoBuf(h) => h.proto.client_steam_id,
            _ => None,
        }
    }

    /// Session id, where the variant carries one.
    pub fn session_id(&self) -> Option<i32> {
        match self {
            Header::Extended(h) => Some(h.session_id),
            Header::ProtoBuf(h) => h.proto.client_sessionid,
            Header::TunnelProtoBuf(h) => h.proto.client_session_id,
            _ => None,
        }
    }

    /// Stamp session identity. Variants without identity fields are left alone.
    pub fn set_identity(&mut self, account_id: u64, session_id: i32) {
        match self {
            Header::Extended(h) => {
                h.account_id = account_id;
                h.session_id = session_id;
            }
            Header::ProtoBuf(h) => {
                h.proto.steamid = Some(account_id);
                h.proto.client_sessionid = Some(session_id);
            }
            _ => {}
        }
    }

    /// Service method name (`Interface.Method#Version`) for RPC-style calls.
    pub fn target_job_name(&self) -> Option<&str> {
        match self {
            Header::ProtoBuf(h) => h.proto.target_job_name.as_deref(),
            Header::TunnelProtoBuf(h) => h.proto.target_job_name.as_deref(),
            _ => None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Header::Basic(_) => BASIC_HEADER_LEN,
            Header::Extended(_) => EXTENDED_HEADER_LEN,
            Header::ProtoBuf(h) => 8 + h.proto.encoded_len(),
            Header::Tunnel(_) => TUNNEL_HEADER_LEN,
            Header::TunnelProtoBuf(h) => 8 + h.proto.encoded_len(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        match self {
            Header::Basic(h) => {
                buf.put_u32_le(h.msg_type.0);
                buf.put_u64_le(h.target_job.0);
                buf.put_u64_le(h.source_job.0);
            }
            Header::Extended(h) => {
                buf.put_u32_le(h.msg_type.0);
                buf.put_u8(h.header_size);
                buf.put_u16_le(h.header_version);
                buf.put_u64_le(h.target_job.0);
                buf.put_u64_le(h.source_job.0);
                buf.put_u8(h.canary);
                buf.put_u64_le(h.account_id);
                buf.put_i32_le(h.session_id);
            }
            Header::ProtoBuf(h) => {
                buf.put_u32_le(WireTag::new(h.msg_type, true).to_raw());
                buf.put_u32_le(h.proto.encoded_len() as u32);
                buf.put_slice(&h.proto.encode_to_vec());
            }
            Header::Tunnel(h) => {
                buf.put_u16_le(h.header_version);
                buf.put_u64_le(h.target_job.0);
                buf.put_u64_le(h.source_job.0);
            }
            Header::TunnelProtoBuf(h) => {
                buf.put_u32_le(WireTag::new(h.msg_type, true).to_raw());
                buf.put_u32_le(h.proto.encoded_len() as u32);
                buf.put_slice(&h.proto.encode_to_vec());
            }
        }
    }

    /// Decode a top-level header, advancing `buf` past it.
    ///
    /// The variant is chosen from the leading raw type integer: handshake types
    /// use the basic header, protobuf-flagged types the protobuf header and
    /// everything else the extended header.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let tag = WireTag::peek(buf).ok_or(ProtocolError::Truncated {
            needed: 4,
            available: buf.len(),
        })?;

        if tag.msg_type.is_channel_encrypt() {
            ensure(buf, BASIC_HEADER_LEN)?;
            buf.advance(4);
            Ok(Header::Basic(BasicHeader {
                msg_type: tag.msg_type,
                target_job: JobId(buf.get_u64_le()),
                source_job: JobId(buf.get_u64_le()),
            }))
        } else if tag.is_proto {
            buf.advance(4);
            let proto = ProtoHeader::decode(take_proto_slice(buf)?)?;
            Ok(Header::ProtoBuf(ProtoBufHeader {
                msg_type: tag.msg_type,
                proto,
            }))
        } else {
            ensure(buf, EXTENDED_HEADER_LEN)?;
            buf.advance(4);
            Ok(Header::Extended(ExtendedHeader {
                msg_type: tag.msg_type,
                header_size: buf.get_u8(),
                header_version: buf.get_u16_le(),
                target_job: JobId(buf.get_u64_le()),
                source_job: JobId(buf.get_u64_le()),
                canary: buf.get_u8(),
                account_id: buf.get_u64_le(),
                session_id: buf.get_i32_le(),
            }))
        }
    }

    /// Decode a tunnelled header. `raw_type` comes from the wrapping envelope.
    pub fn decode_tunnel(raw_type: u32, buf: &mut &[u8]) -> Result<Self> {
        let tag = WireTag::from_raw(raw_type);
        if tag.is_proto {
            ensure(buf, 4)?;
            buf.advance(4);
            let proto = GcProtoHeader::decode(take_proto_slice(buf)?)?;
            Ok(Header::TunnelProtoBuf(TunnelProtoBufHeader {
                msg_type: tag.msg_type,
                proto,
            }))
        } else {
            ensure(buf, TUNNEL_HEADER_LEN)?;
            Ok(Header::Tunnel(TunnelHeader {
                msg_type: tag.msg_type,
                header_version: buf.get_u16_le(),
                target_job: JobId(buf.get_u64_le()),
                source_job: JobId(buf.get_u64_le()),
            }))
        }
    }
}
