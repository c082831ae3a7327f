//! # Message Envelope
//!
//! A parsed message: header, body bytes and trailing payload. Envelopes are
//! immutable once parsed; outgoing messages are built with [`Envelope::new`] or
//! [`Envelope::proto`] and serialized with [`Envelope::encode`].
//!
//! Body decoding is deferred to the
//! [`SchemaRegistry`](crate::core::registry::SchemaRegistry). Directly after
//! [`Envelope::decode`] every byte following the header is body; fixed-layout
//! messages move the bytes after their struct into the payload with
//! [`Envelope::split_payload`].

use bytes::{Bytes, BytesMut};
use prost::Message;

use crate::core::emsg::{MsgType, WireTag};
use crate::core::header::Header;
use crate::core::proto::GcEnvelope;
use crate::error::{ProtocolError, Result};
use crate::protocol::jobs::JobId;

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    header: Header,
    body: Bytes,
    payload: Bytes,
}

impl Envelope {
    pub fn new(header: Header, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
            payload: Bytes::new(),
        }
    }

    /// Build a protobuf message of the given type.
    pub fn proto<M: Message>(msg_type: MsgType, body: &M) -> Self {
        Self::new(
            Header::for_outgoing(WireTag::new(msg_type, true)),
            body.encode_to_vec(),
        )
    }

    /// Attach trailing raw bytes after the body.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn msg_type(&self) -> MsgType {
        self.header.msg_type()
    }

    pub fn is_proto(&self) -> bool {
        self.header.is_proto()
    }

    pub fn tag(&self) -> WireTag {
        self.header.tag()
    }

    pub fn target_job(&self) -> JobId {
        self.header.target_job()
    }

    pub fn source_job(&self) -> JobId {
        self.header.source_job()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Decode the body as a known protobuf message.
    pub fn decode_body<M: Message + Default>(&self) -> Result<M> {
        Ok(M::decode(self.body.as_ref())?)
    }

    /// Treat the first `body_len` bytes as the fixed-layout body and the rest as payload.
    pub fn split_payload(mut self, body_len: usize) -> Result<Self> {
        if body_len > self.body.len() {
            return Err(ProtocolError::Truncated {
                needed: body_len,
                available: self.body.len(),
            });
        }
        let rest = self.body.split_off(body_len);
        let mut payload = BytesMut::with_capacity(rest.len() + self.payload.len());
        payload.extend_from_slice(&rest);
        payload.extend_from_slice(&self.payload);
        self.payload = payload.freeze();
        Ok(self)
    }

    /// Build a reply addressed to this message's source job.
    pub fn reply_to(&self, mut reply: Envelope) -> Envelope {
        reply.header.set_target_job(self.source_job());
        reply
    }

    pub fn encoded_len(&self) -> usize {
        self.header.encoded_len() + self.body.len() + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.body);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a top-level message.
    pub fn decode(data: Bytes) -> Result<Self> {
        let mut cursor = data.as_ref();
        let header = Header::decode(&mut cursor)?;
        let consumed = data.len() - cursor.len();
        Ok(Self {
            header,
            body: data.slice(consumed..),
            payload: Bytes::new(),
        })
    }

    /// Parse a message tunnelled to a sub-application. `raw_type` comes from
    /// the wrapping envelope.
    pub fn decode_tunnel(raw_type: u32, data: Bytes) -> Result<Self> {
        let mut cursor = data.as_ref();
        let header = Header::decode_tunnel(raw_type, &mut cursor)?;
        let consumed = data.len() - cursor.len();
        Ok(Self {
            header,
            body: data.slice(consumed..),
            payload: Bytes::new(),
        })
    }

    /// Wrap a tunnel message into a `ClientToGC` envelope for `appid`.
    pub fn wrap_tunnel(&self, appid: u32) -> Envelope {
        let wrapper = GcEnvelope {
            appid: Some(appid),
            msgtype: Some(self.tag().to_raw()),
            payload: Some(self.encode().to_vec()),
            ..Default::default()
        };
        Envelope::proto(MsgType::CLIENT_TO_GC, &wrapper)
    }

    /// Unwrap a `ClientFromGC` envelope into (appid, inner message).
    pub fn unwrap_tunnel(&self) -> Result<(u32, Envelope)> {
        if self.msg_type() != MsgType::CLIENT_FROM_GC && self.msg_type() != MsgType::CLIENT_TO_GC {
            return Err(ProtocolError::UnknownMessageType(self.msg_type().0));
        }
        let wrapper: GcEnvelope = self.decode_body()?;
        let raw_type = wrapper
            .msgtype
            .ok_or(ProtocolError::InvalidHeader("tunnel envelope without message type"))?;
        let inner = Envelope::decode_tunnel(raw_type, Bytes::from(wrapper.payload.unwrap_or_default()))?;
        Ok((wrapper.appid.unwrap_or_default(), inner))
    }
}
