//! Message type identifiers and the wire tag.
//!
//! The first four bytes of every message are a little-endian `u32`. The low 31
//! bits are the message type id, the high bit flags a protobuf-encoded header and
//! body. The pair (type id, protobuf flag) is the message's wire tag.

use std::fmt;

/// High bit of the raw type integer marking protobuf messages.
pub const PROTO_MASK: u32 = 0x8000_0000;

/// A message type id with the protobuf flag stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MsgType(pub u32);

impl MsgType {
    pub const INVALID: MsgType = MsgType(0);
    pub const MULTI: MsgType = MsgType(1);
    pub const SERVICE_METHOD: MsgType = MsgType(146);
    pub const SERVICE_METHOD_RESPONSE: MsgType = MsgType(147);
    pub const SERVICE_METHOD_CALL_FROM_CLIENT: MsgType = MsgType(151);
    pub const DEST_JOB_FAILED: MsgType = MsgType(113);
    pub const JOB_HEARTBEAT: MsgType = MsgType(123);
    pub const CLIENT_HEARTBEAT: MsgType = MsgType(703);
    pub const CLIENT_LOG_OFF: MsgType = MsgType(706);
    pub const CLIENT_LOG_ON_RESPONSE: MsgType = MsgType(751);
    pub const CLIENT_LOGGED_OFF: MsgType = MsgType(757);
    pub const CLIENT_CM_LIST: MsgType = MsgType(783);
    pub const CHANNEL_ENCRYPT_REQUEST: MsgType = MsgType(1303);
    pub const CHANNEL_ENCRYPT_RESPONSE: MsgType = MsgType(1304);
    pub const CHANNEL_ENCRYPT_RESULT: MsgType = MsgType(1305);
    pub const CLIENT_TO_GC: MsgType = MsgType(5452);
    pub const CLIENT_FROM_GC: MsgType = MsgType(5453);
    pub const CLIENT_LOGON: MsgType = MsgType(5514);
    pub const SERVICE_METHOD_CALL_FROM_CLIENT_NON_AUTHED: MsgType = MsgType(9804);
    pub const CLIENT_HELLO: MsgType = MsgType(9805);

    /// Handshake messages always travel with the basic header, unencrypted.
    pub fn is_channel_encrypt(self) -> bool {
        matches!(
            self,
            MsgType::CHANNEL_ENCRYPT_REQUEST
                | MsgType::CHANNEL_ENCRYPT_RESPONSE
                | MsgType::CHANNEL_ENCRYPT_RESULT
        )
    }

    /// Messages whose protobuf header names a service method.
    pub fn is_service_method(self) -> bool {
        matches!(
            self,
            MsgType::SERVICE_METHOD
                | MsgType::SERVICE_METHOD_RESPONSE
                | MsgType::SERVICE_METHOD_CALL_FROM_CLIENT
                | MsgType::SERVICE_METHOD_CALL_FROM_CLIENT_NON_AUTHED
        )
    }

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            MsgType::INVALID => "Invalid",
            MsgType::MULTI => "Multi",
            MsgType::SERVICE_METHOD => "ServiceMethod",
            MsgType::SERVICE_METHOD_RESPONSE => "ServiceMethodResponse",
            MsgType::SERVICE_METHOD_CALL_FROM_CLIENT => "ServiceMethodCallFromClient",
            MsgType::DEST_JOB_FAILED => "DestJobFailed",
            MsgType::JOB_HEARTBEAT => "JobHeartbeat",
            MsgType::CLIENT_HEARTBEAT => "ClientHeartBeat",
            MsgType::CLIENT_LOG_OFF => "ClientLogOff",
            MsgType::CLIENT_LOG_ON_RESPONSE => "ClientLogOnResponse",
            MsgType::CLIENT_LOGGED_OFF => "ClientLoggedOff",
            MsgType::CLIENT_CM_LIST => "ClientCMList",
            MsgType::CHANNEL_ENCRYPT_REQUEST => "ChannelEncryptRequest",
            MsgType::CHANNEL_ENCRYPT_RESPONSE => "ChannelEncryptResponse",
            MsgType::CHANNEL_ENCRYPT_RESULT => "ChannelEncryptResult",
            MsgType::CLIENT_TO_GC => "ClientToGC",
            MsgType::CLIENT_FROM_GC => "ClientFromGC",
            MsgType::CLIENT_LOGON => "ClientLogon",
            MsgType::SERVICE_METHOD_CALL_FROM_CLIENT_NON_AUTHED => {
                "ServiceMethodCallFromClientNonAuthed"
            }
            MsgType::CLIENT_HELLO => "ClientHello",
            _ => return None,
        })
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

/// The (type id, protobuf flag) pair identifying a message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WireTag {
    pub msg_type: MsgType,
    pub is_proto: bool,
}

impl WireTag {
    pub fn new(msg_type: MsgType, is_proto: bool) -> Self {
        Self { msg_type, is_proto }
    }

    /// Split a raw type integer into its tag.
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self {
            msg_type: MsgType(raw & !PROTO_MASK),
            is_proto: raw & PROTO_MASK != 0,
        }
    }

    #[inline]
    pub fn to_raw(self) -> u32 {
        if self.is_proto {
            self.msg_type.0 | PROTO_MASK
        } else {
            self.msg_type.0
        }
    }

    /// Read the tag from the first four bytes without consuming them.
    pub fn peek(data: &[u8]) -> Option<Self> {
        let raw: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(Self::from_raw(u32::from_le_bytes(raw)))
    }
}

/// Realm a client connects to. Each universe has its own channel public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Universe {
    Invalid,
    Public,
    Beta,
    Internal,
    Dev,
}

impl Universe {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Universe::Public,
            2 => Universe::Beta,
            3 => Universe::Internal,
            4 => Universe::Dev,
            _ => Universe::Invalid,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Universe::Invalid => 0,
            Universe::Public => 1,
            Universe::Beta => 2,
            Universe::Internal => 3,
            Universe::Dev => 4,
        }
    }
}

/// Result codes carried by handshake, logon and logoff messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EResult(pub i32);

impl EResult {
    pub const INVALID: EResult = EResult(0);
    pub const OK: EResult = EResult(1);
    pub const FAIL: EResult = EResult(2);
    pub const NO_CONNECTION: EResult = EResult(3);
    pub const INVALID_PASSWORD: EResult = EResult(5);
    pub const SERVICE_UNAVAILABLE: EResult = EResult(20);
    pub const TRY_ANOTHER_CM: EResult = EResult(48);

    pub fn is_ok(self) -> bool {
        self == EResult::OK
    }
}

impl fmt::Display for EResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EResult({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_flag_is_high_bit() {
        let tag = WireTag::from_raw(0x8000_02EF);
        assert!(tag.is_proto);
        assert_eq!(tag.msg_type, MsgType::CLIENT_LOG_ON_RESPONSE);
        assert_eq!(tag.to_raw(), 0x8000_02EF);

        let legacy = WireTag::from_raw(1303);
        assert!(!legacy.is_proto);
        assert!(legacy.msg_type.is_channel_encrypt());
    }

    #[test]
    fn test_peek_does_not_need_whole_message() {
        assert_eq!(WireTag::peek(&[1, 0]), None);
        let tag = WireTag::peek(&[0x01, 0x00, 0x00, 0x80, 0xFF]).unwrap();
        assert_eq!(tag, WireTag::new(MsgType::MULTI, true));
    }

    #[test]
    fn test_universe_roundtrip() {
        for u in [Universe::Public, Universe::Beta, Universe::Internal, Universe::Dev] {
            assert_eq!(Universe::from_u32(u.as_u32()), u);
        }
        assert_eq!(Universe::from_u32(99), Universe::Invalid);
    }
}
