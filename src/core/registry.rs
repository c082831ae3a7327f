//! # Schema Registry
//!
//! Maps message types and service method names to body decoders.
//!
//! The registry is assembled once with [`RegistryBuilder`] and frozen into an
//! immutable [`SchemaRegistry`] that is cheap to clone and share. Decoders are
//! plain function pointers, so the table is fully known after `build()`.
//!
//! ```rust
//! use cm_protocol::core::emsg::MsgType;
//! use cm_protocol::core::proto::LogonResponse;
//! use cm_protocol::core::registry::{decode_message, RegistryBuilder};
//!
//! let registry = RegistryBuilder::new()
//!     .message(MsgType::CLIENT_LOG_ON_RESPONSE, decode_message::<LogonResponse>)
//!     .build();
//! assert!(registry.knows(MsgType::CLIENT_LOG_ON_RESPONSE));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::core::emsg::MsgType;
use crate::core::envelope::Envelope;
use crate::core::proto;
use crate::error::Result;

/// Decoder turning body bytes into a typed value.
pub type BodyDecoder = fn(&[u8]) -> Result<DecodedBody>;

/// A decoded message body with its concrete type erased.
pub struct DecodedBody {
    type_name: &'static str,
    value: Box<dyn Any + Send + Sync>,
}

impl DecodedBody {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Box::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn downcast<T: Any>(self) -> std::result::Result<T, Self> {
        let type_name = self.type_name;
        match self.value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Self { type_name, value }),
        }
    }
}

impl fmt::Debug for DecodedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedBody")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Result of looking a body up in the registry.
#[derive(Debug)]
pub enum Body {
    Decoded(DecodedBody),
    /// No decoder registered; the bytes are passed through untouched.
    Raw(Bytes),
}

impl Body {
    pub fn as_decoded<T: Any>(&self) -> Option<&T> {
        match self {
            Body::Decoded(body) => body.downcast_ref(),
            Body::Raw(_) => None,
        }
    }
}

/// Generic protobuf decoder suitable for registration.
pub fn decode_message<M>(data: &[u8]) -> Result<DecodedBody>
where
    M: prost::Message + Default + Send + Sync + 'static,
{
    Ok(DecodedBody::new(M::decode(data)?))
}

#[derive(Clone, Copy)]
struct MethodDecoders {
    request: BodyDecoder,
    response: BodyDecoder,
}

#[derive(Default)]
pub struct RegistryBuilder {
    messages: HashMap<MsgType, BodyDecoder>,
    methods: HashMap<String, MethodDecoders>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the schemas the engine itself consumes.
    pub fn with_engine_schemas() -> Self {
        Self::new()
            .message(MsgType::MULTI, decode_message::<proto::MultiBody>)
            .message(MsgType::CLIENT_LOG_ON_RESPONSE, decode_message::<proto::LogonResponse>)
            .message(MsgType::CLIENT_LOGGED_OFF, decode_message::<proto::LoggedOff>)
            .message(MsgType::CLIENT_CM_LIST, decode_message::<proto::CmList>)
            .message(MsgType::CLIENT_HEARTBEAT, decode_message::<proto::HeartBeat>)
            .message(MsgType::CLIENT_FROM_GC, decode_message::<proto::GcEnvelope>)
    }

    /// Register a decoder for a message type. A later registration replaces an earlier one.
    pub fn message(mut self, msg_type: MsgType, decoder: BodyDecoder) -> Self {
        self.messages.insert(msg_type, decoder);
        self
    }

    /// Register request and response decoders for `Interface.Method#Version`.
    pub fn method(mut self, name: impl Into<String>, request: BodyDecoder, response: BodyDecoder) -> Self {
        self.methods
            .insert(name.into(), MethodDecoders { request, response });
        self
    }

    pub fn build(self) -> SchemaRegistry {
        SchemaRegistry {
            inner: Arc::new(self),
        }
    }
}

/// Immutable schema table shared between the codec and handlers.
#[derive(Clone)]
pub struct SchemaRegistry {
    inner: Arc<RegistryBuilder>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        RegistryBuilder::with_engine_schemas().build()
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("messages", &self.inner.messages.len())
            .field("methods", &self.inner.methods.len())
            .finish()
    }
}

impl SchemaRegistry {
    pub fn knows(&self, msg_type: MsgType) -> bool {
        self.inner.messages.contains_key(&msg_type)
    }

    pub fn knows_method(&self, name: &str) -> bool {
        self.inner.methods.contains_key(name)
    }

    /// Decode an envelope's body.
    ///
    /// Service method messages resolve by the method name in their header, all
    /// others by message type. Anything unregistered comes back as [`Body::Raw`].
    pub fn decode(&self, envelope: &Envelope) -> Result<Body> {
        let msg_type = envelope.msg_type();
        let decoder = if msg_type.is_service_method() {
            envelope
                .header()
                .target_job_name()
                .and_then(|name| self.inner.methods.get(name))
                .map(|pair| {
                    if msg_type == MsgType::SERVICE_METHOD_RESPONSE {
                        pair.response
                    } else {
                        pair.request
                    }
                })
        } else {
            self.inner.messages.get(&msg_type).copied()
        };

        match decoder {
            Some(decode) => decode(envelope.body()).map(Body::Decoded),
            None => Ok(Body::Raw(envelope.body().clone())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::header::Header;
    use crate::core::proto::{CmList, HeartBeat, LogonResponse};

    #[test]
    fn test_decodes_registered_type() {
        let registry = SchemaRegistry::default();
        let env = Envelope::proto(
            MsgType::CLIENT_LOG_ON_RESPONSE,
            &LogonResponse {
                eresult: Some(1),
                out_of_game_heartbeat_seconds: Some(30),
                ..Default::default()
            },
        );
        let body = registry.decode(&env).unwrap();
        let logon = body.as_decoded::<LogonResponse>().unwrap();
        assert_eq!(logon.out_of_game_heartbeat_seconds, Some(30));
        assert!(body.as_decoded::<CmList>().is_none());
    }

    #[test]
    fn test_unknown_type_is_raw() {
        let registry = RegistryBuilder::new().build();
        let env = Envelope::proto(MsgType(9999), &HeartBeat::default());
        assert!(matches!(registry.decode(&env).unwrap(), Body::Raw(_)));
    }

    #[test]
    fn test_method_name_selects_request_or_response() {
        fn request(_: &[u8]) -> Result<DecodedBody> {
            Ok(DecodedBody::new("request"))
        }
        fn response(_: &[u8]) -> Result<DecodedBody> {
            Ok(DecodedBody::new("response"))
        }
        let registry = RegistryBuilder::new()
            .method("Player.GetNickname#1", request, response)
            .build();

        let mut call = Envelope::proto(MsgType::SERVICE_METHOD_CALL_FROM_CLIENT, &HeartBeat::default());
        if let Header::ProtoBuf(h) = call.header_mut() {
            h.proto.target_job_name = Some("Player.GetNickname#1".into());
        }
        let body = registry.decode(&call).unwrap();
        assert_eq!(body.as_decoded::<&str>(), Some(&"request"));

        let mut resp = Envelope::proto(MsgType::SERVICE_METHOD_RESPONSE, &HeartBeat::default());
        if let Header::ProtoBuf(h) = resp.header_mut() {
            h.proto.target_job_name = Some("Player.GetNickname#1".into());
        }
        let body = registry.decode(&resp).unwrap();
        assert_eq!(body.as_decoded::<&str>(), Some(&"response"));
    }

    #[test]
    fn test_decoded_body_downcast_by_value() {
        let body = DecodedBody::new(CmList::default());
        assert!(body.type_name().ends_with("CmList"));
        let body = body.downcast::<LogonResponse>().unwrap_err();
        assert!(body.downcast::<CmList>().is_ok());
    }
}
