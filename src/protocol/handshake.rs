//! Channel encryption handshake.
//!
//! The server opens every connection with a challenge. The client answers with
//! a fresh session key sealed under the universe's RSA public key, and the
//! server confirms with a result code:
//!
//! ```text
//! server                                    client
//!   | -- ChannelEncryptRequest{ver, universe} + challenge -->|
//!   | <- ChannelEncryptResponse{ver, key_size}               |
//!   |      + RSA-OAEP-SHA1(key || challenge) + crc32 + 0 ----|
//!   | -- ChannelEncryptResult{result} ---------------------->|
//! ```
//!
//! Handshake messages travel unencrypted with the basic header. After an OK
//! result the negotiated [`CipherContext`] protects everything else.
//!
//! State is per connection: a [`Handshake`] value is created for every
//! connection attempt and never shared.

use std::collections::HashMap;
use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use rand_core::OsRng;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::core::emsg::{EResult, MsgType, Universe};
use crate::core::envelope::Envelope;
use crate::core::header::{BasicHeader, Header};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{generate_session_key, CipherContext, SESSION_KEY_LEN};

/// Version of the handshake itself, distinct from the logon protocol version.
pub const HANDSHAKE_PROTOCOL_VERSION: u32 = 1;

/// Value of the response's key size field.
const KEY_SIZE_FIELD: u32 = 128;

const MIN_CHALLENGE_LEN: usize = 16;

/// Connection state as seen by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Disconnected,
    AwaitingEncryptRequest,
    AwaitingEncryptResult,
    Encrypted,
    LoggedOn,
}

impl HandshakeState {
    pub fn is_encrypted(self) -> bool {
        matches!(self, HandshakeState::Encrypted | HandshakeState::LoggedOn)
    }
}

/// RSA public keys the client trusts, one per universe.
#[derive(Clone, Default)]
pub struct UniverseKeys {
    keys: HashMap<Universe, RsaPublicKey>,
}

impl fmt::Debug for UniverseKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.keys.keys()).finish()
    }
}

impl UniverseKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, universe: Universe, key: RsaPublicKey) -> &mut Self {
        self.keys.insert(universe, key);
        self
    }

    /// Add a key in X.509 SubjectPublicKeyInfo DER form.
    pub fn insert_der(&mut self, universe: Universe, der: &[u8]) -> Result<&mut Self> {
        let key = RsaPublicKey::from_public_key_der(der).map_err(|e| {
            ProtocolError::ConfigError(format!("{}: {e}", constants::ERR_INVALID_PUBLIC_KEY))
        })?;
        Ok(self.insert(universe, key))
    }

    pub fn get(&self, universe: Universe) -> Option<&RsaPublicKey> {
        self.keys.get(&universe)
    }
}

/// `ChannelEncryptRequest` body plus its challenge payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptRequest {
    pub protocol_version: u32,
    pub universe: Universe,
    pub challenge: Vec<u8>,
}

impl EncryptRequest {
    const BODY_LEN: usize = 8;

    pub fn parse(envelope: &Envelope) -> Result<Self> {
        let mut body = envelope.body().as_ref();
        if body.len() < Self::BODY_LEN {
            return Err(ProtocolError::HandshakeError(format!(
                "encrypt request body is {} bytes",
                body.len()
            )));
        }
        let protocol_version = body.get_u32_le();
        let universe = Universe::from_u32(body.get_u32_le());
        let mut challenge = body.to_vec();
        challenge.extend_from_slice(envelope.payload());
        Ok(Self {
            protocol_version,
            universe,
            challenge,
        })
    }

    pub fn to_envelope(&self) -> Envelope {
        let mut body = BytesMut::with_capacity(Self::BODY_LEN);
        body.put_u32_le(self.protocol_version);
        body.put_u32_le(self.universe.as_u32());
        Envelope::new(
            Header::Basic(BasicHeader::new(MsgType::CHANNEL_ENCRYPT_REQUEST)),
            body.freeze(),
        )
        .with_payload(self.challenge.clone())
    }
}

/// `ChannelEncryptResult` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptResult {
    pub result: EResult,
}

impl EncryptResult {
    pub fn parse(envelope: &Envelope) -> Result<Self> {
        let mut body = envelope.body().as_ref();
        if body.len() < 4 {
            return Err(ProtocolError::HandshakeError(
                "encrypt result body truncated".to_string(),
            ));
        }
        Ok(Self {
            result: EResult(body.get_i32_le()),
        })
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(
            Header::Basic(BasicHeader::new(MsgType::CHANNEL_ENCRYPT_RESULT)),
            self.result.0.to_le_bytes().to_vec(),
        )
    }
}

/// What the connection should do after feeding a message to the handshake.
#[derive(Debug)]
pub enum HandshakeAction {
    /// Send this reply, unencrypted.
    Reply(Envelope),
    /// Channel is up; install this cipher for all further traffic.
    Established(CipherContext),
    /// Message was not expected in the current state and was dropped.
    Ignored,
}

/// Handshake state machine for one connection.
pub struct Handshake {
    state: HandshakeState,
    universe: Universe,
    keys: UniverseKeys,
    pending_key: Option<Zeroizing<[u8; SESSION_KEY_LEN]>>,
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("state", &self.state)
            .field("universe", &self.universe)
            .finish_non_exhaustive()
    }
}

impl Handshake {
    pub fn new(universe: Universe, keys: UniverseKeys) -> Self {
        Self {
            state: HandshakeState::Disconnected,
            universe,
            keys,
            pending_key: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Transport is up; wait for the server's challenge.
    pub fn connected(&mut self) {
        self.pending_key = None;
        self.state = HandshakeState::AwaitingEncryptRequest;
        debug!("awaiting encrypt request");
    }

    pub fn logged_on(&mut self) {
        if self.state == HandshakeState::Encrypted {
            self.state = HandshakeState::LoggedOn;
        }
    }

    pub fn logged_off(&mut self) {
        if self.state == HandshakeState::LoggedOn {
            self.state = HandshakeState::Encrypted;
        }
    }

    pub fn reset(&mut self) {
        self.pending_key = None;
        self.state = HandshakeState::Disconnected;
    }

    fn expects(&self, msg_type: MsgType) -> bool {
        match self.state {
            HandshakeState::AwaitingEncryptRequest => msg_type == MsgType::CHANNEL_ENCRYPT_REQUEST,
            HandshakeState::AwaitingEncryptResult => msg_type == MsgType::CHANNEL_ENCRYPT_RESULT,
            _ => false,
        }
    }

    /// Feed one unencrypted message received during channel setup.
    ///
    /// # Errors
    /// `ProtocolError::HandshakeError` for malformed messages, unknown or
    /// mismatched universes, version mismatches and non-OK results. The attempt
    /// is over after any error.
    #[instrument(level = "debug", skip(self, envelope), fields(msg_type = %envelope.msg_type()))]
    pub fn handle(&mut self, envelope: &Envelope) -> Result<HandshakeAction> {
        if !self.expects(envelope.msg_type()) {
            warn!(state = ?self.state, "rejected message during channel setup");
            return Ok(HandshakeAction::Ignored);
        }

        let outcome = match self.state {
            HandshakeState::AwaitingEncryptRequest => self.on_encrypt_request(envelope),
            _ => self.on_encrypt_result(envelope),
        };
        if outcome.is_err() {
            self.reset();
        }
        outcome
    }

    fn on_encrypt_request(&mut self, envelope: &Envelope) -> Result<HandshakeAction> {
        let request = EncryptRequest::parse(envelope)?;
        debug!(
            universe = ?request.universe,
            protocol_version = request.protocol_version,
            "got encryption request"
        );

        if request.protocol_version != HANDSHAKE_PROTOCOL_VERSION {
            return Err(ProtocolError::HandshakeError(
                constants::ERR_UNEXPECTED_PROTOCOL_VERSION.to_string(),
            ));
        }
        if request.universe != self.universe {
            return Err(ProtocolError::HandshakeError(format!(
                "{}: expected {:?}, got {:?}",
                constants::ERR_UNIVERSE_MISMATCH,
                self.universe,
                request.universe
            )));
        }
        if request.challenge.len() < MIN_CHALLENGE_LEN {
            return Err(ProtocolError::HandshakeError(constants::ERR_SHORT_CHALLENGE.to_string()));
        }
        let public_key = self.keys.get(request.universe).ok_or_else(|| {
            ProtocolError::HandshakeError(format!(
                "{} {:?}",
                constants::ERR_UNKNOWN_UNIVERSE,
                request.universe
            ))
        })?;

        let session_key = generate_session_key();
        let mut plain = Zeroizing::new(Vec::with_capacity(SESSION_KEY_LEN + request.challenge.len()));
        plain.extend_from_slice(&session_key[..]);
        plain.extend_from_slice(&request.challenge);

        let sealed = public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha1>(), &plain)
            .map_err(|e| ProtocolError::HandshakeError(format!("{}: {e}", constants::ERR_RSA_ENCRYPT)))?;

        let mut body = BytesMut::with_capacity(8);
        body.put_u32_le(HANDSHAKE_PROTOCOL_VERSION);
        body.put_u32_le(KEY_SIZE_FIELD);

        let mut payload = BytesMut::with_capacity(sealed.len() + 8);
        payload.put_slice(&sealed);
        payload.put_u32_le(crc32fast::hash(&sealed));
        payload.put_u32_le(0);

        let reply = Envelope::new(
            Header::Basic(BasicHeader::new(MsgType::CHANNEL_ENCRYPT_RESPONSE)),
            body.freeze(),
        )
        .with_payload(payload.freeze());

        self.pending_key = Some(session_key);
        self.state = HandshakeState::AwaitingEncryptResult;
        Ok(HandshakeAction::Reply(reply))
    }

    fn on_encrypt_result(&mut self, envelope: &Envelope) -> Result<HandshakeAction> {
        let result = EncryptResult::parse(envelope)?;
        debug!(result = %result.result, "encryption result");

        if !result.result.is_ok() {
            return Err(ProtocolError::HandshakeError(format!(
                "encryption channel setup failed: {}",
                result.result
            )));
        }
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_NO_PENDING_KEY.to_string()))?;

        self.state = HandshakeState::Encrypted;
        info!("channel encrypted");
        Ok(HandshakeAction::Established(CipherContext::new(&key)))
    }
}
