//! Per-connection session identity and channel state.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::core::envelope::Envelope;
use crate::discovery::Endpoint;
use crate::error::Result;
use crate::utils::crypto::CipherContext;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Transport open, channel encryption not finished.
    Connecting,
    /// Channel encrypted, not logged on.
    Connected,
    LoggedOn,
}

/// Identity and cipher of the one live connection of a client.
///
/// Created on connect and cleared on disconnect. Frames pass through
/// unchanged until a cipher is installed; from then on every frame in either
/// direction is encrypted.
#[derive(Debug)]
pub struct Session {
    state: ConnectionState,
    endpoint: Option<Endpoint>,
    cipher: Option<CipherContext>,
    account_id: Option<u64>,
    session_id: Option<i32>,
    cell_id: Option<u32>,
    heartbeat_interval: Option<Duration>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            endpoint: None,
            cipher: None,
            account_id: None,
            session_id: None,
            cell_id: None,
            heartbeat_interval: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn account_id(&self) -> Option<u64> {
        self.account_id
    }

    pub fn session_id(&self) -> Option<i32> {
        self.session_id
    }

    pub fn cell_id(&self) -> Option<u32> {
        self.cell_id
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn is_logged_on(&self) -> bool {
        self.state == ConnectionState::LoggedOn
    }

    /// A transport to `endpoint` is open.
    pub fn begin(&mut self, endpoint: Endpoint) {
        self.clear();
        info!(%endpoint, "session started");
        self.endpoint = Some(endpoint);
        self.state = ConnectionState::Connecting;
    }

    pub fn install_cipher(&mut self, cipher: CipherContext) {
        self.cipher = Some(cipher);
        self.state = ConnectionState::Connected;
        debug!("channel cipher installed");
    }

    /// Record a successful logon.
    pub fn logged_on(
        &mut self,
        account_id: Option<u64>,
        session_id: Option<i32>,
        cell_id: Option<u32>,
        heartbeat_interval: Duration,
    ) {
        self.account_id = account_id;
        self.session_id = session_id;
        self.cell_id = cell_id.or(self.cell_id);
        self.heartbeat_interval = Some(heartbeat_interval);
        self.state = ConnectionState::LoggedOn;
        info!(account_id = ?account_id, session_id = ?session_id, "logged on");
    }

    /// Server ended the logon; the channel stays up.
    pub fn logged_off(&mut self) {
        self.account_id = None;
        self.session_id = None;
        self.heartbeat_interval = None;
        if self.state == ConnectionState::LoggedOn {
            self.state = ConnectionState::Connected;
        }
    }

    /// Forget identity, cipher and endpoint.
    pub fn clear(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.endpoint = None;
        self.cipher = None;
        self.account_id = None;
        self.session_id = None;
        self.heartbeat_interval = None;
    }

    /// Stamp the session identity on an outgoing message.
    pub fn stamp(&self, envelope: &mut Envelope) {
        if let (Some(account_id), Some(session_id)) = (self.account_id, self.session_id) {
            envelope.header_mut().set_identity(account_id, session_id);
        }
    }

    /// Encode `envelope` into a frame payload, encrypting once the channel is up.
    pub fn seal(&self, envelope: &Envelope) -> Result<Bytes> {
        let plain = envelope.encode();
        match &self.cipher {
            Some(cipher) => Ok(Bytes::from(cipher.encrypt(&plain)?)),
            None => Ok(plain),
        }
    }

    /// Decrypt a received frame payload once the channel is up.
    pub fn open(&self, frame: Bytes) -> Result<Bytes> {
        match &self.cipher {
            Some(cipher) => Ok(Bytes::from(cipher.decrypt(&frame)?)),
            None => Ok(frame),
        }
    }
}
