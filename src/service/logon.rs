//! Logon request building.
//!
//! Nothing here has defaults that would identify an account or a client
//! build: the caller supplies credentials and the logon protocol version.

use std::fmt;

use crate::core::emsg::MsgType;
use crate::core::envelope::Envelope;
use crate::core::proto::Logon;
use crate::error::Result;

/// Supplies the stable machine identifier sent with a logon.
pub trait MachineIdProvider: Send + Sync {
    fn machine_id(&self) -> Result<Vec<u8>>;
}

/// Fixed identifier, for tests and for callers that computed it up front.
#[derive(Debug, Clone)]
pub struct StaticMachineId(pub Vec<u8>);

impl MachineIdProvider for StaticMachineId {
    fn machine_id(&self) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

/// What to log on with.
#[derive(Clone)]
pub struct LogOnDetails {
    pub protocol_version: u32,
    pub account_id: Option<u64>,
    pub account_name: Option<String>,
    pub password: Option<String>,
    pub access_token: Option<String>,
    pub cell_id: Option<u32>,
    pub client_language: Option<String>,
    pub client_os_type: Option<u32>,
}

impl fmt::Debug for LogOnDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogOnDetails")
            .field("protocol_version", &self.protocol_version)
            .field("account_id", &self.account_id)
            .field("account_name", &self.account_name)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("cell_id", &self.cell_id)
            .finish_non_exhaustive()
    }
}

impl LogOnDetails {
    pub fn new(protocol_version: u32) -> Self {
        Self {
            protocol_version,
            account_id: None,
            account_name: None,
            password: None,
            access_token: None,
            cell_id: None,
            client_language: None,
            client_os_type: None,
        }
    }

    pub fn with_password(mut self, account_name: impl Into<String>, password: impl Into<String>) -> Self {
        self.account_name = Some(account_name.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_access_token(mut self, account_name: impl Into<String>, token: impl Into<String>) -> Self {
        self.account_name = Some(account_name.into());
        self.access_token = Some(token.into());
        self
    }

    pub fn with_account_id(mut self, account_id: u64) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn with_cell_id(mut self, cell_id: u32) -> Self {
        self.cell_id = Some(cell_id);
        self
    }

    /// Build the `ClientLogon` envelope.
    pub fn to_envelope(&self, machine_id: Option<Vec<u8>>) -> Envelope {
        let body = Logon {
            protocol_version: Some(self.protocol_version),
            cell_id: self.cell_id,
            client_language: self.client_language.clone(),
            client_os_type: self.client_os_type,
            machine_id,
            account_name: self.account_name.clone(),
            password: self.password.clone(),
            access_token: self.access_token.clone(),
        };
        let mut envelope = Envelope::proto(MsgType::CLIENT_LOGON, &body);
        if let Some(account_id) = self.account_id {
            envelope.header_mut().set_identity(account_id, 0);
        }
        envelope
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_logon_envelope() {
        let details = LogOnDetails::new(65580)
            .with_password("user", "hunter2")
            .with_account_id(0x0110_0001_0000_0001)
            .with_cell_id(4);
        let envelope = details.to_envelope(StaticMachineId(vec![1, 2, 3]).machine_id().ok());

        assert_eq!(envelope.msg_type(), MsgType::CLIENT_LOGON);
        assert_eq!(envelope.header().account_id(), Some(0x0110_0001_0000_0001));
        let body: Logon = envelope.decode_body().unwrap();
        assert_eq!(body.protocol_version, Some(65580));
        assert_eq!(body.machine_id, Some(vec![1, 2, 3]));
        assert_eq!(body.cell_id, Some(4));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let details = LogOnDetails::new(1).with_password("user", "hunter2");
        let text = format!("{details:?}");
        assert!(!text.contains("hunter2"));
        assert!(text.contains("<redacted>"));
    }
}
