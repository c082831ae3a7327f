//! A server the client can connect to.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;

/// Last known health of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Good,
    Bad,
}

/// Address plus transport of one Connection Manager.
///
/// `address` is `host:port` for TCP and UDP, and the WebSocket host (with
/// optional port) for WebSocket endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    address: String,
    kind: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    load: Option<u32>,
    #[serde(default)]
    quality: Quality,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            address: address.into(),
            kind,
            load: None,
            quality: Quality::Good,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Load score reported by the last discovery probe.
    pub fn load(&self) -> Option<u32> {
        self.load
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn with_load(mut self, load: u32) -> Self {
        self.load = Some(load);
        self
    }

    pub fn set_load(&mut self, load: Option<u32>) {
        self.load = load;
    }

    pub fn set_quality(&mut self, quality: Quality) {
        self.quality = quality;
    }

    /// Host part of the address, without port or IPv6 brackets.
    pub fn host(&self) -> &str {
        let address = self.address.as_str();
        if let Some(rest) = address.strip_prefix('[') {
            return rest.split_once(']').map_or(rest, |(host, _)| host);
        }
        match address.rsplit_once(':') {
            // A bare IPv6 address has more than one colon and no port.
            Some((host, _)) if !host.contains(':') => host,
            _ => address,
        }
    }

    /// Same server, regardless of load or quality.
    pub fn same_server(&self, other: &Endpoint) -> bool {
        self.kind == other.kind && self.address.eq_ignore_ascii_case(&other.address)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.address)
    }
}
