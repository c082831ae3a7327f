//! Known servers, their health, and where the learned list is kept.

use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::core::proto::CmList;
use crate::discovery::endpoint::{Endpoint, Quality};
use crate::error::{ProtocolError, Result};
use crate::transport::TransportKind;

/// How long a bad mark keeps an endpoint behind the good ones.
pub const BAD_CONNECTION_MEMORY: Duration = Duration::from_secs(5 * 60);

/// Persistence for the learned server list.
pub trait EndpointStore: Send + Sync {
    /// Previously saved endpoints. An empty list when nothing was saved yet.
    fn load(&self) -> Result<Vec<Endpoint>>;

    fn save(&self, endpoints: &[Endpoint]) -> Result<()>;
}

/// Keeps the list in memory only.
#[derive(Debug, Clone, Default)]
pub struct MemoryEndpointStore {
    endpoints: Arc<Mutex<Vec<Endpoint>>>,
}

impl MemoryEndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// What was last saved.
    pub fn snapshot(&self) -> Vec<Endpoint> {
        self.endpoints
            .lock()
            .map(|list| list.clone())
            .unwrap_or_default()
    }
}

impl EndpointStore for MemoryEndpointStore {
    fn load(&self) -> Result<Vec<Endpoint>> {
        Ok(self.snapshot())
    }

    fn save(&self, endpoints: &[Endpoint]) -> Result<()> {
        let mut list = self
            .endpoints
            .lock()
            .map_err(|_| ProtocolError::Custom("endpoint store lock poisoned".into()))?;
        *list = endpoints.to_vec();
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredList {
    #[serde(default)]
    servers: Vec<Endpoint>,
}

/// Keeps the list in a TOML file.
#[derive(Debug, Clone)]
pub struct FileEndpointStore {
    path: PathBuf,
}

impl FileEndpointStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EndpointStore for FileEndpointStore {
    fn load(&self) -> Result<Vec<Endpoint>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let stored: StoredList = toml::from_str(&content).map_err(|e| {
            ProtocolError::ConfigError(format!("Failed to parse server list: {e}"))
        })?;
        Ok(stored.servers)
    }

    fn save(&self, endpoints: &[Endpoint]) -> Result<()> {
        let stored = StoredList {
            servers: endpoints.to_vec(),
        };
        let content = toml::to_string_pretty(&stored).map_err(|e| {
            ProtocolError::ConfigError(format!("Failed to serialize server list: {e}"))
        })?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ServerEntry {
    endpoint: Endpoint,
    last_bad: Option<Instant>,
}

/// Every server the client knows about, in the order it learned them.
///
/// Bad marks fade after [`BAD_CONNECTION_MEMORY`]. Candidates never marked
/// bad come first, then the ones marked bad longest ago.
pub struct Directory {
    servers: Vec<ServerEntry>,
    store: Box<dyn EndpointStore>,
    bad_memory: Duration,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("servers", &self.servers.len())
            .field("bad_memory", &self.bad_memory)
            .finish()
    }
}

impl Directory {
    /// Start from the stored list, or from `seeds` when nothing was stored.
    pub fn new(seeds: Vec<Endpoint>, store: Box<dyn EndpointStore>) -> Self {
        let stored = match store.load() {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "failed to load stored server list");
                Vec::new()
            }
        };
        let initial = if stored.is_empty() { seeds } else { stored };

        let mut directory = Self {
            servers: Vec::new(),
            store,
            bad_memory: BAD_CONNECTION_MEMORY,
        };
        directory.fill(initial);
        debug!(servers = directory.servers.len(), "server directory ready");
        directory
    }

    /// Seeds and store as the discovery section describes them.
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        let store: Box<dyn EndpointStore> = match &config.store_path {
            Some(path) => Box::new(FileEndpointStore::new(path)),
            None => Box::new(MemoryEndpointStore::new()),
        };
        Self::new(seed_endpoints(config), store)
    }

    pub fn with_bad_memory(mut self, bad_memory: Duration) -> Self {
        self.bad_memory = bad_memory;
        self
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.servers.iter().map(|s| s.endpoint.clone()).collect()
    }

    /// Swap in a list pushed by the server and persist it.
    ///
    /// Duplicates are dropped. An empty list leaves the directory unchanged.
    pub fn replace_list(&mut self, endpoints: Vec<Endpoint>) {
        if endpoints.is_empty() {
            warn!("ignoring empty server list");
            return;
        }
        self.servers.clear();
        self.fill(endpoints);
        info!(servers = self.servers.len(), "server list replaced");

        if let Err(e) = self.store.save(&self.endpoints()) {
            warn!(error = %e, "failed to persist server list");
        }
    }

    /// Record how a connection to `endpoint` went.
    ///
    /// `Good` clears the mark of that exact endpoint. `Bad` marks every
    /// endpoint on the same host. Returns false when the endpoint is unknown.
    pub fn mark(&mut self, endpoint: &Endpoint, quality: Quality) -> bool {
        let now = Instant::now();
        let mut found = false;
        match quality {
            Quality::Good => {
                for entry in self.servers.iter_mut().filter(|s| s.endpoint.same_server(endpoint)) {
                    entry.last_bad = None;
                    entry.endpoint.set_quality(Quality::Good);
                    found = true;
                }
            }
            Quality::Bad => {
                let host = endpoint.host();
                for entry in self
                    .servers
                    .iter_mut()
                    .filter(|s| s.endpoint.host().eq_ignore_ascii_case(host))
                {
                    entry.last_bad = Some(now);
                    entry.endpoint.set_quality(Quality::Bad);
                    found = true;
                }
            }
        }
        debug!(%endpoint, ?quality, found, "endpoint marked");
        found
    }

    /// Endpoints usable with `kind`, good ones first.
    pub fn candidates(&mut self, kind: TransportKind) -> Vec<Endpoint> {
        self.forget_old_marks();

        let mut matching: Vec<&ServerEntry> =
            self.servers.iter().filter(|s| s.endpoint.kind() == kind).collect();
        // Stable: ties keep directory order.
        matching.sort_by_key(|s| s.last_bad);
        matching.into_iter().map(|s| s.endpoint.clone()).collect()
    }

    /// Clear every bad mark.
    pub fn reset_bad(&mut self) {
        for entry in &mut self.servers {
            entry.last_bad = None;
            entry.endpoint.set_quality(Quality::Good);
        }
    }

    fn forget_old_marks(&mut self) {
        let Some(cutoff) = Instant::now().checked_sub(self.bad_memory) else {
            return;
        };
        for entry in &mut self.servers {
            if entry.last_bad.is_some_and(|t| t < cutoff) {
                entry.last_bad = None;
                entry.endpoint.set_quality(Quality::Good);
            }
        }
    }

    fn fill(&mut self, endpoints: Vec<Endpoint>) {
        for mut endpoint in endpoints {
            if self.servers.iter().any(|s| s.endpoint.same_server(&endpoint)) {
                continue;
            }
            endpoint.set_quality(Quality::Good);
            endpoint.set_load(None);
            self.servers.push(ServerEntry {
                endpoint,
                last_bad: None,
            });
        }
    }
}

/// Socket seeds become TCP and UDP endpoints, WebSocket seeds stay WebSocket.
pub fn seed_endpoints(config: &DiscoveryConfig) -> Vec<Endpoint> {
    let mut endpoints = Vec::new();
    for address in &config.seed_servers {
        endpoints.push(Endpoint::new(address.clone(), TransportKind::Tcp));
        endpoints.push(Endpoint::new(address.clone(), TransportKind::Udp));
    }
    for address in &config.seed_websocket_servers {
        endpoints.push(Endpoint::new(address.clone(), TransportKind::WebSocket));
    }
    endpoints
}

/// Endpoints announced in a server-pushed list.
pub fn endpoints_from_cm_list(list: &CmList) -> Vec<Endpoint> {
    let mut endpoints = Vec::new();
    for (&ip, &port) in list.cm_addresses.iter().zip(&list.cm_ports) {
        let Ok(port) = u16::try_from(port) else {
            warn!(port, "skipping server with invalid port");
            continue;
        };
        let address = SocketAddrV4::new(Ipv4Addr::from(ip), port).to_string();
        endpoints.push(Endpoint::new(address.clone(), TransportKind::Tcp));
        endpoints.push(Endpoint::new(address, TransportKind::Udp));
    }
    for address in &list.cm_websocket_addresses {
        endpoints.push(Endpoint::new(address.clone(), TransportKind::WebSocket));
    }
    endpoints
}
