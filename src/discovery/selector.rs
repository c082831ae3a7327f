//! Load-based server selection.
//!
//! Every candidate is probed at once. The least loaded server that answers
//! inside the discovery window is chosen.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::config::DiscoveryConfig;
use crate::discovery::endpoint::Endpoint;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::udp::probe_load;
use crate::utils::backoff::ExponentialBackoff;

/// Asks one server how busy it is.
#[async_trait]
pub trait LoadProbe: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> Result<u32>;
}

/// UDP challenge probe: the `Challenge` reply carries the server load.
#[derive(Debug, Clone)]
pub struct UdpLoadProbe {
    timeout: Duration,
}

impl UdpLoadProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl LoadProbe for UdpLoadProbe {
    async fn probe(&self, endpoint: &Endpoint) -> Result<u32> {
        probe_load(endpoint.address(), self.timeout).await
    }
}

/// Reports the same load for every endpoint.
///
/// Used for transports without a load probe; the first candidate wins.
#[derive(Debug, Clone, Default)]
pub struct StaticLoadProbe {
    load: u32,
}

impl StaticLoadProbe {
    pub fn new(load: u32) -> Self {
        Self { load }
    }
}

#[async_trait]
impl LoadProbe for StaticLoadProbe {
    async fn probe(&self, _endpoint: &Endpoint) -> Result<u32> {
        Ok(self.load)
    }
}

/// Picks the server to connect to.
#[derive(Clone)]
pub struct Selector {
    probe: Arc<dyn LoadProbe>,
    window: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("window", &self.window)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

impl Selector {
    pub fn new(probe: Arc<dyn LoadProbe>, config: &DiscoveryConfig) -> Self {
        Self {
            probe,
            window: config.window,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Probe `candidates` until one answers, retrying whole rounds with backoff.
    #[instrument(skip(self, candidates), fields(candidates = candidates.len()))]
    pub async fn discover(&self, candidates: &[Endpoint]) -> Result<Endpoint> {
        if candidates.is_empty() {
            return Err(ProtocolError::ConnectionFailed(
                constants::ERR_NO_CANDIDATES.to_string(),
            ));
        }

        let mut backoff = ExponentialBackoff::new(
            self.retry_delay,
            self.retry_delay.saturating_mul(8),
            Some(self.max_retries),
        )
        .with_jitter();

        loop {
            if let Some(chosen) = self.round(candidates).await {
                info!(endpoint = %chosen, load = ?chosen.load(), "server selected");
                return Ok(chosen);
            }
            match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "no server answered discovery, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(ProtocolError::ConnectionFailed(
                        constants::ERR_DISCOVERY_EXHAUSTED.to_string(),
                    ))
                }
            }
        }
    }

    /// One probe round. Replies after the window are never looked at.
    async fn round(&self, candidates: &[Endpoint]) -> Option<Endpoint> {
        let mut probes: FuturesUnordered<_> = candidates
            .iter()
            .map(|endpoint| async move { (endpoint, self.probe.probe(endpoint).await) })
            .collect();

        let window = tokio::time::sleep(self.window);
        tokio::pin!(window);

        let mut best: Option<(u32, &Endpoint)> = None;
        loop {
            tokio::select! {
                _ = &mut window => break,
                reply = probes.next() => match reply {
                    Some((endpoint, Ok(load))) => {
                        debug!(%endpoint, load, "probe answered");
                        // Strict: the first reply keeps a tie.
                        if best.map_or(true, |(lowest, _)| load < lowest) {
                            best = Some((load, endpoint));
                        }
                    }
                    Some((endpoint, Err(e))) => debug!(%endpoint, error = %e, "probe failed"),
                    None => break,
                },
            }
        }

        best.map(|(load, endpoint)| endpoint.clone().with_load(load))
    }
}
