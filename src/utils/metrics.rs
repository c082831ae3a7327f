//! Client counters.
//!
//! Every [`Client`](crate::service::Client) owns one [`Metrics`] behind an
//! `Arc`; handles expose it read-only. Counters are relaxed atomics: a
//! [`MetricsSnapshot`] is consistent per field, not across fields.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

#[derive(Debug, Default)]
struct Counter(AtomicU64);

impl Counter {
    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    fn incr(&self) {
        self.add(1);
    }

    /// Saturates at zero.
    fn decr(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Activity counters of one client.
#[derive(Debug)]
pub struct Metrics {
    connections: Counter,
    connected: Counter,
    connection_errors: Counter,
    reconnects: Counter,
    handshakes: Counter,
    handshakes_ok: Counter,
    handshakes_failed: Counter,
    frames_out: Counter,
    frames_in: Counter,
    bytes_out: Counter,
    bytes_in: Counter,
    decode_errors: Counter,
    jobs_started: Counter,
    jobs_completed: Counter,
    jobs_timed_out: Counter,
    since: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections: Counter::default(),
            connected: Counter::default(),
            connection_errors: Counter::default(),
            reconnects: Counter::default(),
            handshakes: Counter::default(),
            handshakes_ok: Counter::default(),
            handshakes_failed: Counter::default(),
            frames_out: Counter::default(),
            frames_in: Counter::default(),
            bytes_out: Counter::default(),
            bytes_in: Counter::default(),
            decode_errors: Counter::default(),
            jobs_started: Counter::default(),
            jobs_completed: Counter::default(),
            jobs_timed_out: Counter::default(),
            since: Instant::now(),
        }
    }

    /// A transport opened.
    pub fn connection_established(&self) {
        self.connections.incr();
        self.connected.incr();
    }

    pub fn connection_closed(&self) {
        self.connected.decr();
    }

    /// A transport failed to open.
    pub fn connection_error(&self) {
        self.connection_errors.incr();
    }

    pub fn reconnect(&self) {
        self.reconnects.incr();
    }

    pub fn handshake_attempt(&self) {
        self.handshakes.incr();
    }

    pub fn handshake_success(&self) {
        self.handshakes_ok.incr();
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.incr();
    }

    /// One frame written, `len` bytes after encryption.
    pub fn frame_sent(&self, len: u64) {
        self.frames_out.incr();
        self.bytes_out.add(len);
    }

    /// One frame read, `len` bytes before decryption.
    pub fn frame_received(&self, len: u64) {
        self.frames_in.incr();
        self.bytes_in.add(len);
    }

    pub fn decode_error(&self) {
        self.decode_errors.incr();
    }

    pub fn job_started(&self) {
        self.jobs_started.incr();
    }

    pub fn job_completed(&self) {
        self.jobs_completed.incr();
    }

    pub fn jobs_timed_out(&self, count: u64) {
        self.jobs_timed_out.add(count);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections.get(),
            connections_active: self.connected.get(),
            connection_errors: self.connection_errors.get(),
            reconnects: self.reconnects.get(),
            handshakes_total: self.handshakes.get(),
            handshakes_success: self.handshakes_ok.get(),
            handshakes_failed: self.handshakes_failed.get(),
            frames_sent: self.frames_out.get(),
            frames_received: self.frames_in.get(),
            bytes_sent: self.bytes_out.get(),
            bytes_received: self.bytes_in.get(),
            decode_errors: self.decode_errors.get(),
            jobs_started: self.jobs_started.get(),
            jobs_completed: self.jobs_completed.get(),
            jobs_timed_out: self.jobs_timed_out.get(),
            uptime_seconds: self.since.elapsed().as_secs(),
        }
    }

    /// Emit the current counters as one `info` event.
    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            connections = s.connections_total,
            connection_errors = s.connection_errors,
            reconnects = s.reconnects,
            handshakes = s.handshakes_total,
            handshakes_failed = s.handshakes_failed,
            frames_sent = s.frames_sent,
            frames_received = s.frames_received,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            decode_errors = s.decode_errors,
            jobs_started = s.jobs_started,
            jobs_completed = s.jobs_completed,
            jobs_timed_out = s.jobs_timed_out,
            uptime_seconds = s.uptime_seconds,
            "client metrics"
        );
    }
}

/// Counter values at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connection_errors: u64,
    pub reconnects: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub decode_errors: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_timed_out: u64,
    pub uptime_seconds: u64,
}
